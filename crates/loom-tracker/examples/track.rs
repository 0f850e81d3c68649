// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Example: Track a few events and flush them to a collector.
//!
//! Run with:
//!   LOOM_TRACKER_BASE_URL=https://stats.example.com LOOM_TRACKER_SITE_ID=1 \
//!     cargo run --example track -p loom-tracker
//!
//! Set `LOOM_TRACKER_DEBUG=true` to render requests instead of sending them,
//! and `RUST_LOG=loom_tracker=debug` to see dispatch activity.

use std::path::PathBuf;

use loom_tracker::{TrackerBuilder, TrackerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loom_tracker=info")),
		)
		.init();

	let config_path = std::env::var("LOOM_TRACKER_CONFIG").ok().map(PathBuf::from);
	let config = TrackerConfig::load(config_path.as_deref())?;

	println!("Initializing tracker...");
	println!("  Config: {config:?}");

	let tracker = TrackerBuilder::from_config(config)
		.app_name("tracker-example")
		.app_version(env!("CARGO_PKG_VERSION"))
		.build()
		.await?;

	println!("  Client ID: {}", tracker.visitor().client_id);
	println!("  Queued from previous runs: {}", tracker.queued_event_count().await);

	tracker.send_view("home").await;
	tracker.send_views(["settings", "privacy"]).await;
	tracker.send_event("video", "play", Some("intro")).await;
	tracker.send_exception("example error", false).await;
	tracker
		.send_social_interaction("like", "loom", "example-network")
		.await;
	tracker.send_goal("signup", 10).await;
	tracker.send_search("rust async", Some("docs"), Some(12)).await;

	println!("\nFlushing {} events...", tracker.queued_event_count().await);
	match tracker.flush().await {
		Some(report) => {
			println!("  Requests: {}", report.requests);
			println!("  Delivered: {}", report.delivered);
			println!("  Rejected: {}", report.rejected);
			if let Some(failure) = report.failure {
				println!("  Stopped early: {failure}");
			}
		}
		None => println!("  Nothing flushed (busy, backing off, or empty)"),
	}

	tracker.shutdown().await;
	println!(
		"\nDone. {} events remain queued.",
		tracker.queued_event_count().await
	);

	Ok(())
}
