// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Analytics tracker for Loom applications.
//!
//! Events are built into collector parameters, written to a durable local
//! queue and delivered to a Piwik-compatible collector in the background.
//! Delivery is at-least-once and in enqueue order.
//!
//! # Features
//!
//! - **Durable Queue**: SQLite-backed, survives restarts, bounded (drops newest when full)
//! - **Dispatch Modes**: periodic timer, continuous, or manual only
//! - **Bulk Requests**: current JSON or legacy form schema, with single-request fallback
//! - **Backoff**: exponential with jitter after transport failures
//! - **Opt-out and Sampling**: applied before anything is stored
//!
//! # Example
//!
//! ```ignore
//! use loom_tracker::Tracker;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tracker = Tracker::builder()
//!         .base_url("https://stats.example.com")
//!         .site_id("3")
//!         .app_name("my-app")
//!         .build()
//!         .await?;
//!
//!     tracker.send_view("home").await;
//!     tracker.send_event("video", "play", Some("intro")).await;
//!
//!     // Drain before exit.
//!     tracker.flush().await;
//!     tracker.shutdown().await;
//!     Ok(())
//! }
//! ```

mod config;
mod diagnostics;
mod encoder;
mod error;
mod queue;
mod scheduler;
mod store;
mod tracker;
mod transport;

#[cfg(test)]
mod testing;

pub use config::{
	BulkEncoding, DispatchInterval, TrackerConfig, MAX_BACKOFF_SECS, MAX_DISPATCH_PERIOD,
	MIN_DISPATCH_PERIOD,
};
pub use diagnostics::{DiagnosticsSink, NoOpDiagnostics, SharedDiagnostics, TracingDiagnostics};
pub use encoder::{query_string, BatchEncoder, EncodedRequest, RequestBody};
pub use error::{ConfigError, Result, StorageError, TrackerError};
pub use queue::{DurableQueue, Enqueued};
pub use scheduler::{DispatchSettings, DispatchState, Dispatcher, DispatcherParts, FlushReport};
pub use store::{
	Backlog, CorruptRecord, MemoryStore, PersistentStore, SqliteStore, OPT_OUT_KEY, VISITOR_KEY,
};
pub use tracker::{TrackOutcome, Tracker, TrackerBuilder};
pub use transport::{
	tracking_endpoint, DeliveryOutcome, HttpTransport, StatusInfo, Transport, TRACKING_PATH,
};

// Re-export core types for convenience
pub use loom_common_http::RetryConfig;
pub use loom_tracker_core::{
	BuilderError, BuilderSettings, EventParams, EventRecord, ParamValue, PiwikRecordBuilder,
	RecordBuilder, SampleRate, SequenceId, TrackedEvent, VisitContext, VisitorState,
};
