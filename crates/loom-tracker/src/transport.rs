// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery of encoded requests to the collector.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use loom_common_http::{status_is_retryable, RetryableError};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::encoder::RequestBody;
use crate::error::{Result, TrackerError};

/// Path of the tracking endpoint below the collector base URL.
pub const TRACKING_PATH: &str = "piwik.php";

/// Upper bound on how much of a rejection body is kept for diagnostics.
const MAX_MESSAGE_BYTES: usize = 512;

/// Status information for a request the collector refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
	pub status: u16,
	pub message: String,
}

impl fmt::Display for StatusInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.message.is_empty() {
			write!(f, "HTTP {}", self.status)
		} else {
			write!(f, "HTTP {}: {}", self.status, self.message)
		}
	}
}

/// How a single delivery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
	/// Accepted by the collector.
	Delivered,
	/// Refused for good. The records are dropped after a diagnostic.
	RejectedByServer(StatusInfo),
	/// Might work later. The records stay queued and backoff applies.
	TransportFailure(String),
}

impl DeliveryOutcome {
	/// Maps a response status onto an outcome.
	pub fn from_status(status: u16, message: impl Into<String>) -> Self {
		if (200..300).contains(&status) {
			DeliveryOutcome::Delivered
		} else if status_is_retryable(status) {
			DeliveryOutcome::TransportFailure(format!("collector returned HTTP {status}"))
		} else {
			DeliveryOutcome::RejectedByServer(StatusInfo {
				status,
				message: message.into(),
			})
		}
	}
}

/// Sends one encoded request to the collector.
///
/// Implementations never fail: every error is folded into an outcome.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn post(&self, endpoint: &Url, body: &RequestBody) -> DeliveryOutcome;
}

/// Collector endpoint for a base URL, e.g. `https://stats.example.com/piwik.php`.
pub fn tracking_endpoint(base_url: &str) -> Result<Url> {
	let trimmed = base_url.trim();
	if trimmed.is_empty() {
		return Err(TrackerError::InvalidBaseUrl("base URL is empty".to_string()));
	}
	// Without a trailing slash `join` would replace the last path segment.
	let base = format!("{}/", trimmed.trim_end_matches('/'));
	let base = Url::parse(&base).map_err(|e| TrackerError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
	if !matches!(base.scheme(), "http" | "https") {
		return Err(TrackerError::InvalidBaseUrl(format!(
			"{base_url}: unsupported scheme '{}'",
			base.scheme()
		)));
	}
	base
		.join(TRACKING_PATH)
		.map_err(|e| TrackerError::InvalidBaseUrl(format!("{base_url}: {e}")))
}

/// `reqwest` transport built on the shared Loom HTTP client settings.
#[derive(Debug, Clone)]
pub struct HttpTransport {
	client: Client,
}

impl HttpTransport {
	pub fn new(timeout: Duration) -> Result<Self> {
		let client = loom_common_http::builder().timeout(timeout).build()?;
		Ok(Self { client })
	}

	pub fn with_client(client: Client) -> Self {
		Self { client }
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn post(&self, endpoint: &Url, body: &RequestBody) -> DeliveryOutcome {
		debug!(url = %endpoint, bytes = body.as_str().len(), "Posting tracking request");

		let result = self
			.client
			.post(endpoint.clone())
			.header(CONTENT_TYPE, body.content_type())
			.body(body.as_str().to_owned())
			.send()
			.await;

		let response = match result {
			Ok(response) => response,
			Err(e) if e.is_retryable() => return DeliveryOutcome::TransportFailure(e.to_string()),
			// A request that could not even be built will never succeed.
			Err(e) => {
				return DeliveryOutcome::RejectedByServer(StatusInfo {
					status: e.status().map(|s| s.as_u16()).unwrap_or(0),
					message: e.to_string(),
				})
			}
		};

		let status = response.status().as_u16();
		if response.status().is_success() {
			return DeliveryOutcome::Delivered;
		}

		let mut message = response.text().await.unwrap_or_default();
		if message.len() > MAX_MESSAGE_BYTES {
			let mut cut = MAX_MESSAGE_BYTES;
			while !message.is_char_boundary(cut) {
				cut -= 1;
			}
			message.truncate(cut);
		}
		DeliveryOutcome::from_status(status, message)
	}
}
