// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Diagnostics hook for dispatch events that are never surfaced to callers.

use std::sync::Arc;
use std::time::Duration;

use loom_tracker_core::SequenceId;
use tracing::{error, info, warn};
use url::Url;

use crate::encoder::EncodedRequest;
use crate::error::StorageError;
use crate::transport::StatusInfo;

/// Receives what the dispatcher would otherwise only log.
///
/// Called on the dispatch path; implementations should return quickly.
pub trait DiagnosticsSink: Send + Sync + 'static {
	/// The collector refused a batch. Its records have been dropped.
	fn batch_rejected(&self, ids: &[SequenceId], status: &StatusInfo);

	/// Debug mode rendered a request instead of sending it.
	fn debug_request(&self, endpoint: &Url, request: &EncodedRequest);

	/// A delivery attempt failed and will be retried after `retry_in`.
	fn delivery_failed(&self, _ids: &[SequenceId], _reason: &str, _retry_in: Duration) {}

	/// The store failed. `operation` is `remove` during dispatch, or `load` /
	/// `delete_corrupt` for unreadable backlog rows found at startup.
	fn storage_failed(&self, _operation: &'static str, _error: &StorageError) {}
}

/// Type alias for a shared diagnostics sink.
pub type SharedDiagnostics = Arc<dyn DiagnosticsSink>;

/// Writes diagnostics to `tracing`. Used when nothing else is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
	fn batch_rejected(&self, ids: &[SequenceId], status: &StatusInfo) {
		warn!(
			count = ids.len(),
			first_id = ids.first().map(|id| id.0),
			status = status.status,
			message = %status.message,
			"Collector rejected batch, dropping records"
		);
	}

	fn debug_request(&self, endpoint: &Url, request: &EncodedRequest) {
		info!(
			url = %endpoint,
			content_type = request.body.content_type(),
			count = request.ids.len(),
			body = request.body.as_str(),
			"Debug mode: request not sent"
		);
	}

	fn delivery_failed(&self, ids: &[SequenceId], reason: &str, retry_in: Duration) {
		error!(
			count = ids.len(),
			reason,
			retry_in_secs = retry_in.as_secs_f64(),
			"Failed to deliver tracking request"
		);
	}

	fn storage_failed(&self, operation: &'static str, error: &StorageError) {
		error!(operation, error = %error, "Tracker storage failure");
	}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpDiagnostics;

impl DiagnosticsSink for NoOpDiagnostics {
	fn batch_rejected(&self, _ids: &[SequenceId], _status: &StatusInfo) {}

	fn debug_request(&self, _endpoint: &Url, _request: &EncodedRequest) {}
}
