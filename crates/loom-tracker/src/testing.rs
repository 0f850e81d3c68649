// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Test doubles shared by the engine's unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use loom_tracker_core::{EventParams, EventRecord, SequenceId};
use url::{form_urlencoded, Url};

use crate::diagnostics::DiagnosticsSink;
use crate::encoder::{EncodedRequest, RequestBody};
use crate::error::StorageError;
use crate::store::{Backlog, MemoryStore, PersistentStore};
use crate::transport::{DeliveryOutcome, StatusInfo, Transport};

/// Parameters tagged with a marker so tests can tell requests apart.
pub fn params(marker: &str) -> EventParams {
	EventParams::new().with("idsite", "1").with("n", marker)
}

/// The `n` markers contained in a request body, in order.
pub fn markers(body: &RequestBody) -> Vec<String> {
	fn marker_of(query: &str) -> Option<String> {
		form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
			.find(|(k, _)| k == "n")
			.map(|(_, v)| v.into_owned())
	}

	match body {
		RequestBody::Json(json) => {
			let value: serde_json::Value = serde_json::from_str(json).unwrap();
			value["requests"]
				.as_array()
				.unwrap()
				.iter()
				.filter_map(|q| q.as_str().and_then(marker_of))
				.collect()
		}
		RequestBody::Form(form) => {
			let pairs: Vec<(String, String)> =
				form_urlencoded::parse(form.as_bytes()).into_owned().collect();
			if pairs.iter().any(|(k, _)| k.starts_with("requests[")) {
				pairs
					.iter()
					.filter(|(k, _)| k.starts_with("requests["))
					.filter_map(|(_, v)| marker_of(v))
					.collect()
			} else {
				marker_of(form).into_iter().collect()
			}
		}
	}
}

/// Memory store whose writes can be made to fail.
#[derive(Debug, Default)]
pub struct FailingStore {
	inner: MemoryStore,
	fail_writes: AtomicBool,
}

impl FailingStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn fail_writes(&self, fail: bool) {
		self.fail_writes.store(fail, Ordering::SeqCst);
	}

	fn check(&self) -> Result<(), StorageError> {
		if self.fail_writes.load(Ordering::SeqCst) {
			Err(StorageError::Unavailable("disk full".to_string()))
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl PersistentStore for FailingStore {
	async fn append(&self, record: &EventRecord) -> Result<(), StorageError> {
		self.check()?;
		self.inner.append(record).await
	}

	async fn delete_by_ids(&self, ids: &[SequenceId]) -> Result<u64, StorageError> {
		self.check()?;
		self.inner.delete_by_ids(ids).await
	}

	async fn load_all(&self) -> Result<Backlog, StorageError> {
		self.inner.load_all().await
	}

	async fn clear_all(&self) -> Result<(), StorageError> {
		self.check()?;
		self.inner.clear_all().await
	}

	async fn load_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
		self.inner.load_setting(key).await
	}

	async fn save_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
		self.check()?;
		self.inner.save_setting(key, value).await
	}
}

/// Transport that records every request and answers from a script.
///
/// Once the script runs out every request is `Delivered`.
#[derive(Debug, Default)]
pub struct RecordingTransport {
	script: Mutex<VecDeque<DeliveryOutcome>>,
	requests: Mutex<Vec<(Url, RequestBody)>>,
	delay: Option<Duration>,
	in_flight: AtomicUsize,
	max_in_flight: AtomicUsize,
}

impl RecordingTransport {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_outcomes(outcomes: impl IntoIterator<Item = DeliveryOutcome>) -> Self {
		Self {
			script: Mutex::new(outcomes.into_iter().collect()),
			..Self::default()
		}
	}

	/// Every post sleeps this long before answering.
	pub fn with_delay(mut self, delay: Duration) -> Self {
		self.delay = Some(delay);
		self
	}

	pub fn bodies(&self) -> Vec<RequestBody> {
		self.requests
			.lock()
			.unwrap()
			.iter()
			.map(|(_, body)| body.clone())
			.collect()
	}

	pub fn endpoints(&self) -> Vec<Url> {
		self.requests
			.lock()
			.unwrap()
			.iter()
			.map(|(url, _)| url.clone())
			.collect()
	}

	pub fn request_count(&self) -> usize {
		self.requests.lock().unwrap().len()
	}

	/// Markers of every request, one inner vec per request.
	pub fn sent(&self) -> Vec<Vec<String>> {
		self.bodies().iter().map(markers).collect()
	}

	pub fn max_in_flight(&self) -> usize {
		self.max_in_flight.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl Transport for RecordingTransport {
	async fn post(&self, endpoint: &Url, body: &RequestBody) -> DeliveryOutcome {
		let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_in_flight.fetch_max(now, Ordering::SeqCst);

		self.requests
			.lock()
			.unwrap()
			.push((endpoint.clone(), body.clone()));
		if let Some(delay) = self.delay {
			tokio::time::sleep(delay).await;
		}

		self.in_flight.fetch_sub(1, Ordering::SeqCst);
		self.script
			.lock()
			.unwrap()
			.pop_front()
			.unwrap_or(DeliveryOutcome::Delivered)
	}
}

/// Diagnostics sink that keeps everything it is told.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
	pub rejected: Mutex<Vec<(Vec<SequenceId>, StatusInfo)>>,
	pub debug_requests: Mutex<Vec<EncodedRequest>>,
	pub failures: Mutex<Vec<(Vec<SequenceId>, Duration)>>,
	pub storage: Mutex<Vec<&'static str>>,
}

impl RecordingDiagnostics {
	pub fn new() -> Self {
		Self::default()
	}
}

impl DiagnosticsSink for RecordingDiagnostics {
	fn batch_rejected(&self, ids: &[SequenceId], status: &StatusInfo) {
		self.rejected
			.lock()
			.unwrap()
			.push((ids.to_vec(), status.clone()));
	}

	fn debug_request(&self, _endpoint: &Url, request: &EncodedRequest) {
		self.debug_requests.lock().unwrap().push(request.clone());
	}

	fn delivery_failed(&self, ids: &[SequenceId], _reason: &str, retry_in: Duration) {
		self.failures.lock().unwrap().push((ids.to_vec(), retry_in));
	}

	fn storage_failed(&self, operation: &'static str, _error: &StorageError) {
		self.storage.lock().unwrap().push(operation);
	}
}
