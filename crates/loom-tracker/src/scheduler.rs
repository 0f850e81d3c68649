// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Dispatch scheduling: when to flush, one flush at a time, backoff after failures.
//!
//! A flush cycle runs as its own task and keeps sending batches until the queue
//! is empty, a delivery fails with a transport error, or the dispatcher stops.
//! The `in_flight` flag is claimed before the task is spawned and released
//! when it ends, so timer and manual triggers collapse into one cycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use loom_common_http::RetryConfig;
use loom_tracker_core::SequenceId;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{DispatchInterval, MAX_BACKOFF_SECS};
use crate::diagnostics::SharedDiagnostics;
use crate::encoder::BatchEncoder;
use crate::queue::DurableQueue;
use crate::transport::{DeliveryOutcome, Transport};

const DEFAULT_INTERVAL_SECS: u64 = 120;
const DEFAULT_EVENTS_PER_REQUEST: usize = 20;
const MAX_BACKOFF: Duration = Duration::from_secs(MAX_BACKOFF_SECS);

/// Settings read at the start of every batch, so changes apply to the next one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchSettings {
	pub interval: DispatchInterval,
	pub events_per_request: usize,
	pub debug: bool,
}

impl Default for DispatchSettings {
	fn default() -> Self {
		Self {
			interval: DispatchInterval::Every(Duration::from_secs(DEFAULT_INTERVAL_SECS)),
			events_per_request: DEFAULT_EVENTS_PER_REQUEST,
			debug: false,
		}
	}
}

/// Observable state of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
	Idle,
	/// Backing off after a failed delivery.
	Waiting,
	Flushing,
	/// Disposed. No new cycles start.
	Stopped,
}

/// What one flush cycle achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
	/// Requests sent (or rendered, in debug mode).
	pub requests: usize,
	/// Records accepted by the collector and removed.
	pub delivered: usize,
	/// Records refused by the collector and removed.
	pub rejected: usize,
	/// Why the cycle stopped with records still queued.
	pub failure: Option<String>,
}

impl FlushReport {
	pub fn is_complete(&self) -> bool {
		self.failure.is_none()
	}
}

#[derive(Debug, Default)]
struct Backoff {
	consecutive_failures: u32,
	next_eligible_at: Option<Instant>,
}

struct DispatcherInner {
	queue: Arc<DurableQueue>,
	transport: Arc<dyn Transport>,
	encoder: BatchEncoder,
	endpoint: Url,
	diagnostics: SharedDiagnostics,
	retry: RetryConfig,
	settings: watch::Sender<DispatchSettings>,
	in_flight: watch::Sender<bool>,
	backoff: Mutex<Backoff>,
	wake: Notify,
	cancel: CancellationToken,
}

/// Everything a [`Dispatcher`] needs besides its settings.
pub struct DispatcherParts {
	pub queue: Arc<DurableQueue>,
	pub transport: Arc<dyn Transport>,
	pub encoder: BatchEncoder,
	pub endpoint: Url,
	pub diagnostics: SharedDiagnostics,
	pub retry: RetryConfig,
}

/// Owns the timer task and starts flush cycles.
///
/// Dropping the dispatcher stops the timer; use [`Dispatcher::shutdown`] to also
/// wait for an in-flight cycle.
pub struct Dispatcher {
	inner: Arc<DispatcherInner>,
	timer: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
	/// Starts the dispatcher and its timer task. Must be called inside a Tokio runtime.
	pub fn start(parts: DispatcherParts, settings: DispatchSettings) -> Self {
		let (in_flight, _) = watch::channel(false);
		let (settings, _) = watch::channel(DispatchSettings {
			interval: settings.interval.normalized(),
			events_per_request: settings.events_per_request.max(1),
			..settings
		});

		let inner = Arc::new(DispatcherInner {
			queue: parts.queue,
			transport: parts.transport,
			encoder: parts.encoder,
			endpoint: parts.endpoint,
			diagnostics: parts.diagnostics,
			retry: parts.retry,
			settings,
			in_flight,
			backoff: Mutex::new(Backoff::default()),
			wake: Notify::new(),
			cancel: CancellationToken::new(),
		});

		let timer = tokio::spawn(run_timer(Arc::clone(&inner)));

		Self {
			inner,
			timer: Mutex::new(Some(timer)),
		}
	}

	/// Starts a flush cycle in the background.
	///
	/// Returns `true` if a cycle started; `false` if one is already running,
	/// nothing is queued, backoff has not elapsed or the dispatcher is stopped.
	pub async fn dispatch(&self) -> bool {
		begin_cycle(&self.inner).await.is_some()
	}

	/// Like [`Dispatcher::dispatch`], but waits for the cycle to finish.
	pub async fn flush(&self) -> Option<FlushReport> {
		let handle = begin_cycle(&self.inner).await?;
		match handle.await {
			Ok(report) => Some(report),
			Err(e) => {
				error!(error = %e, "Flush cycle task failed");
				None
			}
		}
	}

	/// Wakes the timer loop after an enqueue. Only continuous mode reacts.
	pub fn notify_enqueued(&self) {
		self.inner.wake.notify_one();
	}

	pub fn settings(&self) -> DispatchSettings {
		*self.inner.settings.borrow()
	}

	/// Applies `update` to the live settings. The timer re-arms on interval changes.
	pub fn update_settings(&self, update: impl FnOnce(&mut DispatchSettings)) {
		self.inner.settings.send_modify(|settings| {
			update(settings);
			settings.interval = settings.interval.normalized();
			settings.events_per_request = settings.events_per_request.max(1);
		});
	}

	pub fn state(&self) -> DispatchState {
		if self.inner.cancel.is_cancelled() {
			DispatchState::Stopped
		} else if *self.inner.in_flight.borrow() {
			DispatchState::Flushing
		} else if self.inner.backoff_deadline().is_some() {
			DispatchState::Waiting
		} else {
			DispatchState::Idle
		}
	}

	pub fn is_stopped(&self) -> bool {
		self.inner.cancel.is_cancelled()
	}

	/// Resolves once no flush cycle is running.
	pub async fn wait_idle(&self) {
		let mut in_flight = self.inner.in_flight.subscribe();
		let _ = in_flight.wait_for(|busy| !*busy).await;
	}

	/// Stops the timer, refuses new cycles and waits for a running cycle to
	/// apply its outcome. Safe to call more than once.
	pub async fn shutdown(&self) {
		let already_stopped = self.inner.cancel.is_cancelled();
		self.inner.cancel.cancel();

		self.wait_idle().await;

		let timer = self
			.timer
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(timer) = timer {
			if let Err(e) = timer.await {
				warn!(error = %e, "Dispatcher timer task ended abnormally");
			}
		}

		if !already_stopped {
			info!("Dispatcher stopped");
		}
	}
}

impl Drop for Dispatcher {
	fn drop(&mut self) {
		self.inner.cancel.cancel();
	}
}

/// Releases the in-flight flag when a cycle ends, even if it panicked.
struct InFlightGuard {
	inner: Arc<DispatcherInner>,
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.inner.in_flight.send_replace(false);
		// Continuous mode re-checks for records that arrived during the cycle.
		self.inner.wake.notify_one();
	}
}

async fn begin_cycle(inner: &Arc<DispatcherInner>) -> Option<JoinHandle<FlushReport>> {
	if inner.cancel.is_cancelled() {
		return None;
	}
	if let Some(deadline) = inner.backoff_deadline() {
		debug!(
			remaining_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
			"Dispatch skipped, backing off"
		);
		return None;
	}
	if inner.queue.count().await == 0 {
		return None;
	}

	let claimed = inner.in_flight.send_if_modified(|busy| {
		if *busy {
			false
		} else {
			*busy = true;
			true
		}
	});
	if !claimed {
		debug!("Dispatch skipped, flush already in flight");
		return None;
	}

	let guard = InFlightGuard {
		inner: Arc::clone(inner),
	};
	Some(tokio::spawn(async move {
		let report = guard.inner.run_cycle().await;
		drop(guard);
		report
	}))
}

impl DispatcherInner {
	fn lock_backoff(&self) -> MutexGuard<'_, Backoff> {
		self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// The instant the current backoff ends, if one is pending.
	fn backoff_deadline(&self) -> Option<Instant> {
		self
			.lock_backoff()
			.next_eligible_at
			.filter(|at| *at > Instant::now())
	}

	fn reset_backoff(&self) {
		let mut backoff = self.lock_backoff();
		backoff.consecutive_failures = 0;
		backoff.next_eligible_at = None;
	}

	fn record_failure(&self) -> Duration {
		let mut backoff = self.lock_backoff();
		backoff.consecutive_failures = backoff.consecutive_failures.saturating_add(1);
		let delay = self
			.retry
			.delay_for_attempt(backoff.consecutive_failures)
			.min(MAX_BACKOFF);
		let now = Instant::now();
		backoff.next_eligible_at = Some(now.checked_add(delay).unwrap_or(now));
		delay
	}

	async fn run_cycle(&self) -> FlushReport {
		let mut report = FlushReport::default();

		'batches: while !self.cancel.is_cancelled() {
			let settings = *self.settings.borrow();
			let batch = self.queue.peek_batch(settings.events_per_request.max(1)).await;
			if batch.is_empty() {
				break;
			}

			let requests = match self.encoder.encode(&batch, settings.events_per_request) {
				Ok(requests) => requests,
				Err(e) => {
					error!(error = %e, "Failed to encode tracking batch");
					report.failure = Some(format!("encoding failed: {e}"));
					break;
				}
			};

			debug!(
				records = batch.len(),
				requests = requests.len(),
				debug = settings.debug,
				"Dispatching batch"
			);

			for request in requests {
				if self.cancel.is_cancelled() {
					break 'batches;
				}

				let outcome = if settings.debug {
					self.diagnostics.debug_request(&self.endpoint, &request);
					DeliveryOutcome::Delivered
				} else {
					self.transport.post(&self.endpoint, &request.body).await
				};
				report.requests += 1;

				match outcome {
					DeliveryOutcome::Delivered => {
						self.reset_backoff();
						if !self.remove(&request.ids, &mut report).await {
							break 'batches;
						}
						report.delivered += request.ids.len();
					}
					DeliveryOutcome::RejectedByServer(status) => {
						self.reset_backoff();
						self.diagnostics.batch_rejected(&request.ids, &status);
						if !self.remove(&request.ids, &mut report).await {
							break 'batches;
						}
						report.rejected += request.ids.len();
					}
					DeliveryOutcome::TransportFailure(reason) => {
						let retry_in = self.record_failure();
						self.diagnostics.delivery_failed(&request.ids, &reason, retry_in);
						report.failure = Some(reason);
						break 'batches;
					}
				}
			}
		}

		debug!(
			requests = report.requests,
			delivered = report.delivered,
			rejected = report.rejected,
			complete = report.is_complete(),
			"Flush cycle finished"
		);
		report
	}

	/// Removes sent records. A storage failure ends the cycle with backoff, so
	/// the records are delivered again later instead of in a tight loop.
	async fn remove(&self, ids: &[SequenceId], report: &mut FlushReport) -> bool {
		match self.queue.remove(ids).await {
			Ok(_) => true,
			Err(e) => {
				self.diagnostics.storage_failed("remove", &e);
				self.record_failure();
				report.failure = Some(format!("failed to remove delivered records: {e}"));
				false
			}
		}
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

async fn run_timer(inner: Arc<DispatcherInner>) {
	let mut settings = inner.settings.subscribe();
	info!(interval = ?settings.borrow().interval, "Dispatcher started");

	loop {
		let interval = settings.borrow_and_update().interval;

		match interval {
			DispatchInterval::Manual => {
				tokio::select! {
					_ = inner.cancel.cancelled() => break,
					changed = settings.changed() => {
						if changed.is_err() {
							break;
						}
					}
				}
			}
			DispatchInterval::Every(period) => {
				let tick = tokio::time::sleep(period);
				tokio::pin!(tick);

				let fired = loop {
					tokio::select! {
						_ = inner.cancel.cancelled() => return,
						_ = &mut tick => break true,
						changed = settings.changed() => {
							if changed.is_err() {
								return;
							}
							if settings.borrow_and_update().interval != interval {
								break false;
							}
						}
					}
				};

				if fired {
					if let Some(cycle) = begin_cycle(&inner).await {
						let _ = cycle.await;
					}
				}
			}
			DispatchInterval::Continuous => {
				if let Some(cycle) = begin_cycle(&inner).await {
					let _ = cycle.await;
					continue;
				}

				let deadline = inner.backoff_deadline();
				tokio::select! {
					_ = inner.cancel.cancelled() => break,
					_ = inner.wake.notified() => {}
					_ = sleep_until(deadline) => {}
					changed = settings.changed() => {
						if changed.is_err() {
							break;
						}
					}
				}
			}
		}
	}

	debug!("Dispatcher timer stopped");
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{BulkEncoding, MIN_DISPATCH_PERIOD};
	use crate::diagnostics::DiagnosticsSink;
	use crate::queue::Enqueued;
	use crate::store::{MemoryStore, PersistentStore};
	use crate::testing::{params, FailingStore, RecordingDiagnostics, RecordingTransport};
	use crate::transport::StatusInfo;

	const BACKOFF: Duration = Duration::from_secs(10);

	struct Harness {
		queue: Arc<DurableQueue>,
		transport: Arc<RecordingTransport>,
		diagnostics: Arc<RecordingDiagnostics>,
		dispatcher: Dispatcher,
	}

	impl Harness {
		async fn enqueue(&self, markers: &[&str]) -> Vec<Enqueued> {
			let mut outcomes = Vec::new();
			for marker in markers {
				outcomes.push(self.queue.enqueue(params(marker)).await.unwrap());
				self.dispatcher.notify_enqueued();
			}
			outcomes
		}
	}

	fn manual(events_per_request: usize) -> DispatchSettings {
		DispatchSettings {
			interval: DispatchInterval::Manual,
			events_per_request,
			debug: false,
		}
	}

	async fn harness_with(
		store: Arc<dyn PersistentStore>,
		max_queued_events: usize,
		settings: DispatchSettings,
		token: Option<&str>,
		transport: RecordingTransport,
	) -> Harness {
		harness_with_retry(
			store,
			max_queued_events,
			settings,
			token,
			transport,
			RetryConfig::fixed(BACKOFF),
		)
		.await
	}

	async fn harness_with_retry(
		store: Arc<dyn PersistentStore>,
		max_queued_events: usize,
		settings: DispatchSettings,
		token: Option<&str>,
		transport: RecordingTransport,
		retry: RetryConfig,
	) -> Harness {
		let diagnostics = Arc::new(RecordingDiagnostics::new());
		let queue = Arc::new(
			DurableQueue::open(store, max_queued_events, &*diagnostics)
				.await
				.unwrap(),
		);
		let transport = Arc::new(transport);
		let sink: Arc<dyn DiagnosticsSink> = diagnostics.clone();
		let dispatcher = Dispatcher::start(
			DispatcherParts {
				queue: queue.clone(),
				transport: transport.clone(),
				encoder: BatchEncoder::new(BulkEncoding::Current, token.map(str::to_string)),
				endpoint: Url::parse("https://stats.example.com/piwik.php").unwrap(),
				diagnostics: sink,
				retry,
			},
			settings,
		);
		Harness {
			queue,
			transport,
			diagnostics,
			dispatcher,
		}
	}

	async fn harness(
		max_queued_events: usize,
		settings: DispatchSettings,
		token: Option<&str>,
		transport: RecordingTransport,
	) -> Harness {
		harness_with(
			Arc::new(MemoryStore::new()),
			max_queued_events,
			settings,
			token,
			transport,
		)
		.await
	}

	fn strings(markers: &[&str]) -> Vec<String> {
		markers.iter().map(|m| m.to_string()).collect()
	}

	#[tokio::test]
	async fn full_queue_then_one_bulk_batch() {
		let h = harness(2, manual(10), Some("token"), RecordingTransport::new()).await;

		let outcomes = h.enqueue(&["a", "b", "c"]).await;
		assert!(outcomes[0].is_accepted());
		assert!(outcomes[1].is_accepted());
		assert_eq!(outcomes[2], Enqueued::AtCapacity);

		let report = h.dispatcher.flush().await.unwrap();
		assert_eq!(report.requests, 1);
		assert_eq!(report.delivered, 2);
		assert!(report.is_complete());
		assert_eq!(h.transport.sent(), vec![strings(&["a", "b"])]);
		assert_eq!(h.queue.count().await, 0);
	}

	#[tokio::test]
	async fn one_event_per_request_sends_sequential_singles() {
		let h = harness(10, manual(1), None, RecordingTransport::new()).await;
		h.enqueue(&["a", "b", "c"]).await;

		let report = h.dispatcher.flush().await.unwrap();
		assert_eq!(report.requests, 3);
		assert_eq!(
			h.transport.sent(),
			vec![strings(&["a"]), strings(&["b"]), strings(&["c"])]
		);
		assert_eq!(h.queue.count().await, 0);
	}

	#[tokio::test]
	async fn missing_token_degrades_bulk_to_singles() {
		let h = harness(10, manual(20), None, RecordingTransport::new()).await;
		h.enqueue(&["a", "b", "c"]).await;

		h.dispatcher.flush().await.unwrap();
		assert_eq!(
			h.transport.sent(),
			vec![strings(&["a"]), strings(&["b"]), strings(&["c"])]
		);
	}

	#[tokio::test]
	async fn cycle_drains_in_order_across_batches() {
		let h = harness(10, manual(2), Some("token"), RecordingTransport::new()).await;
		h.enqueue(&["a", "b", "c", "d", "e"]).await;

		let report = h.dispatcher.flush().await.unwrap();
		assert_eq!(report.delivered, 5);
		assert_eq!(
			h.transport.sent(),
			vec![strings(&["a", "b"]), strings(&["c", "d"]), strings(&["e"])]
		);
		assert!(h
			.transport
			.endpoints()
			.iter()
			.all(|u| u.as_str() == "https://stats.example.com/piwik.php"));
	}

	#[tokio::test(start_paused = true)]
	async fn transport_failure_keeps_records_and_backs_off() {
		let transport = RecordingTransport::with_outcomes([DeliveryOutcome::TransportFailure(
			"connection refused".to_string(),
		)]);
		let h = harness(10, manual(10), Some("token"), transport).await;
		h.enqueue(&["a", "b", "c"]).await;

		let report = h.dispatcher.flush().await.unwrap();
		assert_eq!(report.failure.as_deref(), Some("connection refused"));
		assert_eq!(report.delivered, 0);
		assert_eq!(h.queue.count().await, 3);
		assert_eq!(h.dispatcher.state(), DispatchState::Waiting);
		assert_eq!(h.diagnostics.failures.lock().unwrap()[0].1, BACKOFF);

		// Backoff gates manual dispatch too.
		assert!(!h.dispatcher.dispatch().await);

		tokio::time::advance(BACKOFF + Duration::from_millis(1)).await;
		assert_eq!(h.dispatcher.state(), DispatchState::Idle);

		let report = h.dispatcher.flush().await.unwrap();
		assert!(report.is_complete());
		let bodies = h.transport.bodies();
		assert_eq!(bodies.len(), 2);
		assert_eq!(bodies[0], bodies[1]);
		assert_eq!(h.queue.count().await, 0);
	}

	#[tokio::test]
	async fn rejected_batches_are_dropped_and_reported() {
		let status = StatusInfo {
			status: 400,
			message: "bad request".to_string(),
		};
		let transport =
			RecordingTransport::with_outcomes([DeliveryOutcome::RejectedByServer(status.clone())]);
		let h = harness(10, manual(1), None, transport).await;
		h.enqueue(&["bad", "good"]).await;

		let report = h.dispatcher.flush().await.unwrap();
		assert_eq!(report.rejected, 1);
		assert_eq!(report.delivered, 1);
		assert_eq!(h.queue.count().await, 0);

		let rejected = h.diagnostics.rejected.lock().unwrap().clone();
		assert_eq!(rejected, vec![(vec![SequenceId(1)], status)]);
		assert_eq!(h.dispatcher.state(), DispatchState::Idle);
	}

	#[tokio::test]
	async fn debug_mode_drains_without_the_network() {
		let mut settings = manual(10);
		settings.debug = true;
		let h = harness(10, settings, Some("token"), RecordingTransport::new()).await;
		h.enqueue(&["a", "b", "c"]).await;

		let report = h.dispatcher.flush().await.unwrap();
		assert_eq!(report.delivered, 3);
		assert_eq!(h.transport.request_count(), 0);
		assert_eq!(h.diagnostics.debug_requests.lock().unwrap().len(), 1);
		assert_eq!(h.queue.count().await, 0);
	}

	#[tokio::test]
	async fn nothing_to_send_does_not_start_a_cycle() {
		let h = harness(10, manual(10), None, RecordingTransport::new()).await;
		assert!(!h.dispatcher.dispatch().await);
		assert!(h.dispatcher.flush().await.is_none());
		assert_eq!(h.transport.request_count(), 0);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn concurrent_dispatches_collapse_into_one_cycle() {
		let transport = RecordingTransport::new().with_delay(Duration::from_millis(20));
		let h = Arc::new(harness(20, manual(1), None, transport).await);
		let markers: Vec<String> = (0..8).map(|i| i.to_string()).collect();
		for marker in &markers {
			h.queue.enqueue(params(marker)).await.unwrap();
		}

		let mut handles = Vec::new();
		for _ in 0..8 {
			let h = h.clone();
			handles.push(tokio::spawn(async move { h.dispatcher.dispatch().await }));
		}
		let mut started = 0;
		for handle in handles {
			if handle.await.unwrap() {
				started += 1;
			}
		}
		assert_eq!(started, 1);

		h.dispatcher.wait_idle().await;
		assert_eq!(h.transport.max_in_flight(), 1);
		let sent: Vec<String> = h.transport.sent().into_iter().flatten().collect();
		assert_eq!(sent, markers);
	}

	async fn timer_and_manual_dispatch_share_one_flight(interval: DispatchInterval) {
		let transport = RecordingTransport::new().with_delay(Duration::from_secs(3));
		let h = harness(10, manual(1), None, transport).await;
		for marker in ["a", "b", "c"] {
			h.queue.enqueue(params(marker)).await.unwrap();
		}

		assert!(h.dispatcher.dispatch().await);
		// Timer ticks and enqueue wakeups land while the manual cycle is sending.
		h.dispatcher.update_settings(|s| s.interval = interval);
		tokio::time::sleep(Duration::from_secs(2)).await;
		h.enqueue(&["d"]).await;
		tokio::time::sleep(Duration::from_secs(20)).await;
		assert_eq!(h.queue.count().await, 0);

		// The timer still runs once the manual cycle has finished.
		h.enqueue(&["e"]).await;
		tokio::time::sleep(Duration::from_secs(10)).await;
		assert_eq!(h.queue.count().await, 0);

		assert_eq!(h.transport.max_in_flight(), 1);
		let sent: Vec<String> = h.transport.sent().into_iter().flatten().collect();
		assert_eq!(sent, strings(&["a", "b", "c", "d", "e"]));
	}

	#[tokio::test(start_paused = true)]
	async fn interval_timer_never_overlaps_a_manual_cycle() {
		timer_and_manual_dispatch_share_one_flight(DispatchInterval::Every(Duration::from_secs(1)))
			.await;
	}

	#[tokio::test(start_paused = true)]
	async fn continuous_timer_never_overlaps_a_manual_cycle() {
		timer_and_manual_dispatch_share_one_flight(DispatchInterval::Continuous).await;
	}

	#[tokio::test]
	async fn dispatch_returns_before_delivery_completes() {
		let transport = RecordingTransport::new().with_delay(Duration::from_millis(50));
		let h = harness(10, manual(10), None, transport).await;
		h.enqueue(&["a"]).await;

		assert!(h.dispatcher.dispatch().await);
		assert_eq!(h.dispatcher.state(), DispatchState::Flushing);
		assert!(!h.dispatcher.dispatch().await);

		h.dispatcher.wait_idle().await;
		assert_eq!(h.queue.count().await, 0);
		assert_eq!(h.dispatcher.state(), DispatchState::Idle);
	}

	#[tokio::test(start_paused = true)]
	async fn timer_flushes_on_interval() {
		let settings = DispatchSettings {
			interval: DispatchInterval::Every(Duration::from_secs(60)),
			events_per_request: 10,
			debug: false,
		};
		let h = harness(10, settings, None, RecordingTransport::new()).await;
		h.enqueue(&["a"]).await;

		tokio::time::sleep(Duration::from_secs(30)).await;
		assert_eq!(h.transport.request_count(), 0);

		tokio::time::sleep(Duration::from_secs(31)).await;
		assert_eq!(h.transport.request_count(), 1);
		assert_eq!(h.queue.count().await, 0);

		// Re-armed for the next tick.
		h.enqueue(&["b"]).await;
		tokio::time::sleep(Duration::from_secs(61)).await;
		assert_eq!(h.transport.request_count(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn manual_interval_never_flushes_on_its_own() {
		let h = harness(10, manual(10), None, RecordingTransport::new()).await;
		h.enqueue(&["a"]).await;
		tokio::time::sleep(Duration::from_secs(3600)).await;
		assert_eq!(h.transport.request_count(), 0);
		assert_eq!(h.queue.count().await, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn interval_changes_apply_to_the_running_timer() {
		let h = harness(10, manual(10), None, RecordingTransport::new()).await;
		h.enqueue(&["a"]).await;

		h.dispatcher
			.update_settings(|s| s.interval = DispatchInterval::Every(Duration::from_secs(5)));
		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(h.queue.count().await, 0);
		assert_eq!(h.transport.request_count(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn continuous_mode_sends_as_soon_as_queued() {
		let settings = DispatchSettings {
			interval: DispatchInterval::Continuous,
			events_per_request: 10,
			debug: false,
		};
		let h = harness(10, settings, None, RecordingTransport::new()).await;

		h.enqueue(&["a"]).await;
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(h.queue.count().await, 0);

		h.enqueue(&["b", "c"]).await;
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(h.queue.count().await, 0);

		let sent: Vec<String> = h.transport.sent().into_iter().flatten().collect();
		assert_eq!(sent, strings(&["a", "b", "c"]));
	}

	#[tokio::test(start_paused = true)]
	async fn continuous_mode_retries_after_backoff() {
		let settings = DispatchSettings {
			interval: DispatchInterval::Continuous,
			events_per_request: 10,
			debug: false,
		};
		let transport = RecordingTransport::with_outcomes([DeliveryOutcome::TransportFailure(
			"timeout".to_string(),
		)]);
		let h = harness(10, settings, None, transport).await;

		h.enqueue(&["a"]).await;
		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(h.transport.request_count(), 1);
		assert_eq!(h.queue.count().await, 1);

		tokio::time::sleep(BACKOFF).await;
		assert_eq!(h.transport.request_count(), 2);
		assert_eq!(h.queue.count().await, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn sub_minimum_periods_are_raised() {
		let settings = DispatchSettings {
			interval: DispatchInterval::Every(Duration::ZERO),
			events_per_request: 10,
			debug: false,
		};
		let h = harness(10, settings, None, RecordingTransport::new()).await;
		assert_eq!(
			h.dispatcher.settings().interval,
			DispatchInterval::Every(MIN_DISPATCH_PERIOD)
		);

		h.enqueue(&["a"]).await;
		tokio::time::sleep(MIN_DISPATCH_PERIOD / 2).await;
		assert_eq!(h.transport.request_count(), 0);
		tokio::time::sleep(MIN_DISPATCH_PERIOD).await;
		assert_eq!(h.transport.request_count(), 1);

		h.dispatcher
			.update_settings(|s| s.interval = DispatchInterval::Every(Duration::from_nanos(1)));
		assert_eq!(
			h.dispatcher.settings().interval,
			DispatchInterval::Every(MIN_DISPATCH_PERIOD)
		);
	}

	#[tokio::test]
	async fn oversized_backoff_is_capped() {
		let transport = RecordingTransport::with_outcomes([DeliveryOutcome::TransportFailure(
			"connection reset".to_string(),
		)]);
		let h = harness_with_retry(
			Arc::new(MemoryStore::new()),
			10,
			manual(10),
			None,
			transport,
			RetryConfig::fixed(Duration::from_secs(u64::MAX)),
		)
		.await;
		h.enqueue(&["a"]).await;

		let report = h.dispatcher.flush().await.unwrap();
		assert!(!report.is_complete());
		assert_eq!(h.diagnostics.failures.lock().unwrap()[0].1, MAX_BACKOFF);
		assert_eq!(h.dispatcher.state(), DispatchState::Waiting);
	}

	#[tokio::test]
	async fn events_per_request_is_read_per_batch() {
		let h = harness(10, manual(10), Some("token"), RecordingTransport::new()).await;
		h.enqueue(&["a", "b", "c"]).await;

		h.dispatcher.update_settings(|s| s.events_per_request = 0);
		assert_eq!(h.dispatcher.settings().events_per_request, 1);

		h.dispatcher.flush().await.unwrap();
		assert_eq!(h.transport.request_count(), 3);
	}

	#[tokio::test]
	async fn storage_failure_on_remove_keeps_records() {
		let store = Arc::new(FailingStore::new());
		let h = harness_with(store.clone(), 10, manual(10), None, RecordingTransport::new()).await;
		h.enqueue(&["a", "b"]).await;

		store.fail_writes(true);
		let report = h.dispatcher.flush().await.unwrap();
		assert!(!report.is_complete());
		assert_eq!(report.delivered, 0);
		assert_eq!(h.queue.count().await, 2);
		assert_eq!(h.transport.request_count(), 1);
		assert_eq!(*h.diagnostics.storage.lock().unwrap(), vec!["remove"]);
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_waits_for_in_flight_delivery() {
		let transport = RecordingTransport::new().with_delay(Duration::from_secs(2));
		let h = harness(10, manual(10), None, transport).await;
		h.enqueue(&["a", "b"]).await;

		assert!(h.dispatcher.dispatch().await);
		while h.transport.request_count() == 0 {
			tokio::task::yield_now().await;
		}
		h.dispatcher.shutdown().await;

		assert_eq!(h.dispatcher.state(), DispatchState::Stopped);
		// The in-flight request was applied; the cycle stopped before the next one.
		assert_eq!(h.transport.request_count(), 1);
		assert_eq!(h.queue.count().await, 1);

		assert!(!h.dispatcher.dispatch().await);
		h.dispatcher.shutdown().await;
	}

	#[tokio::test(start_paused = true)]
	async fn stopped_dispatcher_ignores_timer_and_enqueues() {
		let settings = DispatchSettings {
			interval: DispatchInterval::Continuous,
			events_per_request: 10,
			debug: false,
		};
		let h = harness(10, settings, None, RecordingTransport::new()).await;
		h.dispatcher.shutdown().await;

		h.enqueue(&["a"]).await;
		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(h.transport.request_count(), 0);
		assert!(h.dispatcher.flush().await.is_none());
	}
}
