// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The tracker: the application-facing handle over the queue and dispatcher.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use loom_common_http::RetryConfig;
use loom_tracker_core::{
	BuilderSettings, PiwikRecordBuilder, RecordBuilder, SampleRate, SequenceId, TrackedEvent,
	VisitContext, VisitorState,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{BulkEncoding, DispatchInterval, TrackerConfig};
use crate::diagnostics::{SharedDiagnostics, TracingDiagnostics};
use crate::encoder::BatchEncoder;
use crate::error::{Result, StorageError, TrackerError};
use crate::queue::{DurableQueue, Enqueued};
use crate::scheduler::{DispatchSettings, DispatchState, Dispatcher, DispatcherParts, FlushReport};
use crate::store::{MemoryStore, PersistentStore, SqliteStore, OPT_OUT_KEY, VISITOR_KEY};
use crate::transport::{tracking_endpoint, HttpTransport, Transport};

static SHARED: OnceLock<Tracker> = OnceLock::new();

/// What happened to a tracked event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
	Queued(SequenceId),
	/// The queue is full; the event was dropped.
	AtCapacity,
	/// The user opted out; nothing was stored.
	OptedOut,
	/// Not selected by the sample rate.
	SampledOut,
}

impl TrackOutcome {
	pub fn is_queued(&self) -> bool {
		matches!(self, TrackOutcome::Queued(_))
	}
}

/// Builder for constructing a [`Tracker`].
pub struct TrackerBuilder {
	config: TrackerConfig,
	retry_config: Option<RetryConfig>,
	store: Option<Arc<dyn PersistentStore>>,
	transport: Option<Arc<dyn Transport>>,
	diagnostics: Option<SharedDiagnostics>,
	record_builder: Option<Arc<dyn RecordBuilder>>,
}

impl TrackerBuilder {
	/// Creates a new builder with default settings.
	pub fn new() -> Self {
		Self::from_config(TrackerConfig::default())
	}

	/// Starts from a loaded configuration. Builder calls override its values.
	pub fn from_config(config: TrackerConfig) -> Self {
		Self {
			config,
			retry_config: None,
			store: None,
			transport: None,
			diagnostics: None,
			record_builder: None,
		}
	}

	/// Sets the collector base URL.
	///
	/// Example: `https://stats.example.com`
	pub fn base_url(mut self, url: impl Into<String>) -> Self {
		self.config.base_url = Some(url.into());
		self
	}

	pub fn site_id(mut self, id: impl Into<String>) -> Self {
		self.config.site_id = Some(id.into());
		self
	}

	/// Sets the auth token. Without one, batches are sent as single requests.
	pub fn auth_token(mut self, token: impl Into<String>) -> Self {
		self.config.auth_token = Some(token.into());
		self
	}

	pub fn app_name(mut self, name: impl Into<String>) -> Self {
		self.config.app_name = name.into();
		self
	}

	pub fn app_version(mut self, version: impl Into<String>) -> Self {
		self.config.app_version = version.into();
		self
	}

	pub fn prefixing(mut self, enabled: bool) -> Self {
		self.config.prefixing = enabled;
		self
	}

	/// Seconds between automatic flushes. Negative is manual only, zero is continuous.
	pub fn dispatch_interval_secs(mut self, secs: f64) -> Self {
		self.config.dispatch_interval_secs = secs;
		self
	}

	pub fn max_queued_events(mut self, max: usize) -> Self {
		self.config.max_queued_events = max;
		self
	}

	pub fn events_per_request(mut self, count: usize) -> Self {
		self.config.events_per_request = count;
		self
	}

	/// Percentage of events to keep, 0-100.
	pub fn sample_rate(mut self, percent: f64) -> Self {
		self.config.sample_rate = percent;
		self
	}

	pub fn debug(mut self, enabled: bool) -> Self {
		self.config.debug = enabled;
		self
	}

	pub fn bulk_encoding(mut self, encoding: BulkEncoding) -> Self {
		self.config.bulk_encoding = encoding;
		self
	}

	/// Sets the HTTP request timeout.
	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout_secs = timeout.as_secs().max(1);
		self
	}

	/// Idle time after which the next event starts a new visit. Zero disables.
	pub fn session_timeout(mut self, timeout: Duration) -> Self {
		self.config.session_timeout_secs = timeout.as_secs();
		self
	}

	/// Sets the backoff applied after failed deliveries.
	pub fn retry_config(mut self, config: RetryConfig) -> Self {
		self.retry_config = Some(config);
		self
	}

	pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.config.database_path = Some(path.into());
		self
	}

	/// Uses a custom store instead of the SQLite database.
	pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
		self.store = Some(store);
		self
	}

	/// Keeps everything in memory. Queued events are lost on exit.
	pub fn in_memory(self) -> Self {
		self.store(Arc::new(MemoryStore::new()))
	}

	pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn diagnostics(mut self, diagnostics: SharedDiagnostics) -> Self {
		self.diagnostics = Some(diagnostics);
		self
	}

	/// Replaces the default Piwik record builder.
	pub fn record_builder(mut self, builder: Arc<dyn RecordBuilder>) -> Self {
		self.record_builder = Some(builder);
		self
	}

	/// Builds the tracker: opens the store, loads the backlog and visitor state,
	/// and starts the dispatcher. Must be called inside a Tokio runtime.
	#[instrument(skip(self))]
	pub async fn build(self) -> Result<Tracker> {
		let config = self.config;

		let base_url = config
			.base_url
			.as_deref()
			.ok_or_else(|| TrackerError::InvalidBaseUrl("base URL is required".to_string()))?;
		let endpoint = tracking_endpoint(base_url)?;
		let site_id = config
			.site_id
			.clone()
			.filter(|id| !id.trim().is_empty())
			.ok_or(TrackerError::MissingSiteId)?;
		config.validate()?;

		let record_builder: Arc<dyn RecordBuilder> = match self.record_builder {
			Some(builder) => builder,
			None => Arc::new(PiwikRecordBuilder::new(BuilderSettings {
				site_id: site_id.clone(),
				app_name: config.app_name.clone(),
				app_version: config.app_version.clone(),
				prefixing: config.prefixing,
			})?),
		};

		let store: Arc<dyn PersistentStore> = match self.store {
			Some(store) => store,
			None => {
				let path = config.resolved_database_path().ok_or_else(|| {
					StorageError::Unavailable("no data directory for the tracker database".to_string())
				})?;
				Arc::new(SqliteStore::open(&path).await?)
			}
		};

		let visitor = load_visitor(store.as_ref()).await?;
		let opt_out = store
			.load_setting(OPT_OUT_KEY)
			.await?
			.is_some_and(|v| v == "true");

		let diagnostics = self
			.diagnostics
			.unwrap_or_else(|| Arc::new(TracingDiagnostics));
		let queue = Arc::new(
			DurableQueue::open(
				Arc::clone(&store),
				config.max_queued_events,
				&*diagnostics,
			)
			.await?,
		);

		let transport: Arc<dyn Transport> = match self.transport {
			Some(transport) => transport,
			None => Arc::new(HttpTransport::new(config.request_timeout())?),
		};

		let dispatcher = Dispatcher::start(
			DispatcherParts {
				queue: Arc::clone(&queue),
				transport,
				encoder: BatchEncoder::new(config.bulk_encoding, config.auth_token.clone()),
				endpoint: endpoint.clone(),
				diagnostics,
				retry: self.retry_config.unwrap_or_else(|| config.retry_config()),
			},
			DispatchSettings {
				interval: config.dispatch_interval(),
				events_per_request: config.events_per_request,
				debug: config.debug,
			},
		);

		info!(
			endpoint = %endpoint,
			site_id = %site_id,
			client_id = %visitor.client_id,
			visit_count = visitor.visit_count,
			opt_out,
			"Tracker initialized"
		);

		Ok(Tracker {
			inner: Arc::new(TrackerInner {
				record_builder,
				store,
				queue,
				dispatcher,
				session: Mutex::new(Session {
					visitor,
					new_visit: true,
					last_tracked: None,
					timeout: config.session_timeout(),
				}),
				opt_out: AtomicBool::new(opt_out),
				sample_rate: Mutex::new(SampleRate::new(config.sample_rate)),
				closed: AtomicBool::new(false),
			}),
		})
	}
}

impl Default for TrackerBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Loads the persisted visitor, or creates one, and starts a new visit.
async fn load_visitor(store: &dyn PersistentStore) -> Result<VisitorState> {
	let now = Utc::now();
	let stored = store.load_setting(VISITOR_KEY).await?;

	let mut visitor = match stored.map(|json| serde_json::from_str::<VisitorState>(&json)) {
		Some(Ok(visitor)) => visitor,
		Some(Err(e)) => {
			warn!(error = %e, "Stored visitor state is unreadable, starting a new visitor");
			VisitorState::first_launch(now)
		}
		None => VisitorState::first_launch(now),
	};

	visitor.start_visit(now);
	store
		.save_setting(VISITOR_KEY, &serde_json::to_string(&visitor)?)
		.await?;
	Ok(visitor)
}

struct Session {
	visitor: VisitorState,
	/// The next queued event starts a new visit.
	new_visit: bool,
	last_tracked: Option<Instant>,
	timeout: Option<Duration>,
}

impl Session {
	fn start_visit(&mut self, now: DateTime<Utc>) {
		self.visitor.start_visit(now);
		self.new_visit = true;
	}

	/// Starts a new visit if the previous event is older than the timeout.
	fn expire_idle_visit(&mut self, at: Instant, now: DateTime<Utc>) -> bool {
		let expired = match (self.timeout, self.last_tracked) {
			(Some(timeout), Some(last)) => at.saturating_duration_since(last) >= timeout,
			_ => false,
		};
		if expired {
			self.start_visit(now);
		}
		expired
	}
}

struct TrackerInner {
	record_builder: Arc<dyn RecordBuilder>,
	store: Arc<dyn PersistentStore>,
	queue: Arc<DurableQueue>,
	dispatcher: Dispatcher,
	session: Mutex<Session>,
	opt_out: AtomicBool,
	sample_rate: Mutex<SampleRate>,
	closed: AtomicBool,
}

impl TrackerInner {
	fn session(&self) -> MutexGuard<'_, Session> {
		self.session.lock().unwrap_or_else(PoisonError::into_inner)
	}

	async fn save_visitor(&self, json: &str) {
		if let Err(e) = self.store.save_setting(VISITOR_KEY, json).await {
			warn!(error = %e, "Failed to persist visitor state");
		}
	}

	fn sample_rate(&self) -> SampleRate {
		*self.sample_rate.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// Analytics tracker.
///
/// Cheap to clone; all clones share one queue and dispatcher.
#[derive(Clone)]
pub struct Tracker {
	inner: Arc<TrackerInner>,
}

impl Tracker {
	/// Creates a new builder.
	pub fn builder() -> TrackerBuilder {
		TrackerBuilder::new()
	}

	/// Makes `tracker` available through [`Tracker::shared`]. Only the first call wins;
	/// later calls hand the tracker back.
	pub fn install_shared(tracker: Tracker) -> std::result::Result<(), Tracker> {
		SHARED.set(tracker)
	}

	/// The tracker passed to [`Tracker::install_shared`], if any.
	pub fn shared() -> Option<&'static Tracker> {
		SHARED.get()
	}

	/// Records an event. Returns whether it was queued.
	///
	/// Never fails: errors are logged. Use [`Tracker::try_track`] to see them.
	pub async fn track(&self, event: TrackedEvent) -> bool {
		let kind = event.kind();
		match self.try_track(event).await {
			Ok(outcome) => outcome.is_queued(),
			Err(e) => {
				warn!(kind, error = %e, "Failed to track event");
				false
			}
		}
	}

	/// Records an event and reports what happened to it.
	pub async fn try_track(&self, event: TrackedEvent) -> Result<TrackOutcome> {
		if self.inner.closed.load(Ordering::SeqCst) {
			return Err(TrackerError::ClientShutdown);
		}
		if self.inner.opt_out.load(Ordering::SeqCst) {
			return Ok(TrackOutcome::OptedOut);
		}
		if !self.inner.sample_rate().should_sample() {
			debug!(kind = event.kind(), "Event not sampled");
			return Ok(TrackOutcome::SampledOut);
		}

		let now = Utc::now();
		let (params, new_visit, renewed_visitor) = {
			let mut session = self.inner.session();
			let renewed_visitor = if session.expire_idle_visit(Instant::now(), now) {
				debug!(
					visit_count = session.visitor.visit_count,
					"Session timed out, starting a new visit"
				);
				Some(serde_json::to_string(&session.visitor)?)
			} else {
				None
			};

			// Claimed under the lock so only one concurrent event carries the visit start.
			let new_visit = std::mem::take(&mut session.new_visit);
			let visit = VisitContext {
				visitor: &session.visitor,
				new_visit,
				now,
			};
			match self.inner.record_builder.produce(&event, &visit) {
				Ok(params) => {
					session.last_tracked = Some(Instant::now());
					(params, new_visit, renewed_visitor)
				}
				Err(e) => {
					session.new_visit |= new_visit;
					return Err(e.into());
				}
			}
		};

		if let Some(json) = renewed_visitor {
			self.inner.save_visitor(&json).await;
		}

		let enqueued = self.inner.queue.enqueue(params).await;
		if new_visit && !matches!(enqueued, Ok(Enqueued::Accepted(_))) {
			// Not stored; the next event starts the visit instead.
			self.inner.session().new_visit = true;
		}

		match enqueued? {
			Enqueued::Accepted(id) => {
				self.inner.dispatcher.notify_enqueued();
				Ok(TrackOutcome::Queued(id))
			}
			Enqueued::AtCapacity => Ok(TrackOutcome::AtCapacity),
		}
	}

	pub async fn send_view(&self, screen: impl Into<String>) -> bool {
		self.track(TrackedEvent::screen_view(screen)).await
	}

	/// Tracks a hierarchical screen name, e.g. `["settings", "privacy"]`.
	pub async fn send_views<I, S>(&self, segments: I) -> bool
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.track(TrackedEvent::screen_views(segments)).await
	}

	pub async fn send_event(
		&self,
		category: impl Into<String>,
		action: impl Into<String>,
		label: Option<&str>,
	) -> bool {
		self.track(TrackedEvent::event(category, action, label.map(str::to_string)))
			.await
	}

	pub async fn send_exception(&self, description: impl Into<String>, fatal: bool) -> bool {
		self.track(TrackedEvent::exception(description, fatal)).await
	}

	pub async fn send_social_interaction(
		&self,
		action: impl Into<String>,
		target: impl Into<String>,
		network: impl Into<String>,
	) -> bool {
		self.track(TrackedEvent::social(action, target, network)).await
	}

	pub async fn send_goal(&self, goal_id: impl Into<String>, revenue: u64) -> bool {
		self.track(TrackedEvent::goal(goal_id, revenue)).await
	}

	pub async fn send_search(
		&self,
		keyword: impl Into<String>,
		category: Option<&str>,
		hits: Option<u64>,
	) -> bool {
		self.track(TrackedEvent::search(keyword, category.map(str::to_string), hits))
			.await
	}

	/// Starts a flush cycle in the background. See [`Dispatcher::dispatch`].
	pub async fn dispatch(&self) -> bool {
		if self.inner.closed.load(Ordering::SeqCst) {
			return false;
		}
		self.inner.dispatcher.dispatch().await
	}

	/// Runs a flush cycle to completion, if one could start.
	pub async fn flush(&self) -> Option<FlushReport> {
		if self.inner.closed.load(Ordering::SeqCst) {
			return None;
		}
		self.inner.dispatcher.flush().await
	}

	/// Deletes every queued event without sending it.
	pub async fn delete_queued_events(&self) -> Result<()> {
		self.inner.queue.clear().await?;
		Ok(())
	}

	pub async fn queued_event_count(&self) -> usize {
		self.inner.queue.count().await
	}

	/// Persists the opt-out choice. While opted out nothing is queued.
	pub async fn set_opt_out(&self, opt_out: bool) -> Result<()> {
		self.inner
			.store
			.save_setting(OPT_OUT_KEY, if opt_out { "true" } else { "false" })
			.await?;
		self.inner.opt_out.store(opt_out, Ordering::SeqCst);
		info!(opt_out, "Tracker opt-out changed");
		Ok(())
	}

	pub fn is_opted_out(&self) -> bool {
		self.inner.opt_out.load(Ordering::SeqCst)
	}

	/// Forces the next event to start a new visit.
	pub async fn start_new_session(&self) -> Result<()> {
		let json = {
			let mut session = self.inner.session();
			session.start_visit(Utc::now());
			serde_json::to_string(&session.visitor)?
		};
		self.inner.store.save_setting(VISITOR_KEY, &json).await?;
		Ok(())
	}

	pub fn visitor(&self) -> VisitorState {
		self.inner.session().visitor.clone()
	}

	/// `None` disables idle expiry of visits.
	pub fn set_session_timeout(&self, timeout: Option<Duration>) {
		self.inner.session().timeout = timeout.filter(|t| !t.is_zero());
	}

	pub fn session_timeout(&self) -> Option<Duration> {
		self.inner.session().timeout
	}

	/// Debug mode renders requests to the diagnostics sink instead of sending them.
	pub fn set_debug(&self, debug: bool) {
		self.inner.dispatcher.update_settings(|s| s.debug = debug);
	}

	pub fn is_debug(&self) -> bool {
		self.inner.dispatcher.settings().debug
	}

	pub fn set_dispatch_interval(&self, interval: DispatchInterval) {
		self.inner.dispatcher.update_settings(|s| s.interval = interval);
	}

	pub fn dispatch_interval(&self) -> DispatchInterval {
		self.inner.dispatcher.settings().interval
	}

	/// Values below one are raised to one.
	pub fn set_events_per_request(&self, count: usize) {
		self.inner
			.dispatcher
			.update_settings(|s| s.events_per_request = count);
	}

	pub fn events_per_request(&self) -> usize {
		self.inner.dispatcher.settings().events_per_request
	}

	pub fn set_max_queued_events(&self, max: usize) {
		self.inner.queue.set_max_queued_events(max);
	}

	pub fn max_queued_events(&self) -> usize {
		self.inner.queue.max_queued_events()
	}

	pub fn set_sample_rate(&self, percent: f64) {
		*self
			.inner
			.sample_rate
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = SampleRate::new(percent);
	}

	pub fn sample_rate(&self) -> f64 {
		self.inner.sample_rate().percent()
	}

	pub fn dispatch_state(&self) -> DispatchState {
		self.inner.dispatcher.state()
	}

	/// Stops the dispatcher and waits for an in-flight delivery to be applied.
	/// Tracking calls fail afterwards.
	pub async fn shutdown(&self) {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.inner.dispatcher.shutdown().await;
		info!("Tracker shut down");
	}
}
