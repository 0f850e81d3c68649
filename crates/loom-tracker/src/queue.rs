// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable, ordered, bounded queue of pending event records.
//!
//! All mutations go through one async mutex, so ordering and the capacity bound
//! hold under concurrent producers. The in-memory view is only changed after
//! the store has accepted the change: a failed write leaves both views as they
//! were.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use loom_tracker_core::{EventParams, EventRecord, SequenceId};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::diagnostics::DiagnosticsSink;
use crate::error::StorageError;
use crate::store::PersistentStore;

/// Result of an enqueue attempt that reached the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
	/// The record was durably stored with this id.
	Accepted(SequenceId),
	/// The queue is full. Newest events are dropped, never older ones.
	AtCapacity,
}

impl Enqueued {
	pub fn is_accepted(&self) -> bool {
		matches!(self, Enqueued::Accepted(_))
	}
}

struct QueueState {
	records: BTreeMap<SequenceId, EventRecord>,
	next_id: SequenceId,
}

pub struct DurableQueue {
	store: Arc<dyn PersistentStore>,
	state: Mutex<QueueState>,
	max_queued_events: AtomicUsize,
}

impl DurableQueue {
	/// Opens the queue, loading any backlog persisted by a previous process.
	///
	/// Unreadable rows are reported to `diagnostics` and deleted; the readable
	/// rest of the backlog is kept.
	#[instrument(skip(store, diagnostics))]
	pub async fn open(
		store: Arc<dyn PersistentStore>,
		max_queued_events: usize,
		diagnostics: &dyn DiagnosticsSink,
	) -> Result<Self, StorageError> {
		let backlog = store.load_all().await?;
		// Ids of unreadable rows are never reused, even if deleting them fails.
		let next_id = backlog
			.last_sequence_id()
			.map(SequenceId::next)
			.unwrap_or(SequenceId(1));

		if !backlog.corrupt.is_empty() {
			let corrupt_ids: Vec<SequenceId> = backlog.corrupt.iter().map(|c| c.sequence_id).collect();
			for corrupt in &backlog.corrupt {
				warn!(sequence_id = %corrupt.sequence_id, error = %corrupt.error, "Discarding unreadable queued event");
				diagnostics.storage_failed("load", &corrupt.error);
			}
			if let Err(e) = store.delete_by_ids(&corrupt_ids).await {
				warn!(error = %e, discarded = corrupt_ids.len(), "Failed to delete unreadable queued events");
				diagnostics.storage_failed("delete_corrupt", &e);
			}
		}

		let records: BTreeMap<_, _> = backlog
			.records
			.into_iter()
			.map(|r| (r.sequence_id(), r))
			.collect();

		info!(
			backlog = records.len(),
			discarded = backlog.corrupt.len(),
			"Opened durable event queue"
		);

		Ok(Self {
			store,
			state: Mutex::new(QueueState { records, next_id }),
			max_queued_events: AtomicUsize::new(max_queued_events),
		})
	}

	/// Appends a record if the queue is below capacity.
	///
	/// Returns `Err` only if the store failed; the record is then not queued.
	pub async fn enqueue(&self, params: EventParams) -> Result<Enqueued, StorageError> {
		let mut state = self.state.lock().await;

		let max = self.max_queued_events.load(Ordering::SeqCst);
		if state.records.len() >= max {
			warn!(
				queued = state.records.len(),
				max_queued_events = max,
				"Event queue full, dropping new event"
			);
			return Ok(Enqueued::AtCapacity);
		}

		// Advance first so an id is never reused, even if the store's answer was lost.
		let id = state.next_id;
		state.next_id = id.next();

		let record = EventRecord::new(id, params, Utc::now());
		self.store.append(&record).await?;
		state.records.insert(id, record);

		debug!(sequence_id = %id, queued = state.records.len(), "Event queued");
		Ok(Enqueued::Accepted(id))
	}

	/// Returns up to `limit` of the oldest records without removing them.
	pub async fn peek_batch(&self, limit: usize) -> Vec<EventRecord> {
		let state = self.state.lock().await;
		state.records.values().take(limit).cloned().collect()
	}

	/// Deletes exactly the given records. Ids that are already gone are ignored.
	///
	/// Returns how many records were removed.
	pub async fn remove(&self, ids: &[SequenceId]) -> Result<usize, StorageError> {
		let mut state = self.state.lock().await;

		let present: Vec<SequenceId> = ids
			.iter()
			.copied()
			.filter(|id| state.records.contains_key(id))
			.collect();
		if present.is_empty() {
			return Ok(0);
		}

		self.store.delete_by_ids(&present).await?;
		for id in &present {
			state.records.remove(id);
		}

		debug!(removed = present.len(), queued = state.records.len(), "Removed delivered events");
		Ok(present.len())
	}

	/// Deletes every queued record.
	pub async fn clear(&self) -> Result<(), StorageError> {
		let mut state = self.state.lock().await;
		self.store.clear_all().await?;
		let dropped = state.records.len();
		state.records.clear();
		info!(dropped, "Cleared event queue");
		Ok(())
	}

	pub async fn count(&self) -> usize {
		self.state.lock().await.records.len()
	}

	pub fn max_queued_events(&self) -> usize {
		self.max_queued_events.load(Ordering::SeqCst)
	}

	/// Changes the capacity. Lowering it below the current count evicts nothing;
	/// further enqueues are rejected until the queue drains.
	pub fn set_max_queued_events(&self, max: usize) {
		self.max_queued_events.store(max, Ordering::SeqCst);
	}
}
