// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistent storage for queued events and tracker settings.
//!
//! Implementations must be crash-consistent: after a call returns `Ok`, the
//! change survives a process crash, and a record is either fully stored or
//! absent.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use loom_tracker_core::{EventRecord, SequenceId};

use crate::error::StorageError;

/// A stored row that could not be decoded into a record.
#[derive(Debug)]
pub struct CorruptRecord {
	pub sequence_id: SequenceId,
	pub error: StorageError,
}

/// Everything read back from a store at startup.
#[derive(Debug, Default)]
pub struct Backlog {
	/// Readable records in sequence order.
	pub records: Vec<EventRecord>,
	pub corrupt: Vec<CorruptRecord>,
}

impl Backlog {
	/// The highest id seen, readable or not.
	pub fn last_sequence_id(&self) -> Option<SequenceId> {
		let last_record = self.records.last().map(EventRecord::sequence_id);
		let last_corrupt = self.corrupt.iter().map(|c| c.sequence_id).max();
		last_record.max(last_corrupt)
	}
}

/// Settings key holding the persisted opt-out choice.
pub const OPT_OUT_KEY: &str = "opt_out";
/// Settings key holding the JSON-encoded visitor state.
pub const VISITOR_KEY: &str = "visitor";

#[async_trait]
pub trait PersistentStore: Send + Sync {
	/// Durably appends one record.
	async fn append(&self, record: &EventRecord) -> Result<(), StorageError>;

	/// Deletes the given records. Ids that are already absent are ignored.
	/// Returns the number of records actually deleted.
	async fn delete_by_ids(&self, ids: &[SequenceId]) -> Result<u64, StorageError>;

	/// Loads every stored record in sequence order. Rows that cannot be decoded
	/// are returned in [`Backlog::corrupt`] instead of failing the load.
	async fn load_all(&self) -> Result<Backlog, StorageError>;

	/// Deletes every stored record.
	async fn clear_all(&self) -> Result<(), StorageError>;

	async fn load_setting(&self, key: &str) -> Result<Option<String>, StorageError>;

	async fn save_setting(&self, key: &str, value: &str) -> Result<(), StorageError>;
}
