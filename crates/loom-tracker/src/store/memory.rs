// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use loom_tracker_core::{EventRecord, SequenceId};

use crate::error::StorageError;
use crate::store::{Backlog, PersistentStore};

/// Non-durable store for ephemeral trackers and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
	records: BTreeMap<SequenceId, EventRecord>,
	settings: HashMap<String, String>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StorageError> {
		self.inner
			.lock()
			.map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
	}
}

#[async_trait]
impl PersistentStore for MemoryStore {
	async fn append(&self, record: &EventRecord) -> Result<(), StorageError> {
		let mut inner = self.lock()?;
		let id = record.sequence_id();
		if inner.records.contains_key(&id) {
			return Err(StorageError::Corrupt {
				sequence_id: id.0,
				message: "sequence id already stored".to_string(),
			});
		}
		inner.records.insert(id, record.clone());
		Ok(())
	}

	async fn delete_by_ids(&self, ids: &[SequenceId]) -> Result<u64, StorageError> {
		let mut inner = self.lock()?;
		Ok(ids
			.iter()
			.filter(|id| inner.records.remove(*id).is_some())
			.count() as u64)
	}

	async fn load_all(&self) -> Result<Backlog, StorageError> {
		Ok(Backlog {
			records: self.lock()?.records.values().cloned().collect(),
			corrupt: Vec::new(),
		})
	}

	async fn clear_all(&self) -> Result<(), StorageError> {
		self.lock()?.records.clear();
		Ok(())
	}

	async fn load_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
		Ok(self.lock()?.settings.get(key).cloned())
	}

	async fn save_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
		self.lock()?
			.settings
			.insert(key.to_string(), value.to_string());
		Ok(())
	}
}
