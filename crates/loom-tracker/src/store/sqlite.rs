// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loom_tracker_core::{EventParams, EventRecord, SequenceId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use sqlx::{QueryBuilder, Sqlite};

use crate::error::StorageError;
use crate::store::{Backlog, CorruptRecord, PersistentStore};

/// SQLite caps bound parameters per statement; stay well below it.
const DELETE_CHUNK: usize = 500;

/// Connects with WAL journaling, creating the file if needed.
async fn connect(options: SqliteConnectOptions) -> Result<SqlitePool, StorageError> {
	let options = options
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.create_if_missing(true);

	let pool = SqlitePool::connect_with(options).await?;

	tracing::debug!("tracker database pool created");
	Ok(pool)
}

/// Event queue and settings stored in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

impl SqliteStore {
	/// Wraps an existing pool. Call [`SqliteStore::migrate`] before use.
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// Opens (creating if needed) the database file and its tables.
	#[tracing::instrument(skip(path), fields(path = %path.display()))]
	pub async fn open(path: &Path) -> Result<Self, StorageError> {
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			std::fs::create_dir_all(parent).map_err(|e| {
				StorageError::Unavailable(format!("cannot create {}: {e}", parent.display()))
			})?;
		}

		let pool = connect(SqliteConnectOptions::new().filename(path)).await?;
		let store = Self::new(pool);
		store.migrate().await?;
		Ok(store)
	}

	/// Creates the tables if they do not exist.
	pub async fn migrate(&self) -> Result<(), StorageError> {
		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS queued_events (
				sequence_id INTEGER PRIMARY KEY NOT NULL,
				params TEXT NOT NULL,
				enqueued_at TEXT NOT NULL
			)
			"#,
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS tracker_settings (
				key TEXT PRIMARY KEY NOT NULL,
				value TEXT NOT NULL
			)
			"#,
		)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	pub async fn close(&self) {
		self.pool.close().await;
	}
}

#[async_trait]
impl PersistentStore for SqliteStore {
	async fn append(&self, record: &EventRecord) -> Result<(), StorageError> {
		let params = serde_json::to_string(record.params())?;

		sqlx::query("INSERT INTO queued_events (sequence_id, params, enqueued_at) VALUES (?, ?, ?)")
			.bind(record.sequence_id().0)
			.bind(params)
			.bind(record.enqueued_at().to_rfc3339())
			.execute(&self.pool)
			.await?;

		Ok(())
	}

	async fn delete_by_ids(&self, ids: &[SequenceId]) -> Result<u64, StorageError> {
		if ids.is_empty() {
			return Ok(0);
		}

		let mut tx = self.pool.begin().await?;
		let mut deleted = 0;

		for chunk in ids.chunks(DELETE_CHUNK) {
			let mut query: QueryBuilder<Sqlite> =
				QueryBuilder::new("DELETE FROM queued_events WHERE sequence_id IN (");
			let mut separated = query.separated(", ");
			for id in chunk {
				separated.push_bind(id.0);
			}
			separated.push_unseparated(")");

			deleted += query.build().execute(&mut *tx).await?.rows_affected();
		}

		tx.commit().await?;
		Ok(deleted)
	}

	async fn load_all(&self) -> Result<Backlog, StorageError> {
		let rows: Vec<(i64, String, String)> = sqlx::query_as(
			"SELECT sequence_id, params, enqueued_at FROM queued_events ORDER BY sequence_id ASC",
		)
		.fetch_all(&self.pool)
		.await?;

		let mut backlog = Backlog::default();
		for (sequence_id, params, enqueued_at) in rows {
			match decode_row(sequence_id, &params, &enqueued_at) {
				Ok(record) => backlog.records.push(record),
				Err(error) => backlog.corrupt.push(CorruptRecord {
					sequence_id: SequenceId(sequence_id),
					error,
				}),
			}
		}
		Ok(backlog)
	}

	async fn clear_all(&self) -> Result<(), StorageError> {
		sqlx::query("DELETE FROM queued_events")
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn load_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
		let value: Option<(String,)> =
			sqlx::query_as("SELECT value FROM tracker_settings WHERE key = ?")
				.bind(key)
				.fetch_optional(&self.pool)
				.await?;
		Ok(value.map(|(v,)| v))
	}

	async fn save_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
		sqlx::query(
			r#"
			INSERT INTO tracker_settings (key, value) VALUES (?, ?)
			ON CONFLICT(key) DO UPDATE SET value = excluded.value
			"#,
		)
		.bind(key)
		.bind(value)
		.execute(&self.pool)
		.await?;
		Ok(())
	}
}

fn decode_row(sequence_id: i64, params: &str, enqueued_at: &str) -> Result<EventRecord, StorageError> {
	let params: EventParams = serde_json::from_str(params).map_err(|e| StorageError::Corrupt {
		sequence_id,
		message: format!("params: {e}"),
	})?;
	let enqueued_at = DateTime::parse_from_rfc3339(enqueued_at)
		.map_err(|e| StorageError::Corrupt {
			sequence_id,
			message: format!("enqueued_at: {e}"),
		})?
		.with_timezone(&Utc);
	Ok(EventRecord::new(SequenceId(sequence_id), params, enqueued_at))
}
