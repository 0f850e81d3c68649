// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the tracker engine.

use std::path::PathBuf;

use loom_tracker_core::BuilderError;
use thiserror::Error;

/// Persistence-layer failure. Fatal to the triggering call; queue state is left unchanged.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Database error.
	#[error("database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	/// Stored data could not be (de)serialized.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// A stored row is not a valid record.
	#[error("corrupt record {sequence_id}: {message}")]
	Corrupt { sequence_id: i64, message: String },

	/// The store cannot be reached (closed pool, missing directory, ...).
	#[error("storage unavailable: {0}")]
	Unavailable(String),
}

/// Errors loading or validating tracker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// I/O error reading config file
	#[error("I/O error reading {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// TOML parsing error
	#[error("TOML parse error: {0}")]
	TomlParse(#[from] toml::de::Error),

	/// Missing required field
	#[error("missing required field: {0}")]
	MissingField(String),

	/// Invalid value
	#[error("invalid value for {field}: {message}")]
	InvalidValue { field: String, message: String },
}

impl ConfigError {
	/// Create a missing field error
	pub fn missing_field(field: impl Into<String>) -> Self {
		Self::MissingField(field.into())
	}

	/// Create an invalid value error
	pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
		Self::InvalidValue {
			field: field.into(),
			message: message.into(),
		}
	}
}

/// Tracker errors.
#[derive(Debug, Error)]
pub enum TrackerError {
	/// Base URL is missing or invalid.
	#[error("invalid base URL: {0}")]
	InvalidBaseUrl(String),

	/// Site id was not configured.
	#[error("site id is required")]
	MissingSiteId,

	/// Configuration could not be loaded or is invalid.
	#[error(transparent)]
	Config(#[from] ConfigError),

	/// Persistence failed.
	#[error(transparent)]
	Storage(#[from] StorageError),

	/// The event was rejected by the record builder.
	#[error("invalid event: {0}")]
	Builder(#[from] BuilderError),

	/// HTTP client could not be constructed.
	#[error("HTTP client error: {0}")]
	Http(#[from] reqwest::Error),

	/// Serialization error.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// Tracker has been shut down.
	#[error("tracker has been shut down")]
	ClientShutdown,
}

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
