// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for building event records.

use thiserror::Error;

/// Invalid caller input, rejected before anything reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuilderError {
	/// A required field was empty.
	#[error("{0} must not be empty")]
	EmptyField(&'static str),

	/// The site id is missing or not usable.
	#[error("invalid site id: {0:?}")]
	InvalidSiteId(String),

	/// A field had a value the collector cannot accept.
	#[error("invalid value for {field}: {message}")]
	InvalidValue {
		field: &'static str,
		message: String,
	},
}

/// Result type alias for builder operations.
pub type Result<T> = std::result::Result<T, BuilderError>;
