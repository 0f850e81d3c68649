// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event records and their collector parameters.
//!
//! An [`EventRecord`] is immutable once created: the queue only ever appends or
//! removes whole records. The [`EventParams`] it carries are opaque to the
//! dispatch engine, which only counts and encodes them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonically increasing id assigned at enqueue time. Defines delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(pub i64);

impl SequenceId {
	/// The id that follows this one.
	pub fn next(self) -> Self {
		Self(self.0 + 1)
	}
}

impl fmt::Display for SequenceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A single collector parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
	Text(String),
	Integer(i64),
	Float(f64),
}

impl fmt::Display for ParamValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ParamValue::Text(s) => f.write_str(s),
			ParamValue::Integer(n) => write!(f, "{n}"),
			ParamValue::Float(n) => write!(f, "{n}"),
		}
	}
}

impl From<String> for ParamValue {
	fn from(value: String) -> Self {
		ParamValue::Text(value)
	}
}

impl From<&str> for ParamValue {
	fn from(value: &str) -> Self {
		ParamValue::Text(value.to_string())
	}
}

impl From<i64> for ParamValue {
	fn from(value: i64) -> Self {
		ParamValue::Integer(value)
	}
}

impl From<u32> for ParamValue {
	fn from(value: u32) -> Self {
		ParamValue::Integer(i64::from(value))
	}
}

impl From<f64> for ParamValue {
	fn from(value: f64) -> Self {
		ParamValue::Float(value)
	}
}

/// Ordered mapping of protocol parameter name to value.
///
/// Insertion order is preserved through persistence and encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventParams {
	pairs: Vec<(String, ParamValue)>,
}

impl EventParams {
	/// Creates an empty parameter list.
	pub fn new() -> Self {
		Self { pairs: Vec::new() }
	}

	/// Sets a parameter. An existing key keeps its position; a new key is appended.
	pub fn insert<K, V>(&mut self, key: K, value: V)
	where
		K: Into<String>,
		V: Into<ParamValue>,
	{
		let key = key.into();
		let value = value.into();
		match self.pairs.iter_mut().find(|(k, _)| *k == key) {
			Some((_, existing)) => *existing = value,
			None => self.pairs.push((key, value)),
		}
	}

	/// Builder-style variant of [`EventParams::insert`].
	pub fn with<K, V>(mut self, key: K, value: V) -> Self
	where
		K: Into<String>,
		V: Into<ParamValue>,
	{
		self.insert(key, value);
		self
	}

	/// Gets a value by key.
	pub fn get(&self, key: &str) -> Option<&ParamValue> {
		self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
	}

	/// Iterates over the parameters in insertion order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
		self.pairs.iter().map(|(k, v)| (k.as_str(), v))
	}

	pub fn len(&self) -> usize {
		self.pairs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pairs.is_empty()
	}
}

impl<K, V> FromIterator<(K, V)> for EventParams
where
	K: Into<String>,
	V: Into<ParamValue>,
{
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		let mut params = EventParams::new();
		for (k, v) in iter {
			params.insert(k, v);
		}
		params
	}
}

/// One immutable unit of trackable activity ready for transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
	sequence_id: SequenceId,
	params: EventParams,
	enqueued_at: DateTime<Utc>,
}

impl EventRecord {
	pub fn new(sequence_id: SequenceId, params: EventParams, enqueued_at: DateTime<Utc>) -> Self {
		Self {
			sequence_id,
			params,
			enqueued_at,
		}
	}

	pub fn sequence_id(&self) -> SequenceId {
		self.sequence_id
	}

	pub fn params(&self) -> &EventParams {
		&self.params
	}

	/// When the record entered the queue. Diagnostics only.
	pub fn enqueued_at(&self) -> DateTime<Utc> {
		self.enqueued_at
	}
}
