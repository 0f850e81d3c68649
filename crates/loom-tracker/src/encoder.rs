// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Serializes queued records into collector requests.
//!
//! Every [`EncodedRequest`] carries the exact ids it represents, so the outcome
//! handler deletes precisely those records and nothing that was enqueued while
//! the batch was on the wire.

use loom_tracker_core::{EventParams, EventRecord, SequenceId};
use serde::Serialize;
use url::form_urlencoded;

use crate::config::BulkEncoding;

const TOKEN_AUTH: &str = "token_auth";

/// Serialized request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
	/// `application/x-www-form-urlencoded`
	Form(String),
	/// `application/json`
	Json(String),
}

impl RequestBody {
	pub fn content_type(&self) -> &'static str {
		match self {
			RequestBody::Form(_) => "application/x-www-form-urlencoded",
			RequestBody::Json(_) => "application/json",
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			RequestBody::Form(body) | RequestBody::Json(body) => body,
		}
	}
}

/// One outbound request and the records it delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRequest {
	pub body: RequestBody,
	pub ids: Vec<SequenceId>,
}

#[derive(Serialize)]
struct BulkEnvelope<'a> {
	requests: Vec<String>,
	token_auth: &'a str,
}

/// Encodes batches for the configured bulk schema.
#[derive(Clone)]
pub struct BatchEncoder {
	encoding: BulkEncoding,
	auth_token: Option<String>,
}

impl std::fmt::Debug for BatchEncoder {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BatchEncoder")
			.field("encoding", &self.encoding)
			.field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
			.finish()
	}
}

impl BatchEncoder {
	pub fn new(encoding: BulkEncoding, auth_token: Option<String>) -> Self {
		let auth_token = auth_token.filter(|t| !t.trim().is_empty());
		Self {
			encoding,
			auth_token,
		}
	}

	pub fn encoding(&self) -> BulkEncoding {
		self.encoding
	}

	/// Bulk requests are only possible with an auth token.
	pub fn supports_bulk(&self) -> bool {
		self.auth_token.is_some()
	}

	/// Encodes `records` (oldest first) into one or more requests.
	///
	/// A batch of one record, an `events_per_request` of one, or a missing auth
	/// token yields one single-event request per record, in order. Otherwise the
	/// records go out as a single bulk request.
	pub fn encode(
		&self,
		records: &[EventRecord],
		events_per_request: usize,
	) -> Result<Vec<EncodedRequest>, serde_json::Error> {
		if records.is_empty() {
			return Ok(Vec::new());
		}

		let token = match self.auth_token.as_deref() {
			Some(token) if records.len() > 1 && events_per_request > 1 => token,
			_ => return Ok(records.iter().map(|r| self.encode_single(r)).collect()),
		};

		let ids = records.iter().map(EventRecord::sequence_id).collect();
		let body = match self.encoding {
			BulkEncoding::Current => {
				let envelope = BulkEnvelope {
					requests: records
						.iter()
						.map(|r| format!("?{}", query_string(r.params())))
						.collect(),
					token_auth: token,
				};
				RequestBody::Json(serde_json::to_string(&envelope)?)
			}
			BulkEncoding::Legacy => {
				let mut form = form_urlencoded::Serializer::new(String::new());
				for (index, record) in records.iter().enumerate() {
					form.append_pair(
						&format!("requests[{index}]"),
						&query_string(record.params()),
					);
				}
				form.append_pair(TOKEN_AUTH, token);
				RequestBody::Form(form.finish())
			}
		};

		Ok(vec![EncodedRequest { body, ids }])
	}

	fn encode_single(&self, record: &EventRecord) -> EncodedRequest {
		let mut form = form_urlencoded::Serializer::new(String::new());
		append_params(&mut form, record.params());
		if let Some(token) = &self.auth_token {
			form.append_pair(TOKEN_AUTH, token);
		}
		EncodedRequest {
			body: RequestBody::Form(form.finish()),
			ids: vec![record.sequence_id()],
		}
	}
}

fn append_params(form: &mut form_urlencoded::Serializer<'_, String>, params: &EventParams) {
	for (key, value) in params.iter() {
		form.append_pair(key, &value.to_string());
	}
}

/// Parameters in stored order as a query string, without the leading `?`.
pub fn query_string(params: &EventParams) -> String {
	let mut form = form_urlencoded::Serializer::new(String::new());
	append_params(&mut form, params);
	form.finish()
}
