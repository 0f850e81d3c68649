// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Visitor identity and visit counting.
//!
//! The state is created on first launch and persisted by the tracker, so the
//! client id survives restarts and upgrades.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of the hex client id expected by the collector.
pub const CLIENT_ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorState {
	/// Unique visitor id, 16 lowercase hex characters.
	pub client_id: String,
	pub first_visit_at: DateTime<Utc>,
	pub previous_visit_at: DateTime<Utc>,
	pub current_visit_at: DateTime<Utc>,
	pub visit_count: u32,
}

impl VisitorState {
	/// Creates state for a visitor seen for the first time. No visit has started yet.
	pub fn first_launch(now: DateTime<Utc>) -> Self {
		let hex = Uuid::new_v4().simple().to_string();
		Self {
			client_id: hex[..CLIENT_ID_LEN].to_string(),
			first_visit_at: now,
			previous_visit_at: now,
			current_visit_at: now,
			visit_count: 0,
		}
	}

	/// Begins a new visit, rolling the current visit into the previous one.
	pub fn start_visit(&mut self, now: DateTime<Utc>) {
		if self.visit_count > 0 {
			self.previous_visit_at = self.current_visit_at;
		}
		self.current_visit_at = now;
		self.visit_count = self.visit_count.saturating_add(1);
	}
}
