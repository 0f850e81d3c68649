// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Activity reported by application code.

use serde::{Deserialize, Serialize};

/// A discrete piece of trackable activity, before it becomes an [`EventRecord`].
///
/// [`EventRecord`]: crate::EventRecord
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackedEvent {
	/// A screen view. Hierarchical names are given as ordered path segments,
	/// e.g. `["settings", "register"]`.
	ScreenView { path: Vec<String> },

	/// A custom event, tracked as `category/action[/label]`.
	Event {
		category: String,
		action: String,
		label: Option<String>,
	},

	/// A caught exception or error.
	Exception { description: String, fatal: bool },

	/// An interaction with a social network.
	Social {
		action: String,
		target: String,
		network: String,
	},

	/// A goal conversion.
	Goal { goal_id: String, revenue: u64 },

	/// A search performed in the application.
	Search {
		keyword: String,
		category: Option<String>,
		hits: Option<u64>,
	},
}

impl TrackedEvent {
	pub fn screen_view(screen: impl Into<String>) -> Self {
		TrackedEvent::ScreenView {
			path: vec![screen.into()],
		}
	}

	pub fn screen_views<I, S>(segments: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		TrackedEvent::ScreenView {
			path: segments.into_iter().map(Into::into).collect(),
		}
	}

	pub fn event(
		category: impl Into<String>,
		action: impl Into<String>,
		label: Option<String>,
	) -> Self {
		TrackedEvent::Event {
			category: category.into(),
			action: action.into(),
			label,
		}
	}

	pub fn exception(description: impl Into<String>, fatal: bool) -> Self {
		TrackedEvent::Exception {
			description: description.into(),
			fatal,
		}
	}

	pub fn social(
		action: impl Into<String>,
		target: impl Into<String>,
		network: impl Into<String>,
	) -> Self {
		TrackedEvent::Social {
			action: action.into(),
			target: target.into(),
			network: network.into(),
		}
	}

	pub fn goal(goal_id: impl Into<String>, revenue: u64) -> Self {
		TrackedEvent::Goal {
			goal_id: goal_id.into(),
			revenue,
		}
	}

	pub fn search(keyword: impl Into<String>, category: Option<String>, hits: Option<u64>) -> Self {
		TrackedEvent::Search {
			keyword: keyword.into(),
			category,
			hits,
		}
	}

	/// Short name of the event kind, used in logs.
	pub fn kind(&self) -> &'static str {
		match self {
			TrackedEvent::ScreenView { .. } => "screen_view",
			TrackedEvent::Event { .. } => "event",
			TrackedEvent::Exception { .. } => "exception",
			TrackedEvent::Social { .. } => "social",
			TrackedEvent::Goal { .. } => "goal",
			TrackedEvent::Search { .. } => "search",
		}
	}
}
