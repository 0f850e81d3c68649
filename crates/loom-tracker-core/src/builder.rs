// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Turning tracked activity into collector parameters.
//!
//! The dispatch engine never interprets individual parameters. Everything the
//! collector needs to know about an event is decided here, once, before the
//! record is queued.

use chrono::{DateTime, Timelike, Utc};

use crate::error::{BuilderError, Result};
use crate::event::TrackedEvent;
use crate::record::EventParams;
use crate::visitor::VisitorState;

/// Maximum length of an exception description, in characters.
pub const MAX_EXCEPTION_DESCRIPTION_CHARS: usize = 50;

const SCREEN_PREFIX: &str = "screen";
const EVENT_PREFIX: &str = "event";
const EXCEPTION_PREFIX: &str = "exception";
const SOCIAL_PREFIX: &str = "social";

/// Ambient context for a single event.
#[derive(Debug, Clone, Copy)]
pub struct VisitContext<'a> {
	pub visitor: &'a VisitorState,
	/// True for the first event of a new session.
	pub new_visit: bool,
	pub now: DateTime<Utc>,
}

/// Produces validated collector parameters for a tracked event.
///
/// Implementations must be pure with respect to the queue: an error here means
/// nothing is persisted.
pub trait RecordBuilder: Send + Sync {
	fn produce(&self, event: &TrackedEvent, visit: &VisitContext<'_>) -> Result<EventParams>;
}

/// Static settings for [`PiwikRecordBuilder`].
#[derive(Debug, Clone)]
pub struct BuilderSettings {
	/// Site id generated by the collector for this application.
	pub site_id: String,
	pub app_name: String,
	pub app_version: String,
	/// Prefix screen views, events, exceptions and social interactions by type.
	pub prefixing: bool,
}

/// Builds parameters for the Piwik tracking API.
#[derive(Debug, Clone)]
pub struct PiwikRecordBuilder {
	settings: BuilderSettings,
}

impl PiwikRecordBuilder {
	pub fn new(settings: BuilderSettings) -> Result<Self> {
		let site_id = settings.site_id.trim();
		if site_id.is_empty() || site_id.chars().any(char::is_whitespace) {
			return Err(BuilderError::InvalidSiteId(settings.site_id));
		}
		if settings.app_name.trim().is_empty() {
			return Err(BuilderError::EmptyField("app_name"));
		}
		Ok(Self { settings })
	}

	pub fn settings(&self) -> &BuilderSettings {
		&self.settings
	}

	fn common_params(&self, visit: &VisitContext<'_>) -> EventParams {
		let visitor = visit.visitor;
		let mut params = EventParams::new()
			.with("idsite", self.settings.site_id.as_str())
			.with("rec", 1i64)
			.with("apiv", 1i64)
			.with("_id", visitor.client_id.as_str())
			.with("rand", fastrand::u32(..))
			.with("_idvc", visitor.visit_count)
			.with("_idts", visitor.first_visit_at.timestamp())
			.with("_viewts", visitor.previous_visit_at.timestamp());

		if visit.new_visit {
			params.insert("new_visit", 1i64);
		}

		params.insert("h", visit.now.hour());
		params.insert("m", visit.now.minute());
		params.insert("s", visit.now.second());
		params.insert("cdt", visit.now.format("%Y-%m-%d %H:%M:%S").to_string());
		params.insert("_cvar", self.custom_variables());
		params
	}

	fn custom_variables(&self) -> String {
		serde_json::json!({
			"1": ["Platform", std::env::consts::OS],
			"2": ["App name", self.settings.app_name],
			"3": ["App version", self.settings.app_version],
		})
		.to_string()
	}

	fn action_path(&self, prefix: &'static str, segments: &[&str]) -> String {
		let mut parts = Vec::with_capacity(segments.len() + 1);
		if self.settings.prefixing {
			parts.push(prefix);
		}
		parts.extend_from_slice(segments);
		parts.join("/")
	}

	fn action_url(&self, path: &str) -> String {
		format!("http://{}/{}", self.settings.app_name, path)
	}

	fn push_action(&self, params: &mut EventParams, prefix: &'static str, segments: &[&str]) {
		let path = self.action_path(prefix, segments);
		params.insert("url", self.action_url(&path));
		params.insert("action_name", path);
	}
}

impl RecordBuilder for PiwikRecordBuilder {
	fn produce(&self, event: &TrackedEvent, visit: &VisitContext<'_>) -> Result<EventParams> {
		let mut params = self.common_params(visit);

		match event {
			TrackedEvent::ScreenView { path } => {
				if path.is_empty() {
					return Err(BuilderError::EmptyField("screen"));
				}
				let segments = path
					.iter()
					.map(|s| required("screen segment", s))
					.collect::<Result<Vec<_>>>()?;
				self.push_action(&mut params, SCREEN_PREFIX, &segments);
			}
			TrackedEvent::Event {
				category,
				action,
				label,
			} => {
				let mut segments = vec![required("category", category)?, required("action", action)?];
				if let Some(label) = label.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
					segments.push(label);
				}
				self.push_action(&mut params, EVENT_PREFIX, &segments);
			}
			TrackedEvent::Exception { description, fatal } => {
				let description = truncate_chars(
					required("description", description)?,
					MAX_EXCEPTION_DESCRIPTION_CHARS,
				);
				let severity = if *fatal { "fatal" } else { "caught" };
				self.push_action(&mut params, EXCEPTION_PREFIX, &[severity, description]);
			}
			TrackedEvent::Social {
				action,
				target,
				network,
			} => {
				let segments = [
					required("network", network)?,
					required("action", action)?,
					required("target", target)?,
				];
				self.push_action(&mut params, SOCIAL_PREFIX, &segments);
			}
			TrackedEvent::Goal { goal_id, revenue } => {
				let goal_id = required("goal_id", goal_id)?;
				let revenue = i64::try_from(*revenue).map_err(|_| BuilderError::InvalidValue {
					field: "revenue",
					message: format!("{revenue} does not fit the collector's integer range"),
				})?;
				params.insert("url", self.action_url(""));
				params.insert("idgoal", goal_id);
				params.insert("revenue", revenue);
			}
			TrackedEvent::Search {
				keyword,
				category,
				hits,
			} => {
				params.insert("url", self.action_url(""));
				params.insert("search", required("keyword", keyword)?);
				if let Some(category) = category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
					params.insert("search_cat", category);
				}
				if let Some(hits) = hits {
					params.insert("search_count", i64::try_from(*hits).unwrap_or(i64::MAX));
				}
			}
		}

		Ok(params)
	}
}

fn required<'a>(field: &'static str, value: &'a str) -> Result<&'a str> {
	let trimmed = value.trim();
	if trimmed.is_empty() {
		return Err(BuilderError::EmptyField(field));
	}
	Ok(trimmed)
}

fn truncate_chars(value: &str, max: usize) -> &str {
	match value.char_indices().nth(max) {
		Some((idx, _)) => &value[..idx],
		None => value,
	}
}

/// Probability, in percent, that an event is sampled and queued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRate(f64);

impl SampleRate {
	/// Every event is sampled.
	pub const ALL: SampleRate = SampleRate(100.0);

	/// Creates a sample rate, clamped to 0..=100. NaN samples everything.
	pub fn new(percent: f64) -> Self {
		if percent.is_nan() {
			return Self::ALL;
		}
		Self(percent.clamp(0.0, 100.0))
	}

	pub fn percent(&self) -> f64 {
		self.0
	}

	/// Draws whether the next event should be kept.
	pub fn should_sample(&self) -> bool {
		if self.0 >= 100.0 {
			return true;
		}
		if self.0 <= 0.0 {
			return false;
		}
		fastrand::f64() * 100.0 < self.0
	}
}

impl Default for SampleRate {
	fn default() -> Self {
		Self::ALL
	}
}
