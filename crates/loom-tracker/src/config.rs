// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tracker configuration.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `LOOM_TRACKER_*` environment variables. The result is validated before
//! a tracker is built from it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use loom_common_http::RetryConfig;
use serde::Deserialize;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "LOOM_TRACKER_";

/// Shortest timer period. Smaller positive intervals are raised to it.
pub const MIN_DISPATCH_PERIOD: Duration = Duration::from_secs(1);
/// Longest timer period accepted by configuration.
pub const MAX_DISPATCH_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Upper bound for the backoff settings, in seconds.
pub const MAX_BACKOFF_SECS: u64 = 24 * 60 * 60;

/// When the dispatcher flushes the queue on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DispatchInterval {
	/// No timer. Only manual dispatch sends events.
	Manual,
	/// Flush as soon as anything is queued, draining while a backlog exists.
	Continuous,
	/// Flush on a recurring timer.
	Every(Duration),
}

impl DispatchInterval {
	/// Negative means manual, zero means continuous. Non-finite values are manual.
	/// Positive values are clamped to `MIN_DISPATCH_PERIOD..=MAX_DISPATCH_PERIOD`.
	pub fn from_secs_f64(secs: f64) -> Self {
		if !secs.is_finite() || secs < 0.0 {
			DispatchInterval::Manual
		} else if secs == 0.0 {
			DispatchInterval::Continuous
		} else {
			let secs = secs.clamp(
				MIN_DISPATCH_PERIOD.as_secs_f64(),
				MAX_DISPATCH_PERIOD.as_secs_f64(),
			);
			DispatchInterval::Every(Duration::try_from_secs_f64(secs).unwrap_or(MAX_DISPATCH_PERIOD))
		}
	}

	/// Clamps a timer period into the supported range.
	pub fn normalized(self) -> Self {
		match self {
			DispatchInterval::Every(period) => {
				DispatchInterval::Every(period.clamp(MIN_DISPATCH_PERIOD, MAX_DISPATCH_PERIOD))
			}
			other => other,
		}
	}
}

/// Bulk request schema understood by the collector. Chosen once per tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkEncoding {
	/// JSON body with an array of query strings (Piwik 2.0 and later).
	#[default]
	Current,
	/// Numbered form fields (Piwik 1.x).
	Legacy,
}

impl FromStr for BulkEncoding {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"current" => Ok(BulkEncoding::Current),
			"legacy" => Ok(BulkEncoding::Legacy),
			other => Err(ConfigError::invalid_value(
				"bulk_encoding",
				format!("expected 'current' or 'legacy', got '{other}'"),
			)),
		}
	}
}

/// Tracker configuration.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
	/// Collector base URL, without the `/piwik.php` path.
	pub base_url: Option<String>,
	pub site_id: Option<String>,
	/// Required for bulk requests.
	pub auth_token: Option<String>,
	pub app_name: String,
	pub app_version: String,
	pub prefixing: bool,
	/// Negative = manual dispatch only, zero = continuous.
	pub dispatch_interval_secs: f64,
	pub max_queued_events: usize,
	pub events_per_request: usize,
	/// Percentage of events kept, 0-100.
	pub sample_rate: f64,
	pub debug: bool,
	pub bulk_encoding: BulkEncoding,
	pub request_timeout_secs: u64,
	pub backoff_base_secs: u64,
	pub backoff_max_secs: u64,
	/// Idle time after which the next event starts a new visit. Zero disables.
	pub session_timeout_secs: u64,
	/// SQLite database file. Defaults to the platform data directory.
	pub database_path: Option<PathBuf>,
}

impl Default for TrackerConfig {
	fn default() -> Self {
		Self {
			base_url: None,
			site_id: None,
			auth_token: None,
			app_name: "loom-app".to_string(),
			app_version: "unknown".to_string(),
			prefixing: true,
			dispatch_interval_secs: 120.0,
			max_queued_events: 500,
			events_per_request: 20,
			sample_rate: 100.0,
			debug: false,
			bulk_encoding: BulkEncoding::Current,
			request_timeout_secs: 30,
			backoff_base_secs: 5,
			backoff_max_secs: 300,
			session_timeout_secs: 120,
			database_path: None,
		}
	}
}

impl fmt::Debug for TrackerConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TrackerConfig")
			.field("base_url", &self.base_url)
			.field("site_id", &self.site_id)
			.field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
			.field("app_name", &self.app_name)
			.field("app_version", &self.app_version)
			.field("prefixing", &self.prefixing)
			.field("dispatch_interval_secs", &self.dispatch_interval_secs)
			.field("max_queued_events", &self.max_queued_events)
			.field("events_per_request", &self.events_per_request)
			.field("sample_rate", &self.sample_rate)
			.field("debug", &self.debug)
			.field("bulk_encoding", &self.bulk_encoding)
			.field("request_timeout_secs", &self.request_timeout_secs)
			.field("backoff_base_secs", &self.backoff_base_secs)
			.field("backoff_max_secs", &self.backoff_max_secs)
			.field("session_timeout_secs", &self.session_timeout_secs)
			.field("database_path", &self.database_path)
			.finish()
	}
}

impl TrackerConfig {
	/// Loads defaults, then the optional TOML file, then environment overrides,
	/// and validates the result.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let mut config = match path {
			Some(path) => Self::from_file(path)?,
			None => Self::default(),
		};
		config.apply_env_overrides()?;
		config.validate()?;
		Ok(config)
	}

	/// Parses a TOML document. Missing keys keep their defaults.
	pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(contents)?)
	}

	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		let config = Self::from_toml_str(&contents)?;
		tracing::debug!(path = %path.display(), "loaded tracker config file");
		Ok(config)
	}

	/// Applies `LOOM_TRACKER_*` environment variables.
	pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
		self.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
	}

	/// Applies overrides from an arbitrary key lookup (keys without prefix).
	pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		if let Some(v) = lookup("BASE_URL") {
			self.base_url = Some(v);
		}
		if let Some(v) = lookup("SITE_ID") {
			self.site_id = Some(v);
		}
		if let Some(v) = lookup("AUTH_TOKEN") {
			self.auth_token = Some(v).filter(|t| !t.is_empty());
		}
		if let Some(v) = lookup("APP_NAME") {
			self.app_name = v;
		}
		if let Some(v) = lookup("APP_VERSION") {
			self.app_version = v;
		}
		if let Some(v) = lookup("PREFIXING") {
			self.prefixing = parse_bool("prefixing", &v)?;
		}
		if let Some(v) = lookup("DISPATCH_INTERVAL_SECS") {
			self.dispatch_interval_secs = parse_value("dispatch_interval_secs", &v)?;
		}
		if let Some(v) = lookup("MAX_QUEUED_EVENTS") {
			self.max_queued_events = parse_value("max_queued_events", &v)?;
		}
		if let Some(v) = lookup("EVENTS_PER_REQUEST") {
			self.events_per_request = parse_value("events_per_request", &v)?;
		}
		if let Some(v) = lookup("SAMPLE_RATE") {
			self.sample_rate = parse_value("sample_rate", &v)?;
		}
		if let Some(v) = lookup("DEBUG") {
			self.debug = parse_bool("debug", &v)?;
		}
		if let Some(v) = lookup("BULK_ENCODING") {
			self.bulk_encoding = v.parse()?;
		}
		if let Some(v) = lookup("REQUEST_TIMEOUT_SECS") {
			self.request_timeout_secs = parse_value("request_timeout_secs", &v)?;
		}
		if let Some(v) = lookup("BACKOFF_BASE_SECS") {
			self.backoff_base_secs = parse_value("backoff_base_secs", &v)?;
		}
		if let Some(v) = lookup("BACKOFF_MAX_SECS") {
			self.backoff_max_secs = parse_value("backoff_max_secs", &v)?;
		}
		if let Some(v) = lookup("SESSION_TIMEOUT_SECS") {
			self.session_timeout_secs = parse_value("session_timeout_secs", &v)?;
		}
		if let Some(v) = lookup("DATABASE_PATH") {
			self.database_path = Some(PathBuf::from(v));
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		let base_url = self
			.base_url
			.as_deref()
			.ok_or_else(|| ConfigError::missing_field("base_url"))?;
		let parsed = url::Url::parse(base_url)
			.map_err(|e| ConfigError::invalid_value("base_url", e.to_string()))?;
		if !matches!(parsed.scheme(), "http" | "https") {
			return Err(ConfigError::invalid_value(
				"base_url",
				format!("unsupported scheme '{}'", parsed.scheme()),
			));
		}

		match self.site_id.as_deref().map(str::trim) {
			None | Some("") => return Err(ConfigError::missing_field("site_id")),
			Some(_) => {}
		}

		if self.events_per_request == 0 {
			return Err(ConfigError::invalid_value(
				"events_per_request",
				"must be at least 1",
			));
		}
		if !(0.0..=100.0).contains(&self.sample_rate) {
			return Err(ConfigError::invalid_value(
				"sample_rate",
				"must be between 0 and 100",
			));
		}
		if self.dispatch_interval_secs.is_nan() {
			return Err(ConfigError::invalid_value(
				"dispatch_interval_secs",
				"must be a number",
			));
		}
		if self.dispatch_interval_secs > MAX_DISPATCH_PERIOD.as_secs_f64() {
			return Err(ConfigError::invalid_value(
				"dispatch_interval_secs",
				format!("must not exceed {} seconds", MAX_DISPATCH_PERIOD.as_secs()),
			));
		}
		if self.request_timeout_secs == 0 {
			return Err(ConfigError::invalid_value(
				"request_timeout_secs",
				"must be greater than 0",
			));
		}
		if self.backoff_max_secs > MAX_BACKOFF_SECS {
			return Err(ConfigError::invalid_value(
				"backoff_max_secs",
				format!("must not exceed {MAX_BACKOFF_SECS} seconds"),
			));
		}
		if self.backoff_max_secs < self.backoff_base_secs {
			return Err(ConfigError::invalid_value(
				"backoff_max_secs",
				"must not be smaller than backoff_base_secs",
			));
		}
		Ok(())
	}

	pub fn dispatch_interval(&self) -> DispatchInterval {
		DispatchInterval::from_secs_f64(self.dispatch_interval_secs)
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	pub fn session_timeout(&self) -> Option<Duration> {
		(self.session_timeout_secs > 0).then(|| Duration::from_secs(self.session_timeout_secs))
	}

	pub fn retry_config(&self) -> RetryConfig {
		RetryConfig {
			base_delay: Duration::from_secs(self.backoff_base_secs),
			max_delay: Duration::from_secs(self.backoff_max_secs),
			..RetryConfig::default()
		}
	}

	/// The database file to use: the configured path or `<data dir>/loom/tracker.db`.
	pub fn resolved_database_path(&self) -> Option<PathBuf> {
		self.database_path
			.clone()
			.or_else(|| dirs::data_dir().map(|dir| dir.join("loom").join("tracker.db")))
	}
}

fn parse_value<T: FromStr>(field: &str, value: &str) -> Result<T, ConfigError>
where
	T::Err: fmt::Display,
{
	value
		.trim()
		.parse()
		.map_err(|e: T::Err| ConfigError::invalid_value(field, e.to_string()))
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigError> {
	match value.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		other => Err(ConfigError::invalid_value(
			field,
			format!("expected a boolean, got '{other}'"),
		)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn valid() -> TrackerConfig {
		TrackerConfig {
			base_url: Some("https://stats.example.com".to_string()),
			site_id: Some("1".to_string()),
			..TrackerConfig::default()
		}
	}

	#[test]
	fn defaults_match_collector_conventions() {
		let config = TrackerConfig::default();
		assert_eq!(config.dispatch_interval(), DispatchInterval::Every(Duration::from_secs(120)));
		assert_eq!(config.max_queued_events, 500);
		assert_eq!(config.events_per_request, 20);
		assert_eq!(config.sample_rate, 100.0);
		assert!(config.prefixing);
		assert!(!config.debug);
		assert_eq!(config.session_timeout(), Some(Duration::from_secs(120)));
	}

	#[test]
	fn dispatch_interval_from_secs() {
		assert_eq!(DispatchInterval::from_secs_f64(-1.0), DispatchInterval::Manual);
		assert_eq!(DispatchInterval::from_secs_f64(f64::INFINITY), DispatchInterval::Manual);
		assert_eq!(DispatchInterval::from_secs_f64(0.0), DispatchInterval::Continuous);
		assert_eq!(
			DispatchInterval::from_secs_f64(2.5),
			DispatchInterval::Every(Duration::from_millis(2500))
		);
	}

	#[test]
	fn dispatch_interval_is_clamped_to_supported_periods() {
		assert_eq!(
			DispatchInterval::from_secs_f64(1e-12),
			DispatchInterval::Every(MIN_DISPATCH_PERIOD)
		);
		assert_eq!(
			DispatchInterval::from_secs_f64(1e30),
			DispatchInterval::Every(MAX_DISPATCH_PERIOD)
		);
		assert_eq!(
			DispatchInterval::from_secs_f64(f64::MAX),
			DispatchInterval::Every(MAX_DISPATCH_PERIOD)
		);
		assert_eq!(
			DispatchInterval::Every(Duration::ZERO).normalized(),
			DispatchInterval::Every(MIN_DISPATCH_PERIOD)
		);
		assert_eq!(
			DispatchInterval::Every(Duration::MAX).normalized(),
			DispatchInterval::Every(MAX_DISPATCH_PERIOD)
		);
		assert_eq!(DispatchInterval::Continuous.normalized(), DispatchInterval::Continuous);
	}

	#[test]
	fn parses_toml_with_partial_keys() {
		let config = TrackerConfig::from_toml_str(
			r#"
			base_url = "https://stats.example.com"
			site_id = "4"
			dispatch_interval_secs = -1
			events_per_request = 1
			bulk_encoding = "legacy"
			"#,
		)
		.unwrap();

		assert_eq!(config.site_id.as_deref(), Some("4"));
		assert_eq!(config.dispatch_interval(), DispatchInterval::Manual);
		assert_eq!(config.events_per_request, 1);
		assert_eq!(config.bulk_encoding, BulkEncoding::Legacy);
		assert_eq!(config.max_queued_events, 500);
		config.validate().unwrap();
	}

	#[test]
	fn rejects_malformed_toml() {
		let result = TrackerConfig::from_toml_str("events_per_request = \"many\"");
		assert!(matches!(result, Err(ConfigError::TomlParse(_))));
	}

	#[test]
	fn from_file_reads_toml() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tracker.toml");
		std::fs::write(&path, "site_id = \"9\"\ndebug = true\n").unwrap();

		let config = TrackerConfig::from_file(&path).unwrap();
		assert_eq!(config.site_id.as_deref(), Some("9"));
		assert!(config.debug);
	}

	#[test]
	fn from_file_reports_missing_file() {
		let result = TrackerConfig::from_file(Path::new("/nonexistent/tracker.toml"));
		assert!(matches!(result, Err(ConfigError::Io { .. })));
	}

	#[test]
	fn overrides_take_precedence() {
		let vars: HashMap<&str, &str> = [
			("SITE_ID", "12"),
			("DEBUG", "yes"),
			("DISPATCH_INTERVAL_SECS", "0"),
			("BULK_ENCODING", "Legacy"),
			("AUTH_TOKEN", ""),
		]
		.into_iter()
		.collect();

		let mut config = valid();
		config.auth_token = Some("abc".to_string());
		config
			.apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
			.unwrap();

		assert_eq!(config.site_id.as_deref(), Some("12"));
		assert!(config.debug);
		assert_eq!(config.dispatch_interval(), DispatchInterval::Continuous);
		assert_eq!(config.bulk_encoding, BulkEncoding::Legacy);
		assert_eq!(config.auth_token, None);
	}

	#[test]
	fn backoff_and_session_settings_have_overrides() {
		let vars: HashMap<&str, &str> = [
			("BACKOFF_BASE_SECS", "3"),
			("BACKOFF_MAX_SECS", "90"),
			("SESSION_TIMEOUT_SECS", "0"),
		]
		.into_iter()
		.collect();

		let mut config = valid();
		config
			.apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
			.unwrap();

		assert_eq!(config.backoff_base_secs, 3);
		assert_eq!(config.backoff_max_secs, 90);
		assert_eq!(config.retry_config().max_delay, Duration::from_secs(90));
		assert_eq!(config.session_timeout(), None);
	}

	#[test]
	fn invalid_override_is_reported_with_field() {
		let mut config = valid();
		let err = config
			.apply_overrides(|key| (key == "MAX_QUEUED_EVENTS").then(|| "lots".to_string()))
			.unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "max_queued_events"));
	}

	#[test]
	fn validate_requires_identity() {
		let missing_url = TrackerConfig {
			base_url: None,
			..valid()
		};
		assert!(matches!(missing_url.validate(), Err(ConfigError::MissingField(f)) if f == "base_url"));

		let missing_site = TrackerConfig {
			site_id: Some(" ".to_string()),
			..valid()
		};
		assert!(matches!(missing_site.validate(), Err(ConfigError::MissingField(f)) if f == "site_id"));

		let bad_scheme = TrackerConfig {
			base_url: Some("ftp://stats.example.com".to_string()),
			..valid()
		};
		assert!(matches!(bad_scheme.validate(), Err(ConfigError::InvalidValue { .. })));
	}

	#[test]
	fn validate_checks_ranges() {
		for config in [
			TrackerConfig {
				events_per_request: 0,
				..valid()
			},
			TrackerConfig {
				sample_rate: 101.0,
				..valid()
			},
			TrackerConfig {
				request_timeout_secs: 0,
				..valid()
			},
			TrackerConfig {
				backoff_base_secs: 10,
				backoff_max_secs: 5,
				..valid()
			},
			TrackerConfig {
				dispatch_interval_secs: 1e30,
				..valid()
			},
			TrackerConfig {
				backoff_max_secs: u64::MAX,
				..valid()
			},
			TrackerConfig {
				backoff_base_secs: u64::MAX,
				backoff_max_secs: u64::MAX,
				..valid()
			},
		] {
			assert!(config.validate().is_err(), "{config:?} should be invalid");
		}
		valid().validate().unwrap();
	}

	#[test]
	fn debug_output_redacts_token() {
		let config = TrackerConfig {
			auth_token: Some("super-secret".to_string()),
			..valid()
		};
		let output = format!("{config:?}");
		assert!(!output.contains("super-secret"));
		assert!(output.contains("[REDACTED]"));
	}

	#[test]
	fn retry_config_uses_backoff_settings() {
		let config = TrackerConfig {
			backoff_base_secs: 2,
			backoff_max_secs: 60,
			..valid()
		};
		let retry = config.retry_config();
		assert_eq!(retry.base_delay, Duration::from_secs(2));
		assert_eq!(retry.max_delay, Duration::from_secs(60));
	}
}
