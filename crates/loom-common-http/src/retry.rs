// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Failure classification and exponential backoff.

use std::time::Duration;

const DEFAULT_BASE_DELAY_SECS: u64 = 5;
const DEFAULT_MAX_DELAY_SECS: u64 = 300;
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Errors that know whether retrying the same request could succeed.
pub trait RetryableError {
	/// Returns true if the failure is transient and the request may be retried.
	fn is_retryable(&self) -> bool;
}

impl RetryableError for reqwest::Error {
	fn is_retryable(&self) -> bool {
		if self.is_timeout() || self.is_connect() || self.is_request() {
			return true;
		}
		match self.status() {
			Some(status) => status_is_retryable(status.as_u16()),
			// Body decode and similar errors after the server answered.
			None => false,
		}
	}
}

/// Returns true for HTTP statuses that indicate a transient server condition.
pub fn status_is_retryable(status: u16) -> bool {
	matches!(status, 408 | 429) || (500..=599).contains(&status)
}

/// Backoff configuration for retrying failed deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
	/// Delay applied after the first failure.
	pub base_delay: Duration,
	/// Upper bound for any computed delay.
	pub max_delay: Duration,
	/// Multiplier applied per additional consecutive failure.
	pub backoff_factor: f64,
	/// Randomize delays downward (between half and the full delay).
	pub jitter: bool,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_secs(DEFAULT_BASE_DELAY_SECS),
			max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
			backoff_factor: DEFAULT_BACKOFF_FACTOR,
			jitter: true,
		}
	}
}

impl RetryConfig {
	/// A fixed delay with no growth and no jitter.
	pub fn fixed(delay: Duration) -> Self {
		Self {
			base_delay: delay,
			max_delay: delay,
			backoff_factor: 1.0,
			jitter: false,
		}
	}

	/// Returns the delay to wait after `consecutive_failures` failures in a row.
	///
	/// Zero failures means no delay. The result never exceeds `max_delay`.
	pub fn delay_for_attempt(&self, consecutive_failures: u32) -> Duration {
		if consecutive_failures == 0 {
			return Duration::ZERO;
		}

		let exponent = consecutive_failures.saturating_sub(1).min(32) as i32;
		let factor = self.backoff_factor.max(1.0).powi(exponent);
		let max_secs = self.max_delay.as_secs_f64();
		let secs = (self.base_delay.as_secs_f64() * factor).min(max_secs);

		let secs = if self.jitter {
			secs * (0.5 + fastrand::f64() * 0.5)
		} else {
			secs
		};

		tracing::trace!(consecutive_failures, delay_secs = secs, "computed backoff");
		// Near `Duration::MAX` the f64 round trip can land just out of range.
		Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(self.max_delay)
	}
}
