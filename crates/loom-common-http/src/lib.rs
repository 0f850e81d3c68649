// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP utilities for Loom.
//!
//! This crate provides:
//! - A pre-configured HTTP client builder with a consistent User-Agent header
//! - Failure classification and exponential backoff for transient failures

mod client;
mod retry;

pub use client::{builder, builder_with_user_agent, user_agent};
pub use retry::{status_is_retryable, RetryConfig, RetryableError};
