// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom analytics tracker.
//!
//! This crate has no I/O. It defines:
//! - [`EventRecord`]: the immutable unit the dispatch engine queues and delivers
//! - [`TrackedEvent`]: what application code reports (screen views, events, ...)
//! - [`RecordBuilder`]: turns a [`TrackedEvent`] plus visit context into collector
//!   parameters, with [`PiwikRecordBuilder`] as the default implementation
//! - [`VisitorState`] and [`SampleRate`] used by the builder stage

pub mod builder;
pub mod error;
pub mod event;
pub mod record;
pub mod visitor;

pub use builder::{BuilderSettings, PiwikRecordBuilder, RecordBuilder, SampleRate, VisitContext};
pub use error::{BuilderError, Result};
pub use event::TrackedEvent;
pub use record::{EventParams, EventRecord, ParamValue, SequenceId};
pub use visitor::VisitorState;
