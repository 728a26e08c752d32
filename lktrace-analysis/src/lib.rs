// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Offline analysis of lktrace trace files.
//!
//! [`parse::Trace`] loads a trace and exposes three views of it: the
//! per-thread histories (authoritative storage), per-object histories and
//! a globally time-ordered stream. [`analysis`] extracts recurring
//! critical-section patterns from those views, and [`dump`] renders
//! everything for the `lkdump` tool.

pub mod analysis;
pub mod dump;
pub mod parse;

pub use parse::{EventRef, ParseError, Trace};
