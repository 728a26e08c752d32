// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod control;
pub mod event;
pub mod wire;

pub use event::{EventFamily, EventKind, EventRecord};
