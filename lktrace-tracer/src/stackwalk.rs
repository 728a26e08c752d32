// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Caller attribution.
//!
//! Every shadow walks a handful of frames, discards the ones inside the
//! tracer's own shared object, optionally skips a configured number of
//! user wrapper frames, and classifies what is left. A caller inside the
//! allocator's object means the event must be abandoned: the allocator
//! takes shadowed locks itself, and recording those would recurse.

use backtrace::trace;

/// Frames examined per walk.
pub const TRACE_DEPTH: usize = 8;

/// Load-time extent of one shared object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectBounds {
    pub start: usize,
    pub end: usize,
}

impl ObjectBounds {
    pub fn contains(&self, pc: usize) -> bool {
        self.start < pc && pc < self.end
    }
}

/// Outcome of a caller walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Pc(usize),
    /// The call originated inside the allocator; do not trace it.
    Allocator,
    /// The walk produced no usable frame.
    Unknown,
}

/// Picks the attributed caller out of a captured frame list.
///
/// Split out from the capture so the skip and classification rules are
/// testable against synthetic frames.
pub fn attribute(
    frames: &[usize],
    own: ObjectBounds,
    alloc: ObjectBounds,
    trace_skip: u32,
) -> Caller {
    if frames.is_empty() {
        return Caller::Unknown;
    }
    let mut at = 0;
    while at < frames.len() && own.contains(frames[at]) {
        at += 1;
    }
    at += trace_skip as usize;
    if at >= frames.len() {
        at = frames.len() - 1;
    }
    let pc = frames[at];
    if alloc.contains(pc) {
        Caller::Allocator
    } else {
        Caller::Pc(pc)
    }
}

/// Walks the current stack and attributes the calling PC.
pub fn capture_caller(own: ObjectBounds, alloc: ObjectBounds, trace_skip: u32) -> Caller {
    let mut frames = [0usize; TRACE_DEPTH];
    let mut count = 0;
    trace(|frame| {
        frames[count] = frame.ip() as usize;
        count += 1;
        count < TRACE_DEPTH
    });
    attribute(&frames[..count], own, alloc, trace_skip)
}
