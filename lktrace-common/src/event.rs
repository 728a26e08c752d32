// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synchronization event model shared by the tracer and the analysis tools.
//!
//! Event kinds keep their historical 16-bit values: the top nibble encodes
//! the family (lock / condvar / thread) so downstream code can classify an
//! event with a single mask, and the values count down from the top of each
//! family's range.

/// Family mask over the raw 16-bit kind value.
const FAMILY_MASK: u16 = 0xF000;
const LOCK_FAMILY: u16 = 0xF000;
const COND_FAMILY: u16 = 0xE000;
const THRD_FAMILY: u16 = 0xD000;

/// One kind per shadowed operation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum EventKind {
    LockReq = 0xFFFF,
    LockAcq = 0xFFFE,
    LockRel = 0xFFFD,
    LockErr = 0xFFFC,
    CondWait = 0xEFFF,
    CondLeave = 0xEFFE,
    CondSignal = 0xEFFD,
    CondBrdcst = 0xEFFC,
    CondErr = 0xEFFB,
    ThrdSpawn = 0xDFF6,
    ThrdExit = 0xDFF5,
}

/// Coarse grouping used when analysis only cares about the primitive class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFamily {
    Lock,
    Cond,
    Thread,
}

impl EventKind {
    pub fn family(self) -> EventFamily {
        match (self as u16) & FAMILY_MASK {
            LOCK_FAMILY => EventFamily::Lock,
            COND_FAMILY => EventFamily::Cond,
            THRD_FAMILY => EventFamily::Thread,
            // The enum is closed; every variant carries one of the three
            // family nibbles.
            _ => unreachable!("event kind outside known families"),
        }
    }

    /// Two-letter code used in the trace file.
    pub fn code(self) -> &'static str {
        match self {
            EventKind::LockReq => "LQ",
            EventKind::LockAcq => "LA",
            EventKind::LockRel => "LR",
            EventKind::LockErr => "LE",
            EventKind::CondWait => "CW",
            EventKind::CondLeave => "CL",
            EventKind::CondSignal => "CS",
            EventKind::CondBrdcst => "CB",
            EventKind::CondErr => "CE",
            EventKind::ThrdSpawn => "TS",
            EventKind::ThrdExit => "TE",
        }
    }

    /// Inverse of [`EventKind::code`].
    pub fn from_code(code: &str) -> Option<EventKind> {
        Some(match code {
            "LQ" => EventKind::LockReq,
            "LA" => EventKind::LockAcq,
            "LR" => EventKind::LockRel,
            "LE" => EventKind::LockErr,
            "CW" => EventKind::CondWait,
            "CL" => EventKind::CondLeave,
            "CS" => EventKind::CondSignal,
            "CB" => EventKind::CondBrdcst,
            "CE" => EventKind::CondErr,
            "TS" => EventKind::ThrdSpawn,
            "TE" => EventKind::ThrdExit,
            _ => return None,
        })
    }

    /// Human-readable description used by the dump renderers.
    pub fn describe(self) -> &'static str {
        match self {
            EventKind::LockReq => "Blocked on lock",
            EventKind::LockAcq => "Acquired lock",
            EventKind::LockRel => "Released lock",
            EventKind::LockErr => "Error acquiring lock",
            EventKind::CondWait => "Blocked on condvar",
            EventKind::CondLeave => "Woke from condvar",
            EventKind::CondSignal => "Signaled condvar",
            EventKind::CondBrdcst => "Broadcasted condvar",
            EventKind::CondErr => "Error waiting on condvar",
            EventKind::ThrdSpawn => "Spawned thread",
            EventKind::ThrdExit => "Exited thread",
        }
    }
}

/// One recorded synchronization event.
///
/// `ts_ns` is steady-clock nanoseconds since tracer init. `addr` identifies
/// the synchronization object: the mutex for lock events, the condvar for
/// condvar events, the thread id for `ThrdExit` and the thread entry point
/// for `ThrdSpawn`. `caller` is the attributed call-site PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub ts_ns: u64,
    pub kind: EventKind,
    pub addr: u64,
    pub caller: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [EventKind; 11] = [
        EventKind::LockReq,
        EventKind::LockAcq,
        EventKind::LockRel,
        EventKind::LockErr,
        EventKind::CondWait,
        EventKind::CondLeave,
        EventKind::CondSignal,
        EventKind::CondBrdcst,
        EventKind::CondErr,
        EventKind::ThrdSpawn,
        EventKind::ThrdExit,
    ];

    #[test]
    fn codes_round_trip() {
        for kind in ALL {
            assert_eq!(EventKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(EventKind::from_code("XX"), None);
        assert_eq!(EventKind::from_code(""), None);
    }

    #[test]
    fn families_follow_high_nibble() {
        assert_eq!(EventKind::LockReq.family(), EventFamily::Lock);
        assert_eq!(EventKind::LockErr.family(), EventFamily::Lock);
        assert_eq!(EventKind::CondWait.family(), EventFamily::Cond);
        assert_eq!(EventKind::CondErr.family(), EventFamily::Cond);
        assert_eq!(EventKind::ThrdSpawn.family(), EventFamily::Thread);
        assert_eq!(EventKind::ThrdExit.family(), EventFamily::Thread);
    }

    #[test]
    fn descriptions_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for kind in ALL {
            assert!(seen.insert(kind.describe()));
        }
    }
}
