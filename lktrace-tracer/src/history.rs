// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lock-free map from thread id to that thread's event history.
//!
//! The map is a fixed-capacity open-addressed table. A slot is claimed with
//! a single compare-and-swap on its `tid` word, so inserting never blocks
//! other inserts. After the claim, the slot's vector belongs to exactly one
//! thread for the life of the process; appends touch nothing shared and
//! never synchronize with other threads' appends. Nothing is ever removed.
//!
//! Appends can allocate (vector growth). That is safe only because the
//! interceptor raises its per-thread reentrancy guard around every append,
//! so an allocator that itself takes a shadowed lock cannot recurse into
//! the map.

use lktrace_common::EventRecord;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Upper bound on distinct thread ids per traced process. Insertions past
/// this are dropped silently; losing a thread beats deadlocking one.
pub const MAX_THREADS: usize = 128;

const EMPTY: usize = 0;

pub struct HistorySlot {
    tid: AtomicUsize,
    hist: UnsafeCell<Vec<EventRecord>>,
}

impl HistorySlot {
    pub fn tid(&self) -> usize {
        self.tid.load(Ordering::Acquire)
    }

    /// Appends one record to this slot's history.
    ///
    /// # Safety
    /// Only the thread that claimed the slot may call this, and never
    /// concurrently with [`HistoryMap::histories`].
    pub unsafe fn append(&self, record: EventRecord) {
        (*self.hist.get()).push(record);
    }
}

pub struct HistoryMap {
    slots: Box<[HistorySlot]>,
}

// Slots hand out &mut access to their vector only through the unsafe,
// single-owner append path above.
unsafe impl Sync for HistoryMap {}

impl HistoryMap {
    pub fn new() -> HistoryMap {
        let mut slots = Vec::with_capacity(MAX_THREADS);
        for _ in 0..MAX_THREADS {
            slots.push(HistorySlot {
                tid: AtomicUsize::new(EMPTY),
                hist: UnsafeCell::new(Vec::new()),
            });
        }
        HistoryMap {
            slots: slots.into_boxed_slice(),
        }
    }

    fn probe_start(tid: usize) -> usize {
        // Fibonacci hashing; pthread ids are pointer-aligned so the low
        // bits alone are a poor bucket index.
        tid.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (usize::BITS as usize - MAX_THREADS.trailing_zeros() as usize)
    }

    /// Returns the slot for `tid`, claiming a fresh one on first use.
    /// Returns `None` once the table is full (the event is then dropped).
    pub fn insert(&self, tid: usize) -> Option<&HistorySlot> {
        debug_assert_ne!(tid, EMPTY);
        let start = Self::probe_start(tid) & (MAX_THREADS - 1);
        for i in 0..MAX_THREADS {
            let slot = &self.slots[(start + i) & (MAX_THREADS - 1)];
            match slot
                .tid
                .compare_exchange(EMPTY, tid, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(slot),
                Err(owner) if owner == tid => return Some(slot),
                Err(_) => continue,
            }
        }
        None
    }

    /// Finds the slot previously claimed for `tid`.
    pub fn get(&self, tid: usize) -> Option<&HistorySlot> {
        let start = Self::probe_start(tid) & (MAX_THREADS - 1);
        for i in 0..MAX_THREADS {
            let slot = &self.slots[(start + i) & (MAX_THREADS - 1)];
            match slot.tid.load(Ordering::Acquire) {
                EMPTY => return None,
                owner if owner == tid => return Some(slot),
                _ => continue,
            }
        }
        None
    }

    /// Iterates all claimed histories.
    ///
    /// # Safety
    /// Callable only after every writer thread has stopped appending
    /// (library teardown), since it reads the vectors without owning them.
    pub unsafe fn histories(&self) -> impl Iterator<Item = (usize, &[EventRecord])> {
        self.slots.iter().filter_map(|slot| {
            let tid = slot.tid.load(Ordering::Acquire);
            if tid == EMPTY {
                None
            } else {
                Some((tid, (*slot.hist.get()).as_slice()))
            }
        })
    }
}

impl Default for HistoryMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lktrace_common::EventKind;
    use std::sync::Arc;

    fn record(ts: u64) -> EventRecord {
        EventRecord {
            ts_ns: ts,
            kind: EventKind::LockAcq,
            addr: 0x1000,
            caller: 0x2000,
        }
    }

    #[test]
    fn insert_is_idempotent_per_tid() {
        let map = HistoryMap::new();
        let a = map.insert(42).unwrap() as *const _;
        let b = map.insert(42).unwrap() as *const _;
        assert_eq!(a, b);
        assert_eq!(map.get(42).unwrap() as *const _, a);
        assert!(map.get(43).is_none());
    }

    #[test]
    fn fills_up_then_rejects() {
        let map = HistoryMap::new();
        for tid in 1..=MAX_THREADS {
            assert!(map.insert(tid).is_some(), "tid {tid} rejected early");
        }
        assert!(map.insert(MAX_THREADS + 1).is_none());
        // existing claims still resolve
        assert!(map.get(1).is_some());
    }

    #[test]
    fn concurrent_inserts_and_appends_stay_disjoint() {
        const WRITERS: usize = 16;
        const EVENTS: u64 = 500;

        let map = Arc::new(HistoryMap::new());
        let mut handles = Vec::new();
        for w in 1..=WRITERS {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                let slot = map.insert(w * 0x1000).unwrap();
                for i in 0..EVENTS {
                    unsafe { slot.append(record(i)) };
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = 0;
        for (tid, hist) in unsafe { map.histories() } {
            assert_eq!(hist.len(), EVENTS as usize, "tid {tid:#x}");
            // per-thread append order is program order
            for (i, ev) in hist.iter().enumerate() {
                assert_eq!(ev.ts_ns, i as u64);
            }
            seen += 1;
        }
        assert_eq!(seen, WRITERS);
    }
}
