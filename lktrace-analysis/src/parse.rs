// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Strict trace-file parsing and view construction.
//!
//! Parsing is line-oriented and unforgiving: a blank line terminates the
//! current block, anything that is not the expected token fails with the
//! token that was actually observed. After the blocks are read, the parser
//! builds the per-object histories and the global merge so every consumer
//! works off the same three views.

use lktrace_common::wire::{self, WireError};
use lktrace_common::{EventFamily, EventRecord};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("reading trace: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Wire { line: usize, source: WireError },
    #[error("line {line}: expected {expected}, found {found:?}")]
    Structure {
        line: usize,
        expected: &'static str,
        found: String,
    },
    #[error("duplicate thread block for 0x{tid:x}")]
    DuplicateThread { tid: u64 },
    #[error("thread 0x{tid:x} has an empty event block")]
    EmptyThread { tid: u64 },
    #[error("thread 0x{tid:x} entry hook 0x{hook:x} missing from the name table")]
    MissingHookName { tid: u64, hook: u64 },
}

/// Reference into a thread history. The global and per-object views are
/// sequences of these rather than copies; consumers usually need the tid
/// alongside the record anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRef {
    pub tid: u64,
    pub index: usize,
}

#[derive(Debug)]
pub struct Trace {
    /// Per-thread histories, the authoritative event storage.
    pub threads: HashMap<u64, Vec<EventRecord>>,
    /// Human label for each thread: the resolved name of its entry hook.
    pub thread_hooks: HashMap<u64, String>,
    /// Caller PC -> descriptor, from the trailing name table.
    pub caller_names: HashMap<u64, String>,
    /// Caller PC -> the synchronization object it last operated on.
    pub caller_xref: HashMap<u64, u64>,
    /// Per-object histories for lock and condvar events.
    pub objects: HashMap<u64, Vec<EventRef>>,
    /// All events ordered by `(timestamp, tid)`.
    pub global_hist: Vec<EventRef>,
}

impl Trace {
    pub fn load(path: &Path) -> Result<Trace, ParseError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Trace, ParseError> {
        let mut threads: HashMap<u64, Vec<EventRecord>> = HashMap::new();
        let mut caller_names: HashMap<u64, String> = HashMap::new();
        let mut caller_xref: HashMap<u64, u64> = HashMap::new();
        let mut hooks: HashMap<u64, u64> = HashMap::new();

        let mut lines = text.lines().enumerate();
        while let Some((at, line)) = lines.next() {
            if line.starts_with(wire::NAME_TABLE_HEADER) {
                parse_name_block(&mut lines, &mut caller_names)?;
            } else if line.starts_with('[') {
                let (tid, hook) = wire::parse_thread_header(line)
                    .map_err(|source| ParseError::Wire { line: at + 1, source })?;
                if threads.contains_key(&tid) {
                    return Err(ParseError::DuplicateThread { tid });
                }
                let hist = parse_event_block(&mut lines, &mut caller_xref)?;
                if hist.is_empty() {
                    return Err(ParseError::EmptyThread { tid });
                }
                hooks.insert(tid, hook);
                threads.insert(tid, hist);
            } else if line.is_empty() {
                // stray blank between blocks is a format violation
                return Err(ParseError::Structure {
                    line: at + 1,
                    expected: "block header",
                    found: String::new(),
                });
            } else {
                return Err(ParseError::Structure {
                    line: at + 1,
                    expected: "block header",
                    found: line.to_owned(),
                });
            }
        }

        // cross-reference thread hooks against the name table
        let mut thread_hooks = HashMap::new();
        for (&tid, &hook) in &hooks {
            let name = caller_names
                .get(&hook)
                .ok_or(ParseError::MissingHookName { tid, hook })?;
            thread_hooks.insert(tid, name.clone());
        }

        let global_hist = merge_global(&threads);
        let objects = build_object_views(&threads, &global_hist);

        Ok(Trace {
            threads,
            thread_hooks,
            caller_names,
            caller_xref,
            objects,
            global_hist,
        })
    }

    pub fn event(&self, r: EventRef) -> &EventRecord {
        &self.threads[&r.tid][r.index]
    }

    /// Descriptor for a caller PC, `??` when the table has no entry.
    pub fn caller_name(&self, pc: u64) -> &str {
        self.caller_names.get(&pc).map_or("??", String::as_str)
    }
}

fn parse_name_block<'a>(
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
    names: &mut HashMap<u64, String>,
) -> Result<(), ParseError> {
    for (at, line) in lines {
        if line.is_empty() {
            return Ok(());
        }
        let (pc, name) =
            wire::parse_name_line(line).map_err(|source| ParseError::Wire { line: at + 1, source })?;
        names.insert(pc, name);
    }
    Err(ParseError::Structure {
        line: 0,
        expected: "blank line terminating the name table",
        found: "end of file".to_owned(),
    })
}

fn parse_event_block<'a>(
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
    caller_xref: &mut HashMap<u64, u64>,
) -> Result<Vec<EventRecord>, ParseError> {
    let mut hist = Vec::new();
    for (at, line) in lines {
        if line.is_empty() {
            return Ok(hist);
        }
        let event =
            wire::parse_event_line(line).map_err(|source| ParseError::Wire { line: at + 1, source })?;
        caller_xref.entry(event.caller).or_insert(event.addr);
        hist.push(event);
    }
    Err(ParseError::Structure {
        line: 0,
        expected: "blank line terminating the thread block",
        found: "end of file".to_owned(),
    })
}

/// Stable k-way merge of the per-thread histories, ordered by timestamp
/// with ties broken by thread id.
fn merge_global(threads: &HashMap<u64, Vec<EventRecord>>) -> Vec<EventRef> {
    let mut heap: BinaryHeap<Reverse<(u64, u64, usize)>> = threads
        .iter()
        .filter(|(_, hist)| !hist.is_empty())
        .map(|(&tid, hist)| Reverse((hist[0].ts_ns, tid, 0)))
        .collect();

    let mut global = Vec::with_capacity(threads.values().map(Vec::len).sum());
    while let Some(Reverse((_ts, tid, index))) = heap.pop() {
        global.push(EventRef { tid, index });
        let hist = &threads[&tid];
        if index + 1 < hist.len() {
            heap.push(Reverse((hist[index + 1].ts_ns, tid, index + 1)));
        }
    }
    global
}

/// Groups lock and condvar events by their object identifier, in global
/// order. Thread lifecycle events carry no synchronization object.
fn build_object_views(
    threads: &HashMap<u64, Vec<EventRecord>>,
    global: &[EventRef],
) -> HashMap<u64, Vec<EventRef>> {
    let mut objects: HashMap<u64, Vec<EventRef>> = HashMap::new();
    for &r in global {
        let event = &threads[&r.tid][r.index];
        match event.kind.family() {
            EventFamily::Lock | EventFamily::Cond => {
                objects.entry(event.addr).or_default().push(r);
            }
            EventFamily::Thread => {}
        }
    }
    objects
}

#[cfg(test)]
mod tests {
    use super::*;
    use lktrace_common::EventKind;

    const SIMPLE: &str = "\
[t:0xa:0x0]
0:TS:0x0:0x0
5:LQ:0x100:0x40
6:LA:0x100:0x40
9:LR:0x100:0x41
20:TE:0xa:0x42

[t:0xb:0x900]
2:TS:0x900:0x43
8:LQ:0x100:0x44
10:LA:0x100:0x44
11:LR:0x100:0x44
12:TE:0xb:0x45

[n:]
0x0:<program entry point>
0x40:lock_it@main.c:10
0x41:unlock_it@main.c:20
0x42:exit@main.c:30
0x43:spawn@main.c:5
0x44:worker@w.c:7
0x45:worker_exit@w.c:9
0x900:worker@w.c:1

";

    #[test]
    fn parses_threads_names_and_hooks() {
        let trace = Trace::parse(SIMPLE).unwrap();
        assert_eq!(trace.threads.len(), 2);
        assert_eq!(trace.threads[&0xa].len(), 5);
        assert_eq!(trace.thread_hooks[&0xa], "<program entry point>");
        assert_eq!(trace.thread_hooks[&0xb], "worker@w.c:1");
        assert_eq!(trace.caller_name(0x40), "lock_it@main.c:10");
        assert_eq!(trace.caller_name(0xdead), "??");
        // the caller cross-reference remembers the object operated on
        assert_eq!(trace.caller_xref[&0x44], 0x100);
    }

    #[test]
    fn merge_is_complete_and_ordered() {
        let trace = Trace::parse(SIMPLE).unwrap();
        let total: usize = trace.threads.values().map(Vec::len).sum();
        assert_eq!(trace.global_hist.len(), total);
        for pair in trace.global_hist.windows(2) {
            let (a, b) = (trace.event(pair[0]), trace.event(pair[1]));
            assert!(a.ts_ns <= b.ts_ns, "global history out of order");
        }
    }

    #[test]
    fn merge_breaks_timestamp_ties_by_tid() {
        let text = "\
[t:0xb:0x0]
5:LA:0x1:0x2

[t:0xa:0x0]
5:LA:0x1:0x2

[n:]
0x0:<program entry point>
0x2:f

";
        let trace = Trace::parse(text).unwrap();
        assert_eq!(trace.global_hist[0].tid, 0xa);
        assert_eq!(trace.global_hist[1].tid, 0xb);
    }

    #[test]
    fn object_views_group_sync_events_only() {
        let trace = Trace::parse(SIMPLE).unwrap();
        // both threads touched mutex 0x100: 3 lock events each
        assert_eq!(trace.objects[&0x100].len(), 6);
        // no view for thread lifecycle "objects"
        assert!(!trace.objects.contains_key(&0xa));
        for pair in trace.objects[&0x100].windows(2) {
            assert!(trace.event(pair[0]).ts_ns <= trace.event(pair[1]).ts_ns);
        }
    }

    #[test]
    fn main_prefix_is_interchangeable() {
        let text = SIMPLE.replace("[t:0xa:", "[m:0xa:");
        let trace = Trace::parse(&text).unwrap();
        assert!(trace.threads.contains_key(&0xa));
    }

    #[test]
    fn strict_failures_surface_the_token() {
        // truncated file: thread block never terminated
        let text = "[t:0xa:0x0]\n0:TS:0x0:0x0\n";
        assert!(matches!(
            Trace::parse(text),
            Err(ParseError::Structure { .. })
        ));

        // garbage where a header should be
        let text = "hello\n";
        match Trace::parse(text) {
            Err(ParseError::Structure { found, .. }) => assert_eq!(found, "hello"),
            other => panic!("unexpected {other:?}"),
        }

        // bad event line inside a block
        let text = "[t:0xa:0x0]\n0:XY:0x0:0x0\n\n[n:]\n0x0:x\n\n";
        match Trace::parse(text) {
            Err(ParseError::Wire { line: 2, source }) => {
                assert_eq!(source, WireError::UnknownEventCode("XY".to_owned()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hook_must_resolve_in_name_table() {
        let text = "\
[t:0xa:0x999]
0:TS:0x999:0x0

[n:]
0x0:<program entry point>

";
        assert!(matches!(
            Trace::parse(text),
            Err(ParseError::MissingHookName { tid: 0xa, hook: 0x999 })
        ));
    }

    #[test]
    fn round_trip_equals_original_records() {
        let trace = Trace::parse(SIMPLE).unwrap();
        let first = &trace.threads[&0xa][1];
        assert_eq!(
            *first,
            EventRecord {
                ts_ns: 5,
                kind: EventKind::LockReq,
                addr: 0x100,
                caller: 0x40,
            }
        );
    }
}
