// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Critical-section pattern extraction.
//!
//! A pattern is the signature of one completed critical section: the
//! sequence of event kinds plus the sequence of call sites observed from
//! an outermost lock acquisition until the thread's lock depth returns to
//! zero. The per-thread pass walks each history in isolation; the
//! cross-thread pass walks the global merge, following one holder thread
//! at a time and bookmarking where an interleaved section started so it is
//! picked up afterwards.

use crate::parse::Trace;
use lktrace_common::EventKind;
use std::collections::HashMap;

/// Dense 16-bit identifiers for caller PCs. Signatures store ids, not
/// addresses; dumps resolve them back.
#[derive(Default)]
pub struct CallerIds {
    ids: HashMap<u64, u16>,
    pcs: Vec<u64>,
}

impl CallerIds {
    pub fn id(&mut self, pc: u64) -> u16 {
        if let Some(&id) = self.ids.get(&pc) {
            return id;
        }
        // 16 bits of distinct call sites; saturate rather than wrap if a
        // pathological trace exceeds that
        let id = self.pcs.len().min(u16::MAX as usize) as u16;
        if (id as usize) == self.pcs.len() {
            self.pcs.push(pc);
        }
        self.ids.insert(pc, id);
        id
    }

    pub fn pc(&self, id: u16) -> u64 {
        self.pcs.get(id as usize).copied().unwrap_or(0)
    }
}

/// Per-thread signature table: kind sequence -> distinct caller sequences
/// with occurrence counts.
pub type ThreadPatterns = HashMap<Vec<EventKind>, Vec<(Vec<u64>, u64)>>;

/// Walks each thread history and collects completed critical-section
/// signatures, coalescing identical ones.
pub fn find_patterns(trace: &Trace) -> HashMap<u64, ThreadPatterns> {
    let mut result = HashMap::new();
    for (&tid, hist) in &trace.threads {
        let mut patterns: ThreadPatterns = HashMap::new();
        let mut kinds: Vec<EventKind> = Vec::new();
        let mut callers: Vec<u64> = Vec::new();
        let mut depth: i32 = 0;

        for event in hist {
            match event.kind {
                EventKind::LockAcq => {
                    depth += 1;
                    kinds.push(event.kind);
                    callers.push(event.caller);
                }
                EventKind::LockRel => {
                    depth -= 1;
                    kinds.push(event.kind);
                    callers.push(event.caller);
                    if depth == 0 {
                        // quiescent point: commit the accumulated signature
                        let variants = patterns.entry(std::mem::take(&mut kinds)).or_default();
                        let sites = std::mem::take(&mut callers);
                        match variants.iter_mut().find(|(known, _)| *known == sites) {
                            Some((_, count)) => *count += 1,
                            None => variants.push((sites, 1)),
                        }
                    }
                }
                _ => {}
            }
        }
        result.insert(tid, patterns);
    }
    result
}

/// Signature key for cross-thread patterns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternKey {
    pub kinds: Vec<EventKind>,
    pub callers: Vec<u16>,
}

#[derive(Debug, Default, Clone)]
pub struct PatternData {
    /// `(tid, occurrence count)` for every thread the pattern ran on.
    pub instances: Vec<(u64, u64)>,
    /// Wall time spent inside the pattern, summed over occurrences.
    pub total_time: u64,
    /// Time spent blocked in `COND_WAIT..COND_LEAVE` brackets inside the
    /// pattern, summed over occurrences.
    pub wait_time: u64,
}

impl PatternData {
    fn instance(&mut self, tid: u64) {
        match self.instances.iter_mut().find(|(known, _)| *known == tid) {
            Some((_, count)) => *count += 1,
            None => self.instances.push((tid, 1)),
        }
    }
}

pub struct CrossThreadPatterns {
    pub patterns: HashMap<PatternKey, PatternData>,
    pub callers: CallerIds,
}

/// Walks the global history, following one holder thread at a time.
///
/// Synthetic lock events around a holder's `COND_WAIT` are folded away so
/// the signature reflects what the program wrote, not the instrumentation:
/// the release immediately after the wait and the reacquire right after
/// the wakeup are consumed under the `skip_wait_unlock` flag.
///
/// Patterns whose nesting pair count (`kinds.len() / 2`) is below
/// `min_depth` are discarded at commit time.
pub fn find_deps(trace: &Trace, min_depth: usize) -> CrossThreadPatterns {
    let mut patterns: HashMap<PatternKey, PatternData> = HashMap::new();
    let mut caller_ids = CallerIds::default();

    let mut holder: Option<u64> = None;
    let mut depth: u32 = 0;
    let mut skip_wait_unlock = false;
    let mut init_time: u64 = 0;
    let mut wait_start: u64 = 0;
    let mut wait_acc: u64 = 0;
    let mut kinds: Vec<EventKind> = Vec::new();
    let mut callers: Vec<u16> = Vec::new();
    // where the next interleaved pattern starts, if one showed up while
    // this one was being walked
    let mut next: Option<usize> = None;
    // timestamp of each thread's last completed outermost release; gates
    // the bookmark so inner sections are not recorded twice
    let mut next_release: HashMap<u64, u64> = HashMap::new();

    let mut at = 0;
    while at < trace.global_hist.len() {
        let r = trace.global_hist[at];
        let event = trace.event(r);
        let mut rewound = false;

        match event.kind {
            EventKind::LockAcq => {
                if holder.is_none() {
                    debug_assert!(!skip_wait_unlock);
                    holder = Some(r.tid);
                    init_time = event.ts_ns;
                    depth = 1;
                    kinds.push(event.kind);
                    callers.push(caller_ids.id(event.caller));
                } else if holder == Some(r.tid) {
                    if !skip_wait_unlock {
                        depth += 1;
                        kinds.push(event.kind);
                        callers.push(caller_ids.id(event.caller));
                    } else {
                        // the synthetic reacquire after the wait
                        debug_assert_eq!(kinds.last(), Some(&EventKind::CondLeave));
                        skip_wait_unlock = false;
                    }
                } else if next.is_none() {
                    // an interleaved section is starting; come back to it
                    // once the current pattern has been committed
                    let past_release = next_release
                        .get(&r.tid)
                        .is_none_or(|&rel| event.ts_ns > rel);
                    if past_release {
                        next = Some(at);
                    }
                }
            }
            EventKind::LockRel => {
                if holder == Some(r.tid) {
                    if !skip_wait_unlock {
                        kinds.push(event.kind);
                        callers.push(caller_ids.id(event.caller));
                        if depth == 1 {
                            debug_assert_eq!(kinds.len(), callers.len());
                            if kinds.len() / 2 >= min_depth {
                                let data = patterns
                                    .entry(PatternKey {
                                        kinds: kinds.clone(),
                                        callers: callers.clone(),
                                    })
                                    .or_default();
                                data.instance(r.tid);
                                data.total_time += event.ts_ns - init_time;
                                data.wait_time += wait_acc;
                            }
                            next_release.insert(r.tid, event.ts_ns);

                            holder = None;
                            init_time = 0;
                            wait_acc = 0;
                            kinds.clear();
                            callers.clear();

                            if let Some(bookmark) = next.take() {
                                at = bookmark;
                                rewound = true;
                            }
                        }
                        depth -= 1;
                    } else {
                        // the synthetic release after the wait; consumed,
                        // guard stays up until the matching reacquire
                        debug_assert_eq!(kinds.last(), Some(&EventKind::CondWait));
                    }
                }
            }
            EventKind::CondWait => {
                if holder == Some(r.tid) {
                    skip_wait_unlock = true;
                    wait_start = event.ts_ns;
                    kinds.push(event.kind);
                    callers.push(caller_ids.id(event.caller));
                }
            }
            EventKind::CondLeave => {
                if holder == Some(r.tid) {
                    wait_acc += event.ts_ns.saturating_sub(wait_start);
                    kinds.push(event.kind);
                    callers.push(caller_ids.id(event.caller));
                }
            }
            EventKind::CondSignal | EventKind::CondBrdcst => {
                if holder == Some(r.tid) {
                    kinds.push(event.kind);
                    callers.push(caller_ids.id(event.caller));
                }
            }
            _ => {}
        }

        if !rewound {
            at += 1;
        }
    }

    CrossThreadPatterns {
        patterns,
        callers: caller_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(text: &str) -> Trace {
        Trace::parse(text).unwrap()
    }

    // One thread, nested locks: lock A; lock B; unlock B; unlock A.
    const NESTED: &str = "\
[t:0xa:0x0]
0:TS:0x0:0x0
1:LA:0x100:0x10
2:LA:0x200:0x11
3:LR:0x200:0x12
4:LR:0x100:0x13
5:TE:0xa:0x14

[n:]
0x0:<program entry point>
0x10:a
0x11:b
0x12:c
0x13:d
0x14:e

";

    #[test]
    fn nested_locks_form_one_signature() {
        let t = trace(NESTED);
        let per_thread = find_patterns(&t);
        let patterns = &per_thread[&0xa];
        assert_eq!(patterns.len(), 1);
        let kinds = vec![
            EventKind::LockAcq,
            EventKind::LockAcq,
            EventKind::LockRel,
            EventKind::LockRel,
        ];
        let variants = &patterns[&kinds];
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].0, vec![0x10, 0x11, 0x12, 0x13]);
        assert_eq!(variants[0].1, 1);
    }

    #[test]
    fn min_depth_two_still_surfaces_nested_pair() {
        let t = trace(NESTED);
        let cross = find_deps(&t, 2);
        assert_eq!(cross.patterns.len(), 1);
        let key = cross.patterns.keys().next().unwrap();
        assert_eq!(key.kinds.len(), 4);
        // min_depth of three filters it out
        let cross = find_deps(&t, 3);
        assert!(cross.patterns.is_empty());
    }

    #[test]
    fn repeated_sections_coalesce_with_counts() {
        let text = "\
[t:0xa:0x0]
0:TS:0x0:0x0
1:LA:0x100:0x10
2:LR:0x100:0x11
3:LA:0x100:0x10
4:LR:0x100:0x11
5:LA:0x100:0x20
6:LR:0x100:0x21

[n:]
0x0:<program entry point>
0x10:a
0x11:b
0x20:c
0x21:d

";
        let t = trace(text);
        let per_thread = find_patterns(&t);
        let kinds = vec![EventKind::LockAcq, EventKind::LockRel];
        let variants = &per_thread[&0xa][&kinds];
        // same kind sequence, two distinct caller sequences
        assert_eq!(variants.len(), 2);
        let repeated = variants
            .iter()
            .find(|(sites, _)| sites == &vec![0x10, 0x11])
            .unwrap();
        assert_eq!(repeated.1, 2);
    }

    // S4: lock M, cond_wait(C, M) with its synthetic bracket, unlock M.
    const COND_BRACKET: &str = "\
[t:0xa:0x0]
0:TS:0x0:0x0
1:LQ:0x100:0x10
2:LA:0x100:0x10
3:CW:0x300:0x11
4:LR:0x100:0x11
8:CL:0x300:0x11
9:LA:0x100:0x11
10:LR:0x100:0x12
11:TE:0xa:0x13

[n:]
0x0:<program entry point>
0x10:a
0x11:b
0x12:c
0x13:d

";

    #[test]
    fn cond_wait_bracket_folds_into_one_pattern() {
        let t = trace(COND_BRACKET);
        let cross = find_deps(&t, 0);
        assert_eq!(cross.patterns.len(), 1);
        let (key, data) = cross.patterns.iter().next().unwrap();
        assert_eq!(
            key.kinds,
            vec![
                EventKind::LockAcq,
                EventKind::CondWait,
                EventKind::CondLeave,
                EventKind::LockRel,
            ]
        );
        assert_eq!(data.instances, vec![(0xa, 1)]);
        // total spans ts 2..10, wait spans ts 3..8
        assert_eq!(data.total_time, 8);
        assert_eq!(data.wait_time, 5);
    }

    // S5: thread A holds X then Y; thread B takes Z in between.
    const INTERLEAVED: &str = "\
[t:0xa:0x0]
0:TS:0x0:0x0
1:LA:0x100:0x10
2:LA:0x200:0x11
5:LR:0x200:0x12
6:LR:0x100:0x13

[t:0xb:0x900]
0:TS:0x900:0x20
3:LA:0x300:0x21
4:LR:0x300:0x22

[n:]
0x0:<program entry point>
0x900:worker
0x10:a
0x11:b
0x12:c
0x13:d
0x20:e
0x21:f
0x22:g

";

    #[test]
    fn interleaved_pattern_is_recovered_via_bookmark() {
        let t = trace(INTERLEAVED);
        let cross = find_deps(&t, 0);
        assert_eq!(cross.patterns.len(), 2);

        let a_key = PatternKey {
            kinds: vec![
                EventKind::LockAcq,
                EventKind::LockAcq,
                EventKind::LockRel,
                EventKind::LockRel,
            ],
            callers: cross
                .patterns
                .keys()
                .find(|k| k.kinds.len() == 4)
                .unwrap()
                .callers
                .clone(),
        };
        assert_eq!(cross.patterns[&a_key].instances, vec![(0xa, 1)]);

        let b_key = cross.patterns.keys().find(|k| k.kinds.len() == 2).unwrap();
        assert_eq!(cross.patterns[b_key].instances, vec![(0xb, 1)]);
        // B's callers resolve back to its own call sites
        let pcs: Vec<u64> = b_key.callers.iter().map(|&id| cross.callers.pc(id)).collect();
        assert_eq!(pcs, vec![0x21, 0x22]);
    }

    #[test]
    fn signatures_are_deterministic_across_runs() {
        let t1 = trace(INTERLEAVED);
        let t2 = trace(INTERLEAVED);
        let mut keys1: Vec<PatternKey> = find_deps(&t1, 0).patterns.into_keys().collect();
        let mut keys2: Vec<PatternKey> = find_deps(&t2, 0).patterns.into_keys().collect();
        keys1.sort();
        keys2.sort();
        assert_eq!(keys1, keys2);
    }

    #[test]
    fn caller_ids_are_dense_and_stable() {
        let mut ids = CallerIds::default();
        assert_eq!(ids.id(0x1000), 0);
        assert_eq!(ids.id(0x2000), 1);
        assert_eq!(ids.id(0x1000), 0);
        assert_eq!(ids.pc(0), 0x1000);
        assert_eq!(ids.pc(1), 0x2000);
    }
}
