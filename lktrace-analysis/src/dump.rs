// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Human-readable renderings of the parsed views.
//!
//! The pattern rendering indents with one bar per held lock and switches
//! the bars to dots while the holder sits inside a
//! `COND_WAIT..COND_LEAVE` bracket. Threads and patterns are emitted in
//! sorted order so two dumps of the same trace are identical.

use crate::analysis::{CrossThreadPatterns, ThreadPatterns};
use crate::parse::Trace;
use lktrace_common::EventKind;
use std::collections::HashMap;
use std::io::{self, Write};

fn sorted_tids(trace: &Trace) -> Vec<u64> {
    let mut tids: Vec<u64> = trace.threads.keys().copied().collect();
    tids.sort_unstable();
    tids
}

/// `--threads`: every thread's event stream with resolved call sites.
pub fn dump_threads(trace: &Trace, out: &mut impl Write) -> io::Result<()> {
    for tid in sorted_tids(trace) {
        writeln!(out, "=====")?;
        writeln!(out, "Thread 0x{tid:x} (hook={}):", trace.thread_hooks[&tid])?;
        for event in &trace.threads[&tid] {
            writeln!(
                out,
                "{} 0x{:x} in {} [0x{:x}]",
                event.kind.describe(),
                event.addr,
                trace.caller_name(event.caller),
                event.caller
            )?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// `--global`: the merged timeline, one tab-separated line per event.
pub fn dump_global(trace: &Trace, out: &mut impl Write) -> io::Result<()> {
    for &r in &trace.global_hist {
        let event = trace.event(r);
        writeln!(
            out,
            "0x{:x}\t{}\t0x{:x}\t{}\t{}",
            r.tid,
            event.kind.code(),
            event.addr,
            trace.caller_name(event.caller),
            event.ts_ns
        )?;
    }
    Ok(())
}

/// `--patterns-text`: per-thread signature lists with occurrence counts.
/// Signatures shorter than `min_depth` lock pairs are suppressed.
pub fn dump_patterns_txt(
    trace: &Trace,
    patterns: &HashMap<u64, ThreadPatterns>,
    min_depth: usize,
    out: &mut impl Write,
) -> io::Result<()> {
    for tid in sorted_tids(trace) {
        writeln!(out, "=====")?;
        writeln!(out, "Thread 0x{tid:x} (hook={}):", trace.thread_hooks[&tid])?;

        let Some(thread_patterns) = patterns.get(&tid) else {
            writeln!(out)?;
            continue;
        };
        let mut signatures: Vec<(&Vec<EventKind>, &Vec<u64>, u64)> = thread_patterns
            .iter()
            .flat_map(|(kinds, variants)| {
                variants
                    .iter()
                    .map(move |(callers, count)| (kinds, callers, *count))
            })
            .collect();
        signatures.sort();

        for (kinds, callers, count) in signatures {
            if kinds.len() / 2 < min_depth {
                continue;
            }
            for (kind, caller) in kinds.iter().zip(callers) {
                let object = trace.caller_xref.get(caller).copied().unwrap_or(0);
                writeln!(
                    out,
                    "{} [0x{object:x}] @{}",
                    kind.describe(),
                    trace.caller_name(*caller)
                )?;
            }
            writeln!(out, " occurs {count} time(s).")?;
            writeln!(out)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn bars(out: &mut impl Write, depth: u32, waiting: bool) -> io::Result<()> {
    for _ in 0..depth {
        write!(out, "{}", if waiting { '.' } else { '|' })?;
    }
    Ok(())
}

/// `--patterns`: the cross-thread rendering with statistics.
pub fn dump_patterns(
    trace: &Trace,
    cross: &CrossThreadPatterns,
    out: &mut impl Write,
) -> io::Result<()> {
    let mut keys: Vec<_> = cross.patterns.keys().collect();
    keys.sort();

    for key in keys {
        let data = &cross.patterns[key];
        let mut depth: u32 = 0;
        let mut waiting = false;

        for (kind, &id) in key.kinds.iter().zip(&key.callers) {
            let caller = cross.callers.pc(id);
            let object = trace.caller_xref.get(&caller).copied().unwrap_or(0);
            let site = trace.caller_name(caller);

            let label = match kind {
                EventKind::LockAcq => {
                    depth += 1;
                    "Lock"
                }
                EventKind::LockRel => {
                    depth = depth.saturating_sub(1);
                    "Unlock"
                }
                EventKind::CondWait => {
                    waiting = true;
                    "Cond Wait"
                }
                EventKind::CondLeave => {
                    waiting = false;
                    "Cond Wake"
                }
                EventKind::CondSignal => "Cond Sig",
                EventKind::CondBrdcst => "Cond Brd",
                // signatures only ever hold the kinds above
                _ => "??",
            };

            bars(out, depth, waiting)?;
            if depth == 0 {
                write!(out, "|")?;
            }
            writeln!(out, "{label} 0x{object:x}: {site} [0x{caller:x}]")?;
            bars(out, depth, waiting)?;
            if depth > 0 {
                writeln!(out)?;
            }
        }

        for (tid, count) in &data.instances {
            writeln!(
                out,
                "{count} occurrences in thread 0x{tid:x} [{}]",
                trace
                    .thread_hooks
                    .get(tid)
                    .map_or("??", String::as_str)
            )?;
        }
        let threads = data.instances.len().max(1) as f64;
        writeln!(
            out,
            "Mean time in pattern: {} ticks",
            data.total_time as f64 / threads
        )?;
        if data.wait_time > 0 {
            writeln!(
                out,
                "Mean wait in pattern: {} ticks",
                data.wait_time as f64 / threads
            )?;
        }
        writeln!(out)?;
    }
    Ok(())
}
