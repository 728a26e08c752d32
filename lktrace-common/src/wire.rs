// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line-level trace file format.
//!
//! A trace is a sequence of thread blocks followed by one name-table block,
//! each terminated by a blank line:
//!
//! ```text
//! [t:0x<tid>:0x<entry_pc>]
//! <ts_ns>:<code>:0x<obj>:0x<caller>
//! ...
//!
//! [n:]
//! 0x<pc>:<descriptor>
//! ...
//!
//! ```
//!
//! The tracer emits this format at teardown and the analysis crate reads
//! it back; both go through the helpers here so the two cannot drift.

use crate::event::{EventKind, EventRecord};
use std::collections::BTreeMap;
use std::io::{self, Write};

/// Header line opening the caller-name table.
pub const NAME_TABLE_HEADER: &str = "[n:]";

/// Label for the null PC: a main thread has no entry hook.
pub const PROGRAM_ENTRY: &str = "<program entry point>";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("expected {expected}, found {found:?}")]
    Unexpected {
        expected: &'static str,
        found: String,
    },
    #[error("unknown event code {0:?}")]
    UnknownEventCode(String),
    #[error("bad {what} {token:?}")]
    BadNumber { what: &'static str, token: String },
}

fn unexpected(expected: &'static str, found: &str) -> WireError {
    WireError::Unexpected {
        expected,
        found: found.to_owned(),
    }
}

fn parse_hex(what: &'static str, token: &str) -> Result<u64, WireError> {
    let digits = token.strip_prefix("0x").unwrap_or(token);
    u64::from_str_radix(digits, 16).map_err(|_| WireError::BadNumber {
        what,
        token: token.to_owned(),
    })
}

fn parse_dec(what: &'static str, token: &str) -> Result<u64, WireError> {
    token.parse::<u64>().map_err(|_| WireError::BadNumber {
        what,
        token: token.to_owned(),
    })
}

pub fn write_thread_header(w: &mut impl Write, tid: u64, entry_pc: u64) -> io::Result<()> {
    writeln!(w, "[t:{tid:#x}:{entry_pc:#x}]")
}

pub fn write_event(w: &mut impl Write, ev: &EventRecord) -> io::Result<()> {
    writeln!(
        w,
        "{}:{}:{:#x}:{:#x}",
        ev.ts_ns,
        ev.kind.code(),
        ev.addr,
        ev.caller
    )
}

pub fn write_name(w: &mut impl Write, pc: u64, descriptor: &str) -> io::Result<()> {
    writeln!(w, "{pc:#x}:{descriptor}")
}

/// Parses `[t:0x<tid>:0x<entry_pc>]`. The historical `m:` designator for
/// the main thread is accepted and treated identically.
pub fn parse_thread_header(line: &str) -> Result<(u64, u64), WireError> {
    let body = line
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| unexpected("[t:<tid>:<entry>] header", line))?;
    let mut fields = body.split(':');
    match fields.next() {
        Some("t") | Some("m") => {}
        _ => return Err(unexpected("thread block designator 't' or 'm'", line)),
    }
    let tid = parse_hex(
        "thread id",
        fields
            .next()
            .ok_or_else(|| unexpected("thread id field", line))?,
    )?;
    let entry = parse_hex(
        "entry pc",
        fields
            .next()
            .ok_or_else(|| unexpected("entry pc field", line))?,
    )?;
    if fields.next().is_some() {
        return Err(unexpected("end of thread header", line));
    }
    Ok((tid, entry))
}

/// Parses `<ts_ns>:<code>:0x<obj>:0x<caller>`.
pub fn parse_event_line(line: &str) -> Result<EventRecord, WireError> {
    let mut fields = line.split(':');
    let ts = parse_dec(
        "timestamp",
        fields
            .next()
            .ok_or_else(|| unexpected("timestamp field", line))?,
    )?;
    let code = fields
        .next()
        .ok_or_else(|| unexpected("event code field", line))?;
    let kind =
        EventKind::from_code(code).ok_or_else(|| WireError::UnknownEventCode(code.to_owned()))?;
    let addr = parse_hex(
        "object address",
        fields
            .next()
            .ok_or_else(|| unexpected("object address field", line))?,
    )?;
    let caller = parse_hex(
        "caller pc",
        fields
            .next()
            .ok_or_else(|| unexpected("caller pc field", line))?,
    )?;
    if fields.next().is_some() {
        return Err(unexpected("end of event line", line));
    }
    Ok(EventRecord {
        ts_ns: ts,
        kind,
        addr,
        caller,
    })
}

/// Parses `0x<pc>:<descriptor>`. The descriptor may itself contain colons
/// (`function@file:line`), so only the first separator splits.
pub fn parse_name_line(line: &str) -> Result<(u64, String), WireError> {
    let (pc, name) = line
        .split_once(':')
        .ok_or_else(|| unexpected("0x<pc>:<descriptor>", line))?;
    Ok((parse_hex("caller pc", pc)?, name.to_owned()))
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("resolving pc {pc:#x}: {message}")]
    Resolve { pc: u64, message: String },
}

/// Serializes histories into the trace file format: one block per thread,
/// then the name table mapping every distinct PC to a descriptor. PCs are
/// resolved once and coalesced; a resolver failure aborts the write (the
/// only failures it reports are fatal ones).
pub fn write_trace<W: Write>(
    out: &mut W,
    threads: &[(u64, &[EventRecord])],
    resolve: &mut dyn FnMut(u64) -> Result<String, String>,
) -> Result<(), WriteError> {
    let mut names: BTreeMap<u64, String> = BTreeMap::new();
    let mut name_of = |names: &mut BTreeMap<u64, String>, pc: u64| -> Result<(), WriteError> {
        if !names.contains_key(&pc) {
            let name = if pc == 0 {
                PROGRAM_ENTRY.to_owned()
            } else {
                resolve(pc).map_err(|message| WriteError::Resolve { pc, message })?
            };
            names.insert(pc, name);
        }
        Ok(())
    };

    for (tid, hist) in threads {
        let Some(first) = hist.first() else {
            continue;
        };
        // the first event of a history is its spawn; its object field is
        // the thread's entry hook and doubles as the block label
        write_thread_header(out, *tid, first.addr)?;
        name_of(&mut names, first.addr)?;
        for event in *hist {
            write_event(out, event)?;
            name_of(&mut names, event.caller)?;
        }
        out.write_all(b"\n")?;
    }

    writeln!(out, "{NAME_TABLE_HEADER}")?;
    for (pc, name) in &names {
        write_name(out, *pc, name)?;
    }
    out.write_all(b"\n")?;
    Ok(())
}
