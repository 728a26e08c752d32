// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-of-process trace emission.
//!
//! The serialization itself lives in `lktrace_common::wire` so the writer
//! and the parser cannot drift; this module supplies the file naming, the
//! symbolization pass over every distinct PC, and the abort handler that
//! leaves a symbolized backtrace behind when a traced process dies by
//! `SIGABRT`.

use crate::symbolizer::Symbolizer;
use crate::tracer::Tracer;
use anyhow::Context;
use lktrace_common::{wire, EventRecord};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};

/// Writes `<prefix><pid>` in the supervisor's working directory.
pub fn write_trace_file(tracer: &Tracer) -> anyhow::Result<PathBuf> {
    let path = tracer.config.out_dir.join(format!(
        "{}{}",
        tracer.config.prefix,
        std::process::id()
    ));
    let file = File::create(&path)
        .with_context(|| format!("creating trace file {}", path.display()))?;
    let mut out = BufWriter::new(file);

    // Safety: called from teardown, after the singleton is unpublished.
    let threads: Vec<(u64, &[EventRecord])> = unsafe { tracer.histories.histories() }
        .map(|(tid, hist)| (tid as u64, hist))
        .collect();

    let mut symbolizer = Symbolizer::new();
    wire::write_trace(&mut out, &threads, &mut |pc| {
        symbolizer.resolve(pc).map_err(|err| format!("{err:#}"))
    })?;
    out.flush()?;
    // symbolizer drops here, closing its cached object handles
    Ok(path)
}

static OLD_ABORT_SET: AtomicBool = AtomicBool::new(false);
static mut OLD_ABORT: Option<SigAction> = None;

/// Installs a `SIGABRT` handler that dumps a symbolized backtrace before
/// chaining to the previous disposition. Multi-process targets otherwise
/// die without a word about who aborted.
pub fn install_abort_handler() {
    let action = SigAction::new(
        SigHandler::Handler(on_abort),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Safety: init runs once, before the handler can fire.
    unsafe {
        if let Ok(old) = signal::sigaction(Signal::SIGABRT, &action) {
            OLD_ABORT = Some(old);
            OLD_ABORT_SET.store(true, SeqCst);
        }
    }
}

extern "C" fn on_abort(_signum: libc::c_int) {
    eprintln!("lktrace: pid {} aborted, backtrace:", std::process::id());
    let mut depth = 0;
    backtrace::trace(|frame| {
        let ip = frame.ip();
        let mut printed = false;
        backtrace::resolve(ip, |symbol| {
            if let Some(name) = symbol.name() {
                eprintln!("  #{depth} {ip:p} {name}");
                printed = true;
            }
        });
        if !printed {
            eprintln!("  #{depth} {ip:p} ??");
        }
        depth += 1;
        depth < 32
    });

    // restore the previous disposition and re-raise so core dumps still
    // happen the way the target configured them
    if OLD_ABORT_SET.load(SeqCst) {
        // Safety: written once before OLD_ABORT_SET was raised.
        if let Some(old) = unsafe { OLD_ABORT.take() } {
            unsafe {
                let _ = signal::sigaction(Signal::SIGABRT, &old);
            }
        }
    }
    let _ = signal::raise(Signal::SIGABRT);
}
