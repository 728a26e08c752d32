// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `lkdump`: inspect a trace produced by `lktrace`.

use anyhow::Context;
use clap::Parser;
use lktrace_analysis::{analysis, dump, Trace};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "lkdump",
    about = "Dump and analyze lktrace trace files",
    arg_required_else_help = true
)]
struct Cli {
    /// Write output here instead of stdout
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Minimum nesting pair count for a pattern to be reported
    #[arg(short = 'd', long = "min-depth", default_value_t = 0)]
    min_depth: usize,

    /// Dump per-thread event streams
    #[arg(long)]
    threads: bool,

    /// Dump cross-thread patterns with statistics
    #[arg(long)]
    patterns: bool,

    /// Dump the per-thread signature lists
    #[arg(long = "patterns-text")]
    patterns_text: bool,

    /// Dump the merged global timeline
    #[arg(long)]
    global: bool,

    /// Trace file to parse (exactly one)
    trace_file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    anyhow::ensure!(
        cli.threads || cli.patterns || cli.patterns_text || cli.global,
        "must specify at least one of --threads, --patterns, --patterns-text, --global"
    );

    let trace = Trace::load(&cli.trace_file)
        .with_context(|| format!("parsing {}", cli.trace_file.display()))?;
    log::debug!(
        "parsed {} threads, {} events",
        trace.threads.len(),
        trace.global_hist.len()
    );

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };

    if cli.threads {
        dump::dump_threads(&trace, &mut out)?;
    }
    if cli.patterns_text {
        let patterns = analysis::find_patterns(&trace);
        dump::dump_patterns_txt(&trace, &patterns, cli.min_depth, &mut out)?;
    }
    if cli.patterns {
        let cross = analysis::find_deps(&trace, cli.min_depth);
        dump::dump_patterns(&trace, &cross, &mut out)?;
    }
    if cli.global {
        dump::dump_global(&trace, &mut out)?;
    }
    out.flush()?;
    Ok(())
}
