// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `lktrace`: run a target with the pthread tracer preloaded.
//!
//! The supervisor publishes tracer options in shared memory, listens on a
//! Unix socket whose connections count live tracer instances, forks the
//! target with `LD_PRELOAD` pointing at the interceptor, and exits once
//! every traced process (children of `fork`+`exec` included) has gone.

mod supervisor;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "lktrace",
    about = "Trace pthread synchronization in an unmodified program",
    arg_required_else_help = true
)]
struct Cli {
    /// Output filename prefix; traces are written as <PREFIX>-<pid>
    #[arg(short = 'f', long = "prefix", default_value = "lktracedat")]
    prefix: String,

    /// Stack frames to skip after leaving the tracer object, for targets
    /// that wrap their lock calls
    #[arg(short = 'd', long = "skip-frames", default_value_t = 0)]
    skip_frames: u32,

    /// Target command line
    #[arg(trailing_var_arg = true, required = true, value_name = "TARGET [ARGS]")]
    target: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    supervisor::run(supervisor::Options {
        prefix: cli.prefix,
        trace_skip: cli.skip_frames,
        target: cli.target,
    })
}
