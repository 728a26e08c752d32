// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Preloaded pthread synchronization tracer.
//!
//! Built as a `cdylib` and injected ahead of the threading library via
//! `LD_PRELOAD`, this object shadows the mutex, condition-variable and
//! thread lifecycle entry points, records a per-thread event history with
//! call-site attribution, and serializes a symbolized trace when the
//! process tears down. The `lktrace` supervisor publishes configuration in
//! shared memory and counts live tracer instances through a Unix socket;
//! without it the tracer still works standalone with defaults.

pub mod history;
pub mod stackwalk;
pub mod symbolizer;
pub mod tracer;
pub mod writer;

#[cfg(all(feature = "preload", not(test)))]
pub mod hooks;

// Interposition needs the tracer alive before the target's first pthread
// call and a serialization pass after its last: plain init/fini array
// entries, the same lifecycle the original C++ global object had.
#[cfg(all(feature = "preload", not(test)))]
mod lifecycle {
    extern "C" fn tracer_ctor() {
        crate::tracer::init();
    }

    extern "C" fn tracer_dtor() {
        crate::tracer::fini();
    }

    #[used]
    #[link_section = ".init_array"]
    static CTOR: extern "C" fn() = tracer_ctor;

    #[used]
    #[link_section = ".fini_array"]
    static DTOR: extern "C" fn() = tracer_dtor;
}
