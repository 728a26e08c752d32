// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracer singleton lifecycle.
//!
//! The singleton lives behind an `AtomicPtr` installed by the shared
//! object's load-time constructor and cleared by its destructor. While the
//! pointer is null (before init completes and after teardown begins)
//! every shadow delegates straight to the real primitive, which also
//! covers the window where the allocator takes locks during our own
//! initialization.

use crate::history::{HistoryMap, HistorySlot};
use crate::stackwalk::{self, Caller, ObjectBounds};
use crate::symbolizer;
use crate::writer;
use anyhow::Context;
use lktrace_common::control::{ControlBlock, CTL_SHM_NAME, LIVENESS_SOCKET_PATH};
use lktrace_common::{EventKind, EventRecord};
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use std::cell::Cell;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering::SeqCst};
use std::sync::Mutex;
use std::time::Instant;

static TRACER: AtomicPtr<Tracer> = AtomicPtr::new(ptr::null_mut());

thread_local! {
    // handle to this thread's history, claimed on first event
    static MY_SLOT: Cell<Option<&'static HistorySlot>> = const { Cell::new(None) };
}

/// Options resolved at init, from the supervisor's control block when one
/// is published and from built-in defaults under a bare `LD_PRELOAD`.
pub(crate) struct TracerConfig {
    pub trace_skip: u32,
    pub prefix: String,
    pub out_dir: PathBuf,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            trace_skip: 0,
            prefix: "lktracedat-".to_owned(),
            out_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// Read-only mapping of the supervisor's control block.
struct CtlMapping {
    ptr: NonNull<c_void>,
    released: AtomicBool,
}

// The mapping is written once by the supervisor before any tracer maps it.
unsafe impl Send for CtlMapping {}
unsafe impl Sync for CtlMapping {}

impl CtlMapping {
    fn open() -> anyhow::Result<CtlMapping> {
        let fd = shm_open(CTL_SHM_NAME, OFlag::O_RDONLY, Mode::empty())
            .context("control block shm not published")?;
        let len = NonZeroUsize::new(ControlBlock::SIZE).context("empty control block")?;
        let ptr = unsafe {
            mmap(None, len, ProtFlags::PROT_READ, MapFlags::MAP_SHARED, &fd, 0)
                .context("mapping control block")?
        };
        // fd is not needed once mapped; OwnedFd closes it here
        Ok(CtlMapping {
            ptr,
            released: AtomicBool::new(false),
        })
    }

    fn block(&self) -> &ControlBlock {
        unsafe { ControlBlock::from_ptr(self.ptr.as_ptr() as *const u8) }
    }

    fn release(&self) {
        if self.released.swap(true, SeqCst) {
            return;
        }
        unsafe {
            let _ = munmap(self.ptr, ControlBlock::SIZE);
        }
    }
}

pub struct Tracer {
    pub(crate) histories: HistoryMap,
    pub(crate) config: TracerConfig,
    init_time: Instant,
    multithreaded: AtomicBool,
    own_bounds: ObjectBounds,
    alloc_bounds: ObjectBounds,
    ctl: Option<CtlMapping>,
    // held open for the life of the process; the supervisor counts the
    // hangup when we die
    liveness: Mutex<Option<UnixStream>>,
}

pub fn get() -> Option<&'static Tracer> {
    unsafe { TRACER.load(SeqCst).cast_const().as_ref() }
}

/// Load-time initialization. Hooks stay inert until this publishes the
/// singleton, so everything here may freely allocate and lock.
pub fn init() {
    if !TRACER.load(SeqCst).is_null() {
        return;
    }

    let own_bounds = symbolizer::object_bounds(init as usize).unwrap_or_default();
    let alloc_bounds = symbolizer::object_bounds(libc::malloc as usize).unwrap_or_default();

    let (config, ctl) = match CtlMapping::open() {
        Ok(mapping) => {
            let block = mapping.block();
            let config = TracerConfig {
                trace_skip: block.trace_skip,
                prefix: block.prefix().to_owned(),
                out_dir: block.working_dir(),
            };
            (config, Some(mapping))
        }
        // no supervisor: standalone preload with defaults
        Err(_) => (TracerConfig::default(), None),
    };

    let liveness = UnixStream::connect(LIVENESS_SOCKET_PATH).ok();

    let tracer: &'static Tracer = Box::leak(Box::new(Tracer {
        histories: HistoryMap::new(),
        config,
        init_time: Instant::now(),
        multithreaded: AtomicBool::new(false),
        own_bounds,
        alloc_bounds,
        ctl,
        liveness: Mutex::new(liveness),
    }));

    // The first unwinder walk warms up its caches (and allocates); do it
    // now, before events flow, and use it to attribute the main thread.
    let caller = tracer.walk_caller(0);
    tracer.add_this_thread(0, caller, false);

    writer::install_abort_handler();

    TRACER.store(tracer as *const Tracer as *mut Tracer, SeqCst);
}

/// Teardown at shared-object destruction: record the main thread's exit,
/// serialize everything, release IPC resources.
pub fn fini() {
    let ptr = TRACER.swap(ptr::null_mut(), SeqCst);
    // From here hooks pass through again; straggler detached threads stop
    // producing events before we iterate the histories.
    let Some(tracer) = (unsafe { ptr.cast_const().as_ref() }) else {
        return;
    };

    tracer.sever_this_thread();

    if tracer.multithreaded.load(SeqCst) {
        if let Err(err) = writer::write_trace_file(tracer) {
            eprintln!("lktrace: failed to write trace: {err:#}");
        }
    }

    tracer.release();
    // The histories are intentionally leaked: a detached thread that
    // outlives main must not find its slot freed under it.
}

impl Tracer {
    fn now(&self) -> u64 {
        self.init_time.elapsed().as_nanos() as u64
    }

    fn walk_caller(&self, trace_skip: u32) -> usize {
        match stackwalk::capture_caller(self.own_bounds, self.alloc_bounds, trace_skip) {
            Caller::Pc(pc) => pc,
            Caller::Allocator | Caller::Unknown => 0,
        }
    }

    /// Caller PC for a spawn event, captured in the creating thread. The
    /// configured trace-skip is for lock wrappers and does not apply here.
    pub fn spawn_caller(&self) -> usize {
        self.walk_caller(0)
    }

    /// Registers the calling thread with its entry hook and creator PC.
    pub fn add_this_thread(&'static self, hook: usize, caller: usize, multithreaded: bool) {
        if multithreaded {
            self.multithreaded.store(true, SeqCst);
        }
        let tid = unsafe { libc::pthread_self() } as usize;
        let Some(slot) = self.histories.insert(tid) else {
            return; // thread capacity exhausted, drop silently
        };
        let record = EventRecord {
            ts_ns: self.now(),
            kind: EventKind::ThrdSpawn,
            addr: hook as u64,
            caller: caller as u64,
        };
        unsafe { slot.append(record) };
        MY_SLOT.with(|cell| cell.set(Some(slot)));
    }

    /// Records the calling thread's exit event.
    pub fn sever_this_thread(&'static self) {
        let tid = unsafe { libc::pthread_self() } as usize;
        let record = EventRecord {
            ts_ns: self.now(),
            kind: EventKind::ThrdExit,
            addr: tid as u64,
            caller: self.walk_caller(0) as u64,
        };
        match MY_SLOT.with(|cell| cell.get()) {
            Some(slot) => unsafe { slot.append(record) },
            None => {
                if let Some(slot) = self.histories.get(tid) {
                    unsafe { slot.append(record) };
                }
            }
        }
    }

    /// Appends one synchronization event attributed to the walked caller.
    /// Events whose caller lies inside the allocator are abandoned.
    pub fn add_event(&'static self, kind: EventKind, obj: usize) {
        let caller = match stackwalk::capture_caller(
            self.own_bounds,
            self.alloc_bounds,
            self.config.trace_skip,
        ) {
            Caller::Pc(pc) => pc,
            Caller::Allocator => return,
            Caller::Unknown => 0,
        };
        let record = EventRecord {
            ts_ns: self.now(),
            kind,
            addr: obj as u64,
            caller: caller as u64,
        };

        let slot = match MY_SLOT.with(|cell| cell.get()) {
            Some(slot) => slot,
            None => {
                // a thread we never saw spawn (created behind our back);
                // give it a history starting with a synthetic spawn
                let tid = unsafe { libc::pthread_self() } as usize;
                let Some(slot) = self.histories.insert(tid) else {
                    return;
                };
                let spawn = EventRecord {
                    ts_ns: record.ts_ns,
                    kind: EventKind::ThrdSpawn,
                    addr: 0,
                    caller: 0,
                };
                unsafe { slot.append(spawn) };
                MY_SLOT.with(|cell| cell.set(Some(slot)));
                slot
            }
        };
        unsafe { slot.append(record) };
    }

    /// Idempotent release of IPC resources (mapping, liveness socket).
    fn release(&self) {
        if let Ok(mut liveness) = self.liveness.lock() {
            liveness.take();
        }
        if let Some(ctl) = &self.ctl {
            ctl.release();
        }
    }
}
