// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process coordination.
//!
//! The liveness socket is the source of truth for process lifetime: every
//! tracer instance connects at init and holds the connection until it
//! dies, so accepts increment and hangups decrement the live-instance
//! counter. `waitpid` would only see our direct child; the socket also
//! sees grandchildren that re-exec with the preload inherited. A SIGCHLD
//! handler decrements for killed or core-dumped children, covering the
//! case where the kernel tears a process down too abruptly for an orderly
//! socket half-close.

use anyhow::Context;
use lktrace_common::control::{ControlBlock, CTL_SHM_NAME, LIVENESS_SOCKET_PATH};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CString};
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering::SeqCst};

pub struct Options {
    pub prefix: String,
    pub trace_skip: u32,
    pub target: Vec<String>,
}

/// Connected tracer instances, adjusted from the epoll loop and, for
/// killed children, from the signal handler.
static LIVE_INSTANCES: AtomicI64 = AtomicI64::new(0);

extern "C" fn on_sigchld(_signum: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    // only kill-or-dump dispositions; a clean exit hangs up its socket
    let code = unsafe { (*info).si_code };
    if code == libc::CLD_KILLED || code == libc::CLD_DUMPED {
        LIVE_INSTANCES.fetch_sub(1, SeqCst);
    }
}

/// Target command line frozen into `execv`-ready storage before the fork;
/// the child must not allocate between `fork` and `exec`.
struct PreparedExec {
    path: CString,
    _args: Vec<CString>,
    argv: Vec<*const c_char>,
}

impl PreparedExec {
    fn new(path: &Path, args: &[String]) -> anyhow::Result<PreparedExec> {
        let path = CString::new(path.as_os_str().as_encoded_bytes())
            .context("target path contains NUL")?;
        let mut arg_storage = vec![path.clone()];
        for arg in args {
            arg_storage.push(CString::new(arg.as_str()).context("target arg contains NUL")?);
        }
        let argv = arg_storage
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Ok(PreparedExec {
            path,
            _args: arg_storage,
            argv,
        })
    }

    /// Replaces the process image; returns only on failure.
    fn exec(&self) -> Errno {
        unsafe { libc::execv(self.path.as_ptr(), self.argv.as_ptr()) };
        Errno::last()
    }
}

/// The published control block; unmapping and unlinking are idempotent.
struct ControlShm {
    ptr: Option<NonNull<c_void>>,
    name: &'static str,
    unlinked: bool,
}

impl ControlShm {
    fn publish(name: &'static str, block: ControlBlock) -> anyhow::Result<ControlShm> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .with_context(|| format!("creating control shm {name} (stale from a crashed run?)"))?;
        let len = NonZeroUsize::new(ControlBlock::SIZE).context("empty control block")?;
        let result = ftruncate(&fd, ControlBlock::SIZE as libc::off_t)
            .context("sizing control shm")
            .and_then(|()| {
                unsafe {
                    mmap(
                        None,
                        len,
                        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                        MapFlags::MAP_SHARED,
                        &fd,
                        0,
                    )
                }
                .context("mapping control shm")
            });
        let ptr = match result {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = shm_unlink(name);
                return Err(err);
            }
        };
        unsafe { std::ptr::write(ptr.as_ptr() as *mut ControlBlock, block) };
        // fd no longer needed once mapped
        Ok(ControlShm {
            ptr: Some(ptr),
            name,
            unlinked: false,
        })
    }

    fn release(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            unsafe {
                let _ = munmap(ptr, ControlBlock::SIZE);
            }
        }
        if !self.unlinked {
            self.unlinked = true;
            let _ = shm_unlink(self.name);
        }
    }
}

impl Drop for ControlShm {
    fn drop(&mut self) {
        self.release();
    }
}

/// Locates the interceptor shared object: explicit override first, then
/// next to this executable, then the current directory.
fn find_tracer_object() -> anyhow::Result<PathBuf> {
    const SO_NAME: &str = "liblktrace_tracer.so";
    if let Ok(path) = std::env::var("LKTRACE_TRACER_SO") {
        return std::fs::canonicalize(&path)
            .with_context(|| format!("LKTRACE_TRACER_SO={path} does not exist"));
    }
    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join(SO_NAME));
        }
    }
    candidates.push(PathBuf::from(SO_NAME));
    for candidate in &candidates {
        if candidate.exists() {
            return std::fs::canonicalize(candidate).context("resolving tracer object path");
        }
    }
    anyhow::bail!("cannot find {SO_NAME}; set LKTRACE_TRACER_SO")
}

pub fn run(opts: Options) -> anyhow::Result<()> {
    let target = opts.target.first().context("no target given")?;
    let target_path =
        std::fs::canonicalize(target).with_context(|| format!("resolving target {target}"))?;
    let target_dir = target_path
        .parent()
        .context("target has no parent directory")?
        .to_path_buf();
    let working_dir = std::env::current_dir().context("resolving working directory")?;
    let tracer_so = find_tracer_object()?;

    // all IPC must be up before the target exists
    let mut prefix = opts.prefix.clone();
    prefix.push('-');
    let block = ControlBlock::new(opts.trace_skip, &prefix, &working_dir, &target_dir)?;
    let mut ctl = ControlShm::publish(CTL_SHM_NAME, block)?;

    let listener = UnixListener::bind(LIVENESS_SOCKET_PATH)
        .with_context(|| format!("binding {LIVENESS_SOCKET_PATH} (stale from a crashed run?)"))?;

    let action = SigAction::new(
        SigHandler::SigAction(on_sigchld),
        SaFlags::SA_SIGINFO | SaFlags::SA_NOCLDSTOP | SaFlags::SA_NOCLDWAIT,
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGCHLD, &action) }.context("installing SIGCHLD handler")?;

    let prepared = PreparedExec::new(&target_path, &opts.target[1..])?;

    log::debug!(
        "launching {} with preload {}",
        target_path.display(),
        tracer_so.display()
    );
    std::env::set_var("LD_PRELOAD", &tracer_so);
    std::env::set_current_dir(&target_dir).context("entering target directory")?;

    match unsafe { libc::fork() } {
        0 => {
            // child: exec or tell the listening parent we are not coming
            let errno = prepared.exec();
            eprintln!("lktrace: failed to exec {}: {errno}", target_path.display());
            drop(UnixStream::connect(LIVENESS_SOCKET_PATH));
            unsafe { libc::_exit(127) };
        }
        pid if pid > 0 => {
            log::debug!("target running as pid {pid}");
        }
        _ => {
            let err = std::io::Error::last_os_error();
            cleanup(&mut ctl);
            return Err(err).context("fork failed");
        }
    }

    let result = watch_instances(&listener);
    drop(listener);
    cleanup(&mut ctl);
    result
}

/// Drains the liveness multiplexer until the counter reaches zero and a
/// non-blocking poll confirms nothing else is queued.
fn watch_instances(listener: &UnixListener) -> anyhow::Result<()> {
    const LISTENER_TOKEN: u64 = u64::MAX;

    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("creating epoll set")?;
    epoll
        .add(listener, EpollEvent::new(EpollFlags::EPOLLIN, LISTENER_TOKEN))
        .context("watching liveness listener")?;

    let mut connections: HashMap<u64, UnixStream> = HashMap::new();
    let mut events = [EpollEvent::empty(); 16];
    let mut pending = 0;

    loop {
        if pending == 0 {
            pending = wait(&epoll, &mut events, EpollTimeout::NONE)?;
        }
        for event in &events[..pending] {
            if event.data() == LISTENER_TOKEN {
                let (stream, _addr) = listener.accept().context("accepting tracer instance")?;
                let token = stream.as_raw_fd() as u64;
                epoll
                    .add(&stream, EpollEvent::new(EpollFlags::EPOLLRDHUP, token))
                    .context("watching tracer connection")?;
                connections.insert(token, stream);
                let live = LIVE_INSTANCES.fetch_add(1, SeqCst) + 1;
                log::debug!("tracer instance connected ({live} live)");
            } else if let Some(stream) = connections.remove(&event.data()) {
                let _ = epoll.delete(&stream);
                let live = LIVE_INSTANCES.fetch_sub(1, SeqCst) - 1;
                log::debug!("tracer instance hung up ({live} live)");
            }
        }
        // events may have arrived while we processed; check before sleeping
        pending = wait(&epoll, &mut events, EpollTimeout::ZERO)?;
        if LIVE_INSTANCES.load(SeqCst) <= 0 && pending == 0 {
            return Ok(());
        }
    }
}

fn wait(epoll: &Epoll, events: &mut [EpollEvent], timeout: EpollTimeout) -> anyhow::Result<usize> {
    loop {
        match epoll.wait(events, timeout) {
            Ok(count) => return Ok(count),
            // SIGCHLD may land here and may have moved the counter
            Err(Errno::EINTR) => {
                if LIVE_INSTANCES.load(SeqCst) <= 0 {
                    return Ok(0);
                }
            }
            Err(err) => return Err(err).context("epoll wait"),
        }
    }
}

/// Idempotent teardown of the socket path and the shared-memory name.
fn cleanup(ctl: &mut ControlShm) {
    ctl.release();
    let _ = std::fs::remove_file(LIVENESS_SOCKET_PATH);
}
