// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shadowed pthread entry points.
//!
//! Each shadow raises a per-thread guard, records the request event, calls
//! the real primitive resolved once via `dlsym(RTLD_NEXT)`, and records
//! the outcome event. A raised guard means the call came from inside our
//! own instrumentation (the allocator growing an event vector, the
//! unwinder, ...) and the shadow delegates without logging. This is the
//! second recursion defense, next to allocator caller classification.
//!
//! The shadows are transparent by contract: every return value of the real
//! primitive is propagated unchanged, errors included.

use crate::tracer;
use lktrace_common::EventKind;
use libc::{c_int, c_void};
use std::cell::Cell;
use std::ffi::CStr;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

struct HookGuard;

impl HookGuard {
    fn enter() -> Option<HookGuard> {
        IN_HOOK.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(HookGuard)
            }
        })
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|flag| flag.set(false));
    }
}

fn real_addr(cache: &AtomicUsize, name: &CStr) -> *mut c_void {
    let cached = cache.load(Ordering::Relaxed);
    if cached != 0 {
        return cached as *mut c_void;
    }
    let found = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if found.is_null() {
        // without the real primitive there is nothing sane to delegate to
        unsafe { libc::abort() };
    }
    // racing stores write the same value; dlsym is idempotent
    cache.store(found as usize, Ordering::Relaxed);
    found
}

macro_rules! real {
    ($name:ident : fn($($arg:ty),*) -> $ret:ty) => {{
        static CACHE: AtomicUsize = AtomicUsize::new(0);
        let addr = real_addr(
            &CACHE,
            CStr::from_bytes_with_nul(concat!(stringify!($name), "\0").as_bytes())
                .unwrap_or(c"")
        );
        unsafe { mem::transmute::<*mut c_void, unsafe extern "C" fn($($arg),*) -> $ret>(addr) }
    }};
}

#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_lock(lock: *mut libc::pthread_mutex_t) -> c_int {
    let real = real!(pthread_mutex_lock: fn(*mut libc::pthread_mutex_t) -> c_int);
    let (Some(tracer), Some(_guard)) = (tracer::get(), HookGuard::enter()) else {
        return real(lock);
    };
    tracer.add_event(EventKind::LockReq, lock as usize);
    let rc = real(lock);
    if rc == 0 {
        tracer.add_event(EventKind::LockAcq, lock as usize);
    } else {
        tracer.add_event(EventKind::LockErr, lock as usize);
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_unlock(lock: *mut libc::pthread_mutex_t) -> c_int {
    let real = real!(pthread_mutex_unlock: fn(*mut libc::pthread_mutex_t) -> c_int);
    let (Some(tracer), Some(_guard)) = (tracer::get(), HookGuard::enter()) else {
        return real(lock);
    };
    tracer.add_event(EventKind::LockRel, lock as usize);
    real(lock)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_cond_wait(
    cond: *mut libc::pthread_cond_t,
    lock: *mut libc::pthread_mutex_t,
) -> c_int {
    let real = real!(pthread_cond_wait:
        fn(*mut libc::pthread_cond_t, *mut libc::pthread_mutex_t) -> c_int);
    let (Some(tracer), Some(_guard)) = (tracer::get(), HookGuard::enter()) else {
        return real(cond, lock);
    };
    tracer.add_event(EventKind::CondWait, cond as usize);
    // waiting atomically releases the mutex; keep lock depth truthful
    tracer.add_event(EventKind::LockRel, lock as usize);
    let rc = real(cond, lock);
    if rc == 0 {
        tracer.add_event(EventKind::CondLeave, cond as usize);
        // and a successful wakeup reacquired it
        tracer.add_event(EventKind::LockAcq, lock as usize);
    } else {
        tracer.add_event(EventKind::CondErr, lock as usize);
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn pthread_cond_signal(cond: *mut libc::pthread_cond_t) -> c_int {
    let real = real!(pthread_cond_signal: fn(*mut libc::pthread_cond_t) -> c_int);
    let (Some(tracer), Some(_guard)) = (tracer::get(), HookGuard::enter()) else {
        return real(cond);
    };
    tracer.add_event(EventKind::CondSignal, cond as usize);
    real(cond)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_cond_broadcast(cond: *mut libc::pthread_cond_t) -> c_int {
    let real = real!(pthread_cond_broadcast: fn(*mut libc::pthread_cond_t) -> c_int);
    let (Some(tracer), Some(_guard)) = (tracer::get(), HookGuard::enter()) else {
        return real(cond);
    };
    tracer.add_event(EventKind::CondBrdcst, cond as usize);
    real(cond)
}

type ThreadEntry = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

/// The real entry point and argument, plus the creator's call site,
/// carried across the thread boundary.
struct ThreadHook {
    entry: ThreadEntry,
    arg: *mut c_void,
    creator_pc: usize,
}

/// Runs in the new thread: registers it, then funnels the real entry's
/// return value through the exit shadow so every thread leaves one way.
unsafe extern "C" fn thread_trampoline(arg: *mut c_void) -> *mut c_void {
    let hook = Box::from_raw(arg as *mut ThreadHook);
    let ThreadHook {
        entry,
        arg,
        creator_pc,
    } = *hook;
    if let Some(tracer) = tracer::get() {
        if let Some(_guard) = HookGuard::enter() {
            tracer.add_this_thread(entry as usize, creator_pc, true);
        }
    }
    pthread_exit(entry(arg))
}

#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    entry: Option<ThreadEntry>,
    arg: *mut c_void,
) -> c_int {
    let real = real!(pthread_create:
        fn(*mut libc::pthread_t, *const libc::pthread_attr_t, Option<ThreadEntry>, *mut c_void) -> c_int);
    let (Some(tracer), Some(_guard)) = (tracer::get(), HookGuard::enter()) else {
        return real(thread, attr, entry, arg);
    };
    let Some(entry) = entry else {
        return real(thread, attr, entry, arg);
    };

    // the child cannot walk back to its creator; capture the call site here
    let creator_pc = tracer.spawn_caller();
    let hook = Box::into_raw(Box::new(ThreadHook {
        entry,
        arg,
        creator_pc,
    }));
    let rc = real(thread, attr, Some(thread_trampoline), hook as *mut c_void);
    if rc != 0 {
        // the trampoline will never run; reclaim the package
        drop(Box::from_raw(hook));
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn pthread_exit(value: *mut c_void) -> ! {
    if let Some(tracer) = tracer::get() {
        if let Some(_guard) = HookGuard::enter() {
            tracer.sever_this_thread();
        }
    }
    let real = real!(pthread_exit: fn(*mut c_void) -> !);
    real(value)
}
