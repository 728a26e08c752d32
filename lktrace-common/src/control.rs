// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory control block published by the supervisor and mapped
//! read-only by every tracer instance.
//!
//! The block is written exactly once, before the target is forked, so the
//! layout is a plain `#[repr(C)]` struct with fixed-capacity NUL-terminated
//! string fields rather than anything self-describing.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// POSIX shared-memory object name for the control block.
pub const CTL_SHM_NAME: &str = "/lktracectl";

/// Filesystem path of the supervisor's liveness socket. The socket carries
/// no data; connections are counted, hangups are deaths.
pub const LIVENESS_SOCKET_PATH: &str = "/tmp/lktracesock";

/// Capacity of the output-prefix field, including the terminating NUL.
pub const CTL_PREFIX_CAP: usize = 256;

/// Capacity of each directory field, including the terminating NUL.
pub const CTL_PATH_CAP: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{field} too long ({len} bytes, capacity {cap})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        cap: usize,
    },
    #[error("{field} contains an interior NUL byte")]
    InteriorNul { field: &'static str },
}

/// Options handed from the supervisor to the tracers.
#[repr(C)]
pub struct ControlBlock {
    /// Extra stack frames to skip after leaving the tracer's own object.
    pub trace_skip: u32,
    prefix: [u8; CTL_PREFIX_CAP],
    wrdir: [u8; CTL_PATH_CAP],
    tdir: [u8; CTL_PATH_CAP],
}

fn fill(
    field: &'static str,
    dst: &mut [u8],
    src: &[u8],
) -> Result<(), ControlError> {
    if src.contains(&0) {
        return Err(ControlError::InteriorNul { field });
    }
    // leave room for the NUL
    if src.len() >= dst.len() {
        return Err(ControlError::FieldTooLong {
            field,
            len: src.len(),
            cap: dst.len(),
        });
    }
    dst[..src.len()].copy_from_slice(src);
    dst[src.len()] = 0;
    Ok(())
}

fn zstr(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

impl ControlBlock {
    pub const SIZE: usize = std::mem::size_of::<ControlBlock>();

    pub fn new(
        trace_skip: u32,
        prefix: &str,
        working_dir: &Path,
        target_dir: &Path,
    ) -> Result<ControlBlock, ControlError> {
        let mut block = ControlBlock {
            trace_skip,
            prefix: [0; CTL_PREFIX_CAP],
            wrdir: [0; CTL_PATH_CAP],
            tdir: [0; CTL_PATH_CAP],
        };
        fill("prefix", &mut block.prefix, prefix.as_bytes())?;
        fill("working dir", &mut block.wrdir, working_dir.as_os_str().as_bytes())?;
        fill("target dir", &mut block.tdir, target_dir.as_os_str().as_bytes())?;
        Ok(block)
    }

    /// Output filename prefix, already carrying its trailing separator.
    pub fn prefix(&self) -> &str {
        // written from a &str in new(); a foreign writer producing non-UTF8
        // degrades to the default prefix rather than aborting the tracer
        std::str::from_utf8(zstr(&self.prefix)).unwrap_or("lktracedat-")
    }

    /// Directory the supervisor was launched from; traces are written here.
    pub fn working_dir(&self) -> PathBuf {
        PathBuf::from(OsStr::from_bytes(zstr(&self.wrdir)))
    }

    /// Directory containing the target executable.
    pub fn target_dir(&self) -> PathBuf {
        PathBuf::from(OsStr::from_bytes(zstr(&self.tdir)))
    }

    /// Reinterprets a mapped region as a control block.
    ///
    /// # Safety
    /// `ptr` must point to at least [`ControlBlock::SIZE`] readable bytes
    /// holding a block previously written with [`ControlBlock::new`], and
    /// the mapping must outlive the returned reference.
    pub unsafe fn from_ptr<'a>(ptr: *const u8) -> &'a ControlBlock {
        &*(ptr as *const ControlBlock)
    }
}
