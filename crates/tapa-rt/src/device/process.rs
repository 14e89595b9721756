// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Running a device invocation in a forked child process.
//!
//! The child reports its compute time through an anonymous shared mapping
//! and leaves with `_exit`, so none of the parent's destructors or atexit
//! handlers run twice.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::time::Duration;

use crate::error::DeviceError;

/// One `i64` of nanoseconds shared across `fork`.
struct SharedNanos {
    ptr: *mut i64,
}

impl SharedNanos {
    fn map() -> Result<Self, DeviceError> {
        // SAFETY: anonymous mapping with no backing file; the result is
        // checked against MAP_FAILED before use.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                std::mem::size_of::<i64>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(DeviceError::SharedMemory(io::Error::last_os_error()));
        }
        let ptr = raw.cast::<i64>();
        // SAFETY: freshly mapped, page aligned, and large enough.
        unsafe { ptr.write_volatile(0) };
        Ok(Self { ptr })
    }

    fn store(&self, nanos: i64) {
        // SAFETY: the mapping lives as long as `self`.
        unsafe { self.ptr.write_volatile(nanos) }
    }

    fn load(&self) -> i64 {
        // SAFETY: the mapping lives as long as `self`.
        unsafe { self.ptr.read_volatile() }
    }
}

impl Drop for SharedNanos {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from a successful mmap of exactly this size.
        unsafe {
            libc::munmap(self.ptr.cast(), std::mem::size_of::<i64>());
        }
    }
}

/// Run `invocation` in a child process and wait for it.
///
/// The child's `Ok` duration is handed back to the parent. A child that
/// returns an error, panics, or dies on a signal surfaces as
/// [`DeviceError::ChildFailed`].
pub(crate) fn run_in_child<F>(invocation: F) -> Result<Duration, DeviceError>
where
    F: FnOnce() -> Result<Duration, DeviceError>,
{
    let nanos = SharedNanos::map()?;

    // SAFETY: the child only runs `invocation` and then `_exit`s.
    let pid = unsafe { libc::fork() };
    if pid == -1 {
        return Err(DeviceError::Fork(io::Error::last_os_error()));
    }

    if pid == 0 {
        let code = match panic::catch_unwind(AssertUnwindSafe(invocation)) {
            Ok(Ok(elapsed)) => {
                nanos.store(i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX));
                libc::EXIT_SUCCESS
            }
            Ok(Err(err)) => {
                tracing::error!(%err, "device invocation failed in child process");
                libc::EXIT_FAILURE
            }
            Err(_) => libc::EXIT_FAILURE,
        };
        // SAFETY: terminates the child without unwinding into the parent's
        // stack frames.
        unsafe { libc::_exit(code) }
    }

    tracing::debug!(pid, "waiting for device invocation process");
    let status = wait_for(pid)?;
    if !(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == libc::EXIT_SUCCESS) {
        return Err(DeviceError::ChildFailed { status });
    }
    Ok(Duration::from_nanos(nanos.load().max(0) as u64))
}

fn wait_for(pid: libc::pid_t) -> Result<libc::c_int, DeviceError> {
    let mut status = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer.
        let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
        if waited == pid {
            return Ok(status);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(DeviceError::Fork(err));
        }
    }
}
