//! Thin fallible wrappers around the host's virtual-memory calls.
//!
//! Everything above this module is platform-neutral; everything below it is
//! one host syscall plus error capture.

use thiserror::Error;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::*;

/// Failure of a single host virtual-memory call.
#[derive(Debug, Error)]
pub(crate) enum HostError {
    #[error("{call} failed: {source}")]
    Call {
        call: &'static str,
        source: std::io::Error,
    },
    #[error("request of {size:#x} bytes aligned to {alignment:#x} overflows the address space")]
    RequestOverflow { size: u64, alignment: u64 },
}

impl HostError {
    /// Captures the calling thread's last OS error for `call`.
    pub(crate) fn last(call: &'static str) -> Self {
        Self::Call {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}
