//! Host-specific fault dispatch, fully encapsulated: nothing above this
//! module depends on the host's fault-dispatch convention.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::{install, uninstall, Registration, BLOCK_SIZE};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::{install, uninstall, Registration, BLOCK_SIZE};
