//! Bridges host hardware faults inside guest address ranges back into the
//! emulator.
//!
//! A loaded guest image occupies host memory but was not produced by the host
//! toolchain, so the host's fault-dispatch machinery has no metadata for it:
//! a fault raised by guest code would unwind straight past it. For each
//! loaded image, [`ExceptionHandler`] synthesizes at runtime whatever the
//! host needs to route such faults here (on Windows a trampoline plus
//! hand-packed unwind metadata registered in the process function table, on
//! POSIX a registration record consulted by a process-wide signal
//! dispatcher) and translates each fault into a portable [`ExceptionInfo`]
//! for a caller-supplied callback.
//!
//! The callback runs synchronously on the faulting thread, at any time,
//! independent of any call stack this crate controls. Execution always
//! resumes at the faulting instruction after the callback returns; resolving
//! the fault (for example, mapping or re-protecting the touched page) is the
//! callback's job, and returning without doing so simply re-raises the same
//! fault.

mod sys;

use tracing::warn;

/// How a faulting access tried to touch memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
    /// The host did not report a usable access-type code.
    Unknown,
}

/// Portable description of one hardware fault.
///
/// Built fresh per fault and handed to the callback by reference; it is not
/// retained after the callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionInfo {
    /// The guest touched memory its current protection forbids.
    AccessViolation { access: AccessKind, vaddr: u64 },
    /// A host fault category this layer does not classify.
    Unrecognized,
}

/// Callback receiving every fault in the registered range, on the faulting
/// thread. It may inspect and repair emulator state; execution resumes when
/// it returns.
pub type FaultHandlerFn = fn(&ExceptionInfo);

/// Routes hardware faults in one image's address range to a callback.
///
/// One registration per loaded image; the loader that maps the image owns
/// the instance and must not uninstall while a guest thread can still be
/// executing inside the range. Dropping an installed instance uninstalls it,
/// so a host-level registration never outlives its owner.
pub struct ExceptionHandler {
    registration: Option<sys::Registration>,
}

impl ExceptionHandler {
    pub fn new() -> Self {
        Self { registration: None }
    }

    /// Bytes of page-aligned, writable (and, where the host dispatch
    /// convention requires synthesized code, executable) memory the caller
    /// must reserve for the handler block passed to [`install`]. Always a
    /// multiple of the host page size and stable across calls.
    ///
    /// [`install`]: Self::install
    pub fn block_size() -> u64 {
        let page = strato_vmem::system_info().page_size;
        (sys::BLOCK_SIZE as u64 + page - 1) & !(page - 1)
    }

    /// Installs the bridge over `[base_address, base_address + image_size)`,
    /// writing the synthesized handler block to `handler_addr` and
    /// registering it with the host. A second `install` on an installed
    /// instance is a no-op failure. On registration failure nothing is
    /// retained and the instance stays uninstalled.
    pub fn install(
        &mut self,
        base_address: u64,
        handler_addr: u64,
        image_size: u64,
        handler: FaultHandlerFn,
    ) -> bool {
        if self.registration.is_some() {
            warn!("install: bridge already installed over {base_address:#x}");
            return false;
        }
        if handler_addr == 0 || image_size == 0 {
            warn!("install: unusable registration (block {handler_addr:#x}, size {image_size:#x})");
            return false;
        }
        match sys::install(base_address, handler_addr, image_size, handler) {
            Ok(registration) => {
                self.registration = Some(registration);
                true
            }
            Err(err) => {
                warn!("install over {base_address:#x} failed: {err}");
                false
            }
        }
    }

    /// Removes the host-level registration. Returns `false` when nothing is
    /// installed or the host refuses the removal (the instance then stays
    /// installed). After success the handler block is the caller's to reuse
    /// or release.
    pub fn uninstall(&mut self) -> bool {
        let Some(registration) = self.registration else {
            warn!("uninstall: nothing installed");
            return false;
        };
        match sys::uninstall(registration) {
            Ok(()) => {
                self.registration = None;
                true
            }
            Err(err) => {
                warn!("uninstall failed: {err}");
                false
            }
        }
    }
}

impl Default for ExceptionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExceptionHandler {
    fn drop(&mut self) {
        if self.registration.is_some() {
            self.uninstall();
        }
    }
}
