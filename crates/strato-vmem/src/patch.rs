use std::ptr;

use tracing::warn;

use crate::alloc::protect;
use crate::sys;
use crate::Protection;

/// Makes the instruction-fetch path observe `[address, address + size)` as
/// currently written. Required after any store into memory that may be
/// executed; cached or speculative fetch state is otherwise free to diverge
/// from memory content.
pub fn flush_instruction_cache(address: u64, size: u64) -> bool {
    match sys::flush_instruction_cache(address, size) {
        Ok(()) => true,
        Err(err) => {
            warn!("flush_instruction_cache({address:#x}, {size:#x}) failed: {err}");
            false
        }
    }
}

/// Applies a pre-computed 8-byte patch value at `vaddr`, which must be
/// 8-byte aligned: the current protection is saved, the bytes are made
/// writable, the value is written, the saved protection is restored, and the
/// instruction cache is flushed when the saved protection was executable.
///
/// Returns whether the bytes actually changed, so repeated relocation passes
/// can skip redundant flushes and logging. Host failure reports `false`.
///
/// The protection toggle is not a cross-thread barrier: the caller must
/// guarantee no other thread fetches instructions from the patched bytes
/// while the call is in flight (patch before guest threads start, or stop
/// them around the patch).
pub fn patch_replace(vaddr: u64, value: u64) -> bool {
    if vaddr % 8 != 0 {
        warn!("patch_replace({vaddr:#x}): address is not 8-byte aligned");
        return false;
    }

    let mut saved = Protection::NONE;
    if !protect(vaddr, 8, Protection::READ_WRITE, Some(&mut saved)) {
        return false;
    }

    let target = vaddr as *mut u64;
    let changed = unsafe { ptr::read_volatile(target) } != value;
    unsafe { ptr::write_volatile(target, value) };

    if !protect(vaddr, 8, saved, None) {
        return false;
    }
    if saved.is_executable() && !flush_instruction_cache(vaddr, 8) {
        return false;
    }
    changed
}
