use tracing::warn;

use crate::region;
use crate::sys;
use crate::sysinfo::{align_down, align_up, page_size};
use crate::Protection;

/// Reserves and commits `size` bytes with the given protection.
///
/// `address_hint` is a placement preference, not a guarantee; callers must
/// use the returned address. Returns `0`, never a valid mapping, when the
/// host refuses the allocation.
pub fn alloc(address_hint: u64, size: u64, prot: Protection) -> u64 {
    if size == 0 {
        warn!("alloc: zero-sized request");
        return 0;
    }
    let mut table = region::table().lock().unwrap();
    match sys::alloc(address_hint, size, prot) {
        Ok(base) => {
            table.insert_allocation(base, align_up(size, page_size()), prot);
            base
        }
        Err(err) => {
            warn!("alloc({size:#x}, hint {address_hint:#x}) failed: {err}");
            0
        }
    }
}

/// Like [`alloc`], but the returned address is an exact multiple of
/// `alignment`, which must be a power of two no smaller than the host page
/// size. Stronger-than-granularity placement requires an alignment-aware host
/// primitive; a host without one cannot run the emulator at all, so that
/// condition aborts rather than failing over to an unsound approximation.
pub fn alloc_aligned(size: u64, prot: Protection, alignment: u64) -> u64 {
    let page = page_size();
    if size == 0 || !alignment.is_power_of_two() || alignment < page {
        warn!("alloc_aligned: unusable request size={size:#x} alignment={alignment:#x}");
        return 0;
    }
    let mut table = region::table().lock().unwrap();
    match sys::alloc_aligned(size, prot, alignment) {
        Ok(base) => {
            table.insert_allocation(base, align_up(size, page), prot);
            base
        }
        Err(err) => {
            warn!("alloc_aligned({size:#x}, align {alignment:#x}) failed: {err}");
            0
        }
    }
}

/// Releases the entire region previously returned by [`alloc`] or
/// [`alloc_aligned`]. Returns `false`, without crashing, for a double free
/// or an address this allocator never produced.
pub fn free(address: u64) -> bool {
    let mut table = region::table().lock().unwrap();
    let Some(size) = table.allocation_size(address) else {
        warn!("free({address:#x}): not the base of a live allocation");
        return false;
    };
    match sys::free(address, size) {
        Ok(()) => {
            table.remove_allocation(address);
            true
        }
        Err(err) => {
            warn!("free({address:#x}) failed: {err}");
            false
        }
    }
}

/// Changes the protection of `[address, address + size)`, which the host
/// widens to whole pages. On success, the protection previously effective at
/// `address` is written to `old_prot` if requested; ranges this allocator has
/// never tracked report the host's answer where the host provides one and
/// fail safe to [`Protection::NONE`] where it does not.
///
/// Returns `false` on host failure, leaving the range's protection unchanged
/// from the caller's perspective.
pub fn protect(address: u64, size: u64, prot: Protection, old_prot: Option<&mut Protection>) -> bool {
    if size == 0 {
        warn!("protect({address:#x}): zero-sized range");
        return false;
    }
    let page = page_size();
    let end = match address.checked_add(size) {
        Some(end) if end <= u64::MAX - page => align_up(end, page),
        _ => {
            warn!("protect({address:#x}, {size:#x}): range overflows the address space");
            return false;
        }
    };
    let start = align_down(address, page);

    let mut table = region::table().lock().unwrap();
    let host_old = match sys::protect(start, end - start, prot) {
        Ok(old) => old,
        Err(err) => {
            warn!("protect({address:#x}, {size:#x}) failed: {err}");
            return false;
        }
    };
    let tracked_old = table.set_protection(start, end - start, prot);
    if let Some(slot) = old_prot {
        *slot = tracked_old.or(host_old).unwrap_or(Protection::NONE);
    }
    true
}
