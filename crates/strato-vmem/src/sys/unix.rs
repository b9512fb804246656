use std::ffi::c_void;

use crate::sys::HostError;
use crate::sysinfo::{align_up, page_size};
use crate::Protection;

pub(crate) fn alloc(hint: u64, size: u64, prot: Protection) -> Result<u64, HostError> {
    let ptr = unsafe {
        libc::mmap(
            hint as *mut c_void,
            size as usize,
            prot.to_native(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(HostError::last("mmap"));
    }
    Ok(ptr as u64)
}

/// The host has no directly alignment-constrained mapping call, but it has an
/// exact equivalent: over-map by `alignment`, then trim the misaligned head
/// and the unused tail back off with `munmap`.
pub(crate) fn alloc_aligned(size: u64, prot: Protection, alignment: u64) -> Result<u64, HostError> {
    let page = page_size();
    let padded = size
        .checked_add(alignment)
        .ok_or(HostError::RequestOverflow { size, alignment })?;

    let base = alloc(0, padded, prot)?;
    let aligned = align_up(base, alignment);
    let head = aligned - base;
    if head > 0 {
        free(base, head)?;
    }
    let map_end = base + padded;
    let used_end = align_up(aligned + size, page);
    if used_end < map_end {
        free(used_end, map_end - used_end)?;
    }
    Ok(aligned)
}

pub(crate) fn free(addr: u64, size: u64) -> Result<(), HostError> {
    if unsafe { libc::munmap(addr as *mut c_void, size as usize) } != 0 {
        return Err(HostError::last("munmap"));
    }
    Ok(())
}

/// Applies `prot` to `[addr, addr + size)`. The host reports no previous
/// protection; the region table supplies it.
pub(crate) fn protect(addr: u64, size: u64, prot: Protection) -> Result<Option<Protection>, HostError> {
    if unsafe { libc::mprotect(addr as *mut c_void, size as usize, prot.to_native()) } != 0 {
        return Err(HostError::last("mprotect"));
    }
    Ok(None)
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn flush_instruction_cache(_addr: u64, _size: u64) -> Result<(), HostError> {
    // Instruction fetch is coherent with data stores on this host; the fence
    // keeps the patch store from sinking past the point where callers assume
    // it is visible.
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    Ok(())
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn flush_instruction_cache(addr: u64, size: u64) -> Result<(), HostError> {
    extern "C" {
        // Toolchain intrinsic; performs the dc cvau / ic ivau / isb dance.
        fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
    }
    unsafe { __clear_cache(addr as *mut _, addr.wrapping_add(size) as *mut _) };
    Ok(())
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) fn flush_instruction_cache(_addr: u64, _size: u64) -> Result<(), HostError> {
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    Ok(())
}

pub(crate) fn query_system_info() -> crate::SystemInfo {
    let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as u64,
        _ => 4096,
    };
    let processors = match unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } {
        n if n > 0 => n as u32,
        _ => 1,
    };
    let mask = if processors >= 64 {
        u64::MAX
    } else {
        (1u64 << processors) - 1
    };

    crate::SystemInfo {
        processor_architecture: if cfg!(target_arch = "x86_64") {
            crate::ProcessorArchitecture::Amd64
        } else {
            crate::ProcessorArchitecture::Unknown
        },
        page_size: page,
        allocation_granularity: page,
        // The kernel refuses application mappings below vm.mmap_min_addr;
        // this is the shipped default.
        minimum_application_address: 0x1_0000,
        // Top of the canonical lower half with 48-bit virtual addressing.
        maximum_application_address: 0x0000_7fff_ffff_ffff,
        active_processor_mask: mask,
        number_of_processors: processors,
        // Not exposed by this host.
        processor_level: 0,
        processor_revision: 0,
    }
}
