use std::ffi::c_void;
use std::sync::OnceLock;

use tracing::error;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
};
use windows_sys::Win32::System::SystemInformation::{
    GetSystemInfo, PROCESSOR_ARCHITECTURE_AMD64, SYSTEM_INFO,
};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

use crate::sys::HostError;
use crate::Protection;

pub(crate) fn alloc(hint: u64, size: u64, prot: Protection) -> Result<u64, HostError> {
    let ptr = unsafe {
        VirtualAlloc(
            hint as *mut c_void,
            size as usize,
            MEM_COMMIT | MEM_RESERVE,
            prot.to_native(),
        )
    };
    if ptr.is_null() {
        return Err(HostError::last("VirtualAlloc"));
    }
    Ok(ptr as u64)
}

/// `MEM_ADDRESS_REQUIREMENTS`/`MEM_EXTENDED_PARAMETER`, declared locally so
/// the extended-parameter union stays a plain word pair.
#[repr(C)]
struct MemAddressRequirements {
    lowest_starting_address: *mut c_void,
    highest_ending_address: *mut c_void,
    alignment: usize,
}

#[repr(C)]
struct MemExtendedParameter {
    // MEM_EXTENDED_PARAMETER_TYPE in the low 8 bits.
    type_and_reserved: u64,
    pointer: *mut c_void,
}

const MEM_EXTENDED_PARAMETER_ADDRESS_REQUIREMENTS: u64 = 1;

type VirtualAlloc2Fn = unsafe extern "system" fn(
    process: HANDLE,
    base_address: *mut c_void,
    size: usize,
    allocation_type: u32,
    page_protection: u32,
    extended_parameters: *mut MemExtendedParameter,
    parameter_count: u32,
) -> *mut c_void;

/// Resolved dynamically: the call only exists on hosts new enough to place
/// alignment-constrained allocations.
fn virtual_alloc2() -> Option<VirtualAlloc2Fn> {
    static RESOLVED: OnceLock<Option<VirtualAlloc2Fn>> = OnceLock::new();
    *RESOLVED.get_or_init(|| unsafe {
        let module = GetModuleHandleA(c"KernelBase".as_ptr().cast());
        if module.is_null() {
            return None;
        }
        GetProcAddress(module, c"VirtualAlloc2".as_ptr().cast())
            .map(|f| std::mem::transmute::<_, VirtualAlloc2Fn>(f))
    })
}

pub(crate) fn alloc_aligned(size: u64, prot: Protection, alignment: u64) -> Result<u64, HostError> {
    let Some(virtual_alloc2) = virtual_alloc2() else {
        // Missing host capability, not a runtime data condition: there is no
        // sound way to emulate the alignment guarantee here.
        error!("VirtualAlloc2 is unavailable; aligned allocation cannot be honored");
        std::process::abort();
    };

    let mut requirements = MemAddressRequirements {
        lowest_starting_address: std::ptr::null_mut(),
        highest_ending_address: std::ptr::null_mut(),
        alignment: alignment as usize,
    };
    let mut parameter = MemExtendedParameter {
        type_and_reserved: MEM_EXTENDED_PARAMETER_ADDRESS_REQUIREMENTS,
        pointer: (&mut requirements as *mut MemAddressRequirements).cast(),
    };

    let ptr = unsafe {
        virtual_alloc2(
            GetCurrentProcess(),
            std::ptr::null_mut(),
            size as usize,
            MEM_COMMIT | MEM_RESERVE,
            prot.to_native(),
            &mut parameter,
            1,
        )
    };
    if ptr.is_null() {
        return Err(HostError::last("VirtualAlloc2"));
    }
    Ok(ptr as u64)
}

pub(crate) fn free(addr: u64, _size: u64) -> Result<(), HostError> {
    if unsafe { VirtualFree(addr as *mut c_void, 0, MEM_RELEASE) } == 0 {
        return Err(HostError::last("VirtualFree"));
    }
    Ok(())
}

/// Applies `prot` and reports the host's previous protection code for the
/// first page, translated back to the portable form.
pub(crate) fn protect(addr: u64, size: u64, prot: Protection) -> Result<Option<Protection>, HostError> {
    let mut old_native = 0u32;
    if unsafe {
        VirtualProtect(
            addr as *mut c_void,
            size as usize,
            prot.to_native(),
            &mut old_native,
        )
    } == 0
    {
        return Err(HostError::last("VirtualProtect"));
    }
    Ok(Some(Protection::from_native(old_native)))
}

pub(crate) fn flush_instruction_cache(addr: u64, size: u64) -> Result<(), HostError> {
    if unsafe {
        FlushInstructionCache(GetCurrentProcess(), addr as *const c_void, size as usize)
    } == 0
    {
        return Err(HostError::last("FlushInstructionCache"));
    }
    Ok(())
}

pub(crate) fn query_system_info() -> crate::SystemInfo {
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };

    let architecture = match unsafe { info.Anonymous.Anonymous.wProcessorArchitecture } {
        PROCESSOR_ARCHITECTURE_AMD64 => crate::ProcessorArchitecture::Amd64,
        _ => crate::ProcessorArchitecture::Unknown,
    };

    crate::SystemInfo {
        processor_architecture: architecture,
        page_size: info.dwPageSize as u64,
        allocation_granularity: info.dwAllocationGranularity as u64,
        minimum_application_address: info.lpMinimumApplicationAddress as u64,
        maximum_application_address: info.lpMaximumApplicationAddress as u64,
        active_processor_mask: info.dwActiveProcessorMask as u64,
        number_of_processors: info.dwNumberOfProcessors,
        processor_level: info.wProcessorLevel,
        processor_revision: info.wProcessorRevision,
    }
}
