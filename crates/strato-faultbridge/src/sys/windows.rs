//! Windows fault dispatch: structured-exception metadata synthesis.
//!
//! The host routes a hardware fault by looking the interrupted instruction's
//! address up in the process function table and running the unwind metadata's
//! language handler. A guest image has no such metadata, so installation
//! fabricates it: a `RUNTIME_FUNCTION` spanning the image, an `UNWIND_INFO`
//! with the exception-handler flag and no prologue, and a 12-byte trampoline
//! (`mov rax, imm64; jmp rax`) the metadata's handler RVA points at, jumping
//! to the translation routine below. The word after the handler RVA is the
//! convention's handler-data slot; it carries the block pointer so the
//! translation routine can find the registration.
//!
//! Everything is written into the caller-provided handler block, which must
//! therefore be executable and sit within 32-bit RVA reach above the image
//! base; the loader reserves it right past the image for exactly that
//! reason.

use std::ffi::c_void;
use std::io;
use std::mem;

use thiserror::Error;

use windows_sys::Win32::Foundation::EXCEPTION_ACCESS_VIOLATION;
use windows_sys::Win32::System::Diagnostics::Debug::{
    RtlAddFunctionTable, RtlDeleteFunctionTable, CONTEXT, EXCEPTION_RECORD,
    IMAGE_RUNTIME_FUNCTION_ENTRY,
};
use windows_sys::Win32::System::Kernel::{ExceptionContinueExecution, EXCEPTION_DISPOSITION};

use crate::{AccessKind, ExceptionInfo, FaultHandlerFn};

const UNW_VERSION: u8 = 1;
const UNW_FLAG_EHANDLER: u8 = 1;

/// `mov rax, imm64; jmp rax`.
#[repr(C, packed)]
struct Thunk {
    movabs: [u8; 2],
    target: u64,
    jmp: [u8; 2],
}

impl Thunk {
    fn to(target: u64) -> Self {
        Self {
            movabs: [0x48, 0xB8],
            target,
            jmp: [0xFF, 0xE0],
        }
    }
}

#[repr(C)]
struct RuntimeFunction {
    begin_address: u32,
    end_address: u32,
    unwind_data: u32,
}

/// `UNWIND_INFO` with the bitfields hand-packed (version and flags share a
/// byte, low bits first; likewise frame register and offset).
#[repr(C, packed)]
struct UnwindInfo {
    version_and_flags: u8,
    size_of_prolog: u8,
    count_of_codes: u8,
    frame_register_and_offset: u8,
    /// RVA (from the image base) of the handler thunk.
    exception_handler: u32,
    /// Handler-data slot: the dispatcher hands its address to the language
    /// handler, and it carries the registration.
    exception_data: *mut HandlerBlock,
}

#[repr(C, packed)]
pub(crate) struct HandlerBlock {
    thunk: Thunk,
    function_table: RuntimeFunction,
    unwind_info: UnwindInfo,
    handler: FaultHandlerFn,
}

pub(crate) const BLOCK_SIZE: usize = mem::size_of::<HandlerBlock>();

#[derive(Debug, Error)]
pub(crate) enum BridgeError {
    #[error("handler block at {addr:#x} is beyond 32-bit RVA reach of image base {base:#x}")]
    BlockOutOfReach { addr: u64, base: u64 },
    #[error("RtlAddFunctionTable failed: {0}")]
    RegistrationFailed(io::Error),
    #[error("RtlDeleteFunctionTable failed: {0}")]
    RemovalFailed(io::Error),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Registration {
    function_table: *const IMAGE_RUNTIME_FUNCTION_ENTRY,
}

/// Minimal slice of the x64 dispatcher context; windows-sys carries no
/// binding for it. Only `handler_data` is read, but the leading fields must
/// be declared to reach it at the right offset.
#[repr(C)]
struct DispatcherContext {
    control_pc: u64,
    image_base: u64,
    function_entry: *const IMAGE_RUNTIME_FUNCTION_ENTRY,
    establisher_frame: u64,
    target_ip: u64,
    context_record: *mut CONTEXT,
    language_handler: *const c_void,
    handler_data: *mut c_void,
}

/// Language handler the synthesized metadata routes every fault to. Runs on
/// the faulting thread; resuming is unconditional, the callback owns making
/// that safe.
unsafe extern "system" fn translate(
    record: *mut EXCEPTION_RECORD,
    _establisher_frame: u64,
    _context: *mut CONTEXT,
    dispatcher: *mut DispatcherContext,
) -> EXCEPTION_DISPOSITION {
    let record = &*record;
    let translated = if record.ExceptionCode == EXCEPTION_ACCESS_VIOLATION {
        let access = match record.ExceptionInformation[0] {
            0 => AccessKind::Read,
            1 => AccessKind::Write,
            8 => AccessKind::Execute,
            _ => AccessKind::Unknown,
        };
        ExceptionInfo::AccessViolation {
            access,
            vaddr: record.ExceptionInformation[1] as u64,
        }
    } else {
        ExceptionInfo::Unrecognized
    };

    let block = *((*dispatcher).handler_data as *const *mut HandlerBlock);
    ((*block).handler)(&translated);

    ExceptionContinueExecution
}

pub(crate) fn install(
    base_address: u64,
    handler_addr: u64,
    image_size: u64,
    handler: FaultHandlerFn,
) -> Result<Registration, BridgeError> {
    let unwind_addr = handler_addr + mem::offset_of!(HandlerBlock, unwind_info) as u64;
    let highest_rva = unwind_addr + mem::offset_of!(UnwindInfo, exception_data) as u64;
    if handler_addr < base_address || highest_rva - base_address > u32::MAX as u64 {
        return Err(BridgeError::BlockOutOfReach {
            addr: handler_addr,
            base: base_address,
        });
    }

    let block = handler_addr as *mut HandlerBlock;
    let translate_fn: unsafe extern "system" fn(
        *mut EXCEPTION_RECORD,
        u64,
        *mut CONTEXT,
        *mut DispatcherContext,
    ) -> EXCEPTION_DISPOSITION = translate;

    unsafe {
        block.write(HandlerBlock {
            thunk: Thunk::to(translate_fn as usize as u64),
            function_table: RuntimeFunction {
                begin_address: 0,
                end_address: image_size as u32,
                unwind_data: (unwind_addr - base_address) as u32,
            },
            unwind_info: UnwindInfo {
                version_and_flags: UNW_VERSION | (UNW_FLAG_EHANDLER << 3),
                size_of_prolog: 0,
                count_of_codes: 0,
                frame_register_and_offset: 0,
                exception_handler: (handler_addr - base_address) as u32,
                exception_data: block,
            },
            handler,
        });
    }
    strato_vmem::flush_instruction_cache(handler_addr, mem::size_of::<Thunk>() as u64);

    let function_table =
        (handler_addr + mem::offset_of!(HandlerBlock, function_table) as u64)
            as *const IMAGE_RUNTIME_FUNCTION_ENTRY;
    if unsafe { RtlAddFunctionTable(function_table, 1, base_address) } == 0 {
        return Err(BridgeError::RegistrationFailed(io::Error::last_os_error()));
    }
    Ok(Registration { function_table })
}

pub(crate) fn uninstall(registration: Registration) -> Result<(), BridgeError> {
    if unsafe { RtlDeleteFunctionTable(registration.function_table) } == 0 {
        return Err(BridgeError::RemovalFailed(io::Error::last_os_error()));
    }
    Ok(())
}
