//! POSIX fault dispatch.
//!
//! One process-wide `SIGSEGV`/`SIGBUS` action serves every installed bridge.
//! The per-image registration record lives in the caller-provided handler
//! block; no synthesized code is needed because the signal dispatcher routes
//! by address range itself. Registered blocks are published through a fixed
//! table of atomic slots, so the handler walks them without taking a lock or
//! allocating; it must stay safe to run on a thread interrupted anywhere,
//! including inside this crate's own callers.
//!
//! A fault is owned by a bridge when the touched address or the interrupted
//! instruction lies in its range (native fault dispatch routes by the
//! faulting code location, and the portable contract routes by the touched
//! range; serving both keeps the two hosts equivalent). Faults owned by no
//! bridge chain to whatever action was installed before the dispatcher.

use std::mem::{self, MaybeUninit};
use std::ptr::{self, addr_of, addr_of_mut};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Once;

use thiserror::Error;
use tracing::error;

use crate::{AccessKind, ExceptionInfo, FaultHandlerFn};

/// Registration record written into the caller-provided handler block.
#[repr(C)]
pub(crate) struct HandlerBlock {
    base_address: u64,
    image_size: u64,
    handler: FaultHandlerFn,
}

impl HandlerBlock {
    fn covers(&self, addr: u64) -> bool {
        addr >= self.base_address && addr - self.base_address < self.image_size
    }
}

pub(crate) const BLOCK_SIZE: usize = mem::size_of::<HandlerBlock>();

/// One slot per bridged image; far above what a single guest loads.
const MAX_BRIDGES: usize = 64;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicPtr<HandlerBlock> = AtomicPtr::new(ptr::null_mut());
static SLOTS: [AtomicPtr<HandlerBlock>; MAX_BRIDGES] = [EMPTY_SLOT; MAX_BRIDGES];

#[derive(Debug, Error)]
pub(crate) enum BridgeError {
    #[error("installing the process-wide fault dispatcher failed")]
    DispatcherUnavailable,
    #[error("every fault-bridge slot is in use")]
    SlotsExhausted,
    #[error("registration is no longer present in its slot")]
    StaleRegistration,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Registration {
    slot: usize,
    block: *mut HandlerBlock,
}

pub(crate) fn install(
    base_address: u64,
    handler_addr: u64,
    image_size: u64,
    handler: FaultHandlerFn,
) -> Result<Registration, BridgeError> {
    if !ensure_dispatcher() {
        return Err(BridgeError::DispatcherUnavailable);
    }

    let block = handler_addr as *mut HandlerBlock;
    unsafe {
        block.write(HandlerBlock {
            base_address,
            image_size,
            handler,
        });
    }

    // Publish after the block contents are in place; the handler loads with
    // matching Acquire ordering.
    for (slot, entry) in SLOTS.iter().enumerate() {
        if entry
            .compare_exchange(ptr::null_mut(), block, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(Registration { slot, block });
        }
    }
    Err(BridgeError::SlotsExhausted)
}

pub(crate) fn uninstall(registration: Registration) -> Result<(), BridgeError> {
    SLOTS[registration.slot]
        .compare_exchange(
            registration.block,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        )
        .map(|_| ())
        .map_err(|_| BridgeError::StaleRegistration)
}

static DISPATCHER: Once = Once::new();
static DISPATCHER_READY: AtomicBool = AtomicBool::new(false);
static mut PREV_SEGV: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_BUS: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

fn ensure_dispatcher() -> bool {
    DISPATCHER.call_once(|| unsafe {
        let dispatch: unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            fault_handler;

        let mut action: libc::sigaction = mem::zeroed();
        // SA_ONSTACK: threads with an alternate stack (the runtime sets one
        // up for stack-overflow reporting) keep working when the fault is a
        // guard-page hit we end up forwarding.
        action.sa_sigaction = dispatch as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);

        let installed = libc::sigaction(
            libc::SIGSEGV,
            &action,
            (*addr_of_mut!(PREV_SEGV)).as_mut_ptr(),
        ) == 0
            && libc::sigaction(libc::SIGBUS, &action, (*addr_of_mut!(PREV_BUS)).as_mut_ptr()) == 0;
        if installed {
            DISPATCHER_READY.store(true, Ordering::Release);
        } else {
            error!("sigaction failed: {}", std::io::Error::last_os_error());
        }
    });
    DISPATCHER_READY.load(Ordering::Acquire)
}

unsafe extern "C" fn fault_handler(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let fault_addr = (*info).si_addr() as u64;
    let fetch_addr = instruction_pointer(context);

    for entry in &SLOTS {
        let block = entry.load(Ordering::Acquire);
        if block.is_null() {
            continue;
        }
        let block = &*block;
        if block.covers(fault_addr) || fetch_addr.is_some_and(|ip| block.covers(ip)) {
            let translated = classify(signal, fault_addr, context);
            (block.handler)(&translated);
            // Returning resumes at the faulting instruction; the callback is
            // responsible for having resolved the condition.
            return;
        }
    }

    forward(signal, info, context);
}

fn classify(signal: libc::c_int, fault_addr: u64, context: *mut libc::c_void) -> ExceptionInfo {
    if signal == libc::SIGSEGV {
        ExceptionInfo::AccessViolation {
            access: access_kind(context),
            vaddr: fault_addr,
        }
    } else {
        ExceptionInfo::Unrecognized
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
fn access_kind(context: *mut libc::c_void) -> AccessKind {
    // The kernel saves the architectural page-fault error code with the
    // interrupted register state: bit 1 set for writes, bit 4 for
    // instruction fetch.
    const PF_ERR_WRITE: i64 = 1 << 1;
    const PF_ERR_INSTR_FETCH: i64 = 1 << 4;

    let ucontext = context as *const libc::ucontext_t;
    if ucontext.is_null() {
        return AccessKind::Unknown;
    }
    let err = unsafe { (*ucontext).uc_mcontext.gregs[libc::REG_ERR as usize] };
    if err & PF_ERR_INSTR_FETCH != 0 {
        AccessKind::Execute
    } else if err & PF_ERR_WRITE != 0 {
        AccessKind::Write
    } else {
        AccessKind::Read
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu")))]
fn access_kind(_context: *mut libc::c_void) -> AccessKind {
    AccessKind::Unknown
}

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
fn instruction_pointer(context: *mut libc::c_void) -> Option<u64> {
    let ucontext = context as *const libc::ucontext_t;
    if ucontext.is_null() {
        return None;
    }
    Some(unsafe { (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] } as u64)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu")))]
fn instruction_pointer(_context: *mut libc::c_void) -> Option<u64> {
    None
}

/// Hands a fault owned by no bridge to whatever was installed before us.
unsafe fn forward(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let previous = if signal == libc::SIGSEGV {
        (*addr_of!(PREV_SEGV)).assume_init()
    } else {
        (*addr_of!(PREV_BUS)).assume_init()
    };

    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        let chained: unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            mem::transmute(previous.sa_sigaction);
        chained(signal, info, context);
    } else if previous.sa_sigaction == libc::SIG_IGN {
        // Stays ignored.
    } else if previous.sa_sigaction == libc::SIG_DFL {
        // Put the default action back and return; the re-raised fault then
        // ends the process exactly as it would have with no bridge loaded.
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(signal, &action, ptr::null_mut());
    } else {
        let chained: unsafe extern "C" fn(libc::c_int) = mem::transmute(previous.sa_sigaction);
        chained(signal);
    }
}
