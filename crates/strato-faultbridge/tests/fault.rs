use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use strato_faultbridge::{AccessKind, ExceptionHandler, ExceptionInfo};
use strato_vmem::{alloc, free, protect, system_info, Protection};

const KIND_NONE: usize = 0;
const KIND_READ: usize = 1;
const KIND_WRITE: usize = 2;
const KIND_EXECUTE: usize = 3;
const KIND_UNKNOWN: usize = 4;
const KIND_UNRECOGNIZED: usize = 5;

fn encode(info: &ExceptionInfo) -> usize {
    match info {
        ExceptionInfo::AccessViolation { access, .. } => match access {
            AccessKind::Read => KIND_READ,
            AccessKind::Write => KIND_WRITE,
            AccessKind::Execute => KIND_EXECUTE,
            AccessKind::Unknown => KIND_UNKNOWN,
        },
        ExceptionInfo::Unrecognized => KIND_UNRECOGNIZED,
    }
}

fn install_over(
    image_size: u64,
    image_prot: Protection,
    handler: fn(&ExceptionInfo),
) -> (ExceptionHandler, u64, u64) {
    let image = alloc(0, image_size, image_prot);
    assert_ne!(image, 0);
    let block = alloc(
        0,
        ExceptionHandler::block_size(),
        Protection::EXECUTE_READ_WRITE,
    );
    assert_ne!(block, 0);

    let mut bridge = ExceptionHandler::new();
    assert!(bridge.install(image, block, image_size, handler));
    (bridge, image, block)
}

mod write_fault {
    use super::*;

    static FAULTS: AtomicUsize = AtomicUsize::new(0);
    static KIND: AtomicUsize = AtomicUsize::new(KIND_NONE);
    static VADDR: AtomicU64 = AtomicU64::new(0);
    static REPAIR_BASE: AtomicU64 = AtomicU64::new(0);

    fn on_fault(info: &ExceptionInfo) {
        FAULTS.fetch_add(1, Ordering::SeqCst);
        KIND.store(encode(info), Ordering::SeqCst);
        if let ExceptionInfo::AccessViolation { vaddr, .. } = *info {
            VADDR.store(vaddr, Ordering::SeqCst);
        }
        // Resolve the fault so the store can retire on resume.
        let base = REPAIR_BASE.load(Ordering::SeqCst);
        assert!(protect(base, 0x1000, Protection::READ_WRITE, None));
    }

    #[test]
    fn bridged_and_resumed() {
        let (mut bridge, image, block) = install_over(0x10000, Protection::READ, on_fault);
        REPAIR_BASE.store(image, Ordering::SeqCst);

        let target = image + 0x40;
        unsafe { (target as *mut u64).write_volatile(0x5150_4F4E_4D4C_4B4A) };

        assert_eq!(FAULTS.load(Ordering::SeqCst), 1, "callback runs exactly once");
        assert_eq!(VADDR.load(Ordering::SeqCst), target);
        #[cfg(any(windows, all(target_os = "linux", target_arch = "x86_64", target_env = "gnu")))]
        assert_eq!(KIND.load(Ordering::SeqCst), KIND_WRITE);

        // The store retired after the callback repaired the page.
        assert_eq!(
            unsafe { (target as *const u64).read_volatile() },
            0x5150_4F4E_4D4C_4B4A
        );

        // The repaired page no longer faults.
        unsafe { (target as *mut u64).write_volatile(1) };
        assert_eq!(FAULTS.load(Ordering::SeqCst), 1);

        assert!(bridge.uninstall());
        assert!(free(block));
        assert!(free(image));
    }
}

mod read_fault {
    use super::*;

    static FAULTS: AtomicUsize = AtomicUsize::new(0);
    static KIND: AtomicUsize = AtomicUsize::new(KIND_NONE);
    static REPAIR_BASE: AtomicU64 = AtomicU64::new(0);

    fn on_fault(info: &ExceptionInfo) {
        FAULTS.fetch_add(1, Ordering::SeqCst);
        KIND.store(encode(info), Ordering::SeqCst);
        let base = REPAIR_BASE.load(Ordering::SeqCst);
        assert!(protect(base, 0x1000, Protection::READ, None));
    }

    #[test]
    fn classified_as_read() {
        let (mut bridge, image, block) = install_over(0x4000, Protection::NONE, on_fault);
        REPAIR_BASE.store(image, Ordering::SeqCst);

        let value = unsafe { (image as *const u8).read_volatile() };
        assert_eq!(value, 0, "fresh pages read back zeroed");

        assert_eq!(FAULTS.load(Ordering::SeqCst), 1);
        #[cfg(any(windows, all(target_os = "linux", target_arch = "x86_64", target_env = "gnu")))]
        assert_eq!(KIND.load(Ordering::SeqCst), KIND_READ);

        assert!(bridge.uninstall());
        assert!(free(block));
        assert!(free(image));
    }
}

mod lifecycle {
    use super::*;

    fn ignore_fault(_info: &ExceptionInfo) {}

    #[test]
    fn block_size_is_stable_and_page_rounded() {
        let size = ExceptionHandler::block_size();
        assert_ne!(size, 0);
        assert_eq!(size % system_info().page_size, 0);
        assert_eq!(size, ExceptionHandler::block_size());
    }

    #[test]
    fn install_is_not_reentrant() {
        let (mut bridge, image, block) = install_over(0x1000, Protection::READ, ignore_fault);

        // A second install on an installed instance is a no-op failure.
        assert!(!bridge.install(image, block, 0x1000, ignore_fault));

        assert!(bridge.uninstall());
        assert!(!bridge.uninstall(), "uninstall without install");

        // The instance is reusable once uninstalled.
        assert!(bridge.install(image, block, 0x1000, ignore_fault));
        assert!(bridge.uninstall());

        assert!(free(block));
        assert!(free(image));
    }

    #[test]
    fn uninstall_without_install_is_refused() {
        let mut bridge = ExceptionHandler::new();
        assert!(!bridge.uninstall());
    }

    #[test]
    fn degenerate_registrations_are_refused() {
        let image = alloc(0, 0x1000, Protection::READ);
        assert_ne!(image, 0);
        let block = alloc(
            0,
            ExceptionHandler::block_size(),
            Protection::EXECUTE_READ_WRITE,
        );
        assert_ne!(block, 0);

        let mut bridge = ExceptionHandler::new();
        assert!(!bridge.install(image, block, 0, ignore_fault));
        assert!(!bridge.install(image, 0, 0x1000, ignore_fault));
        // Neither refusal left partial state behind.
        assert!(!bridge.uninstall());

        assert!(free(block));
        assert!(free(image));
    }

    #[test]
    fn drop_releases_the_registration() {
        let image = alloc(0, 0x1000, Protection::READ);
        assert_ne!(image, 0);
        let block = alloc(
            0,
            ExceptionHandler::block_size(),
            Protection::EXECUTE_READ_WRITE,
        );
        assert_ne!(block, 0);

        {
            let mut bridge = ExceptionHandler::new();
            assert!(bridge.install(image, block, 0x1000, ignore_fault));
            // Dropped while installed; the registration must go with it.
        }

        // The range and block are free for a fresh registration.
        let mut bridge = ExceptionHandler::new();
        assert!(bridge.install(image, block, 0x1000, ignore_fault));
        assert!(bridge.uninstall());

        assert!(free(block));
        assert!(free(image));
    }
}
