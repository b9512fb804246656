//! Host-backed virtual memory for guest images.
//!
//! Guest code runs directly out of the emulator process's address space, so
//! the loader needs host-level region management rather than an emulated page
//! table. This crate provides:
//!
//! - [`alloc`] / [`alloc_aligned`] / [`free`] / [`protect`]: reserve, commit,
//!   release and re-protect address ranges, including alignments stronger
//!   than the host's allocation granularity
//! - [`patch_replace`] / [`flush_instruction_cache`]: apply a pre-computed
//!   8-byte patch to (possibly executable) memory with correct
//!   instruction-fetch visibility
//! - [`system_info`]: an immutable snapshot of page size, address range and
//!   processor topology used to size regions
//!
//! Failure contract: host-level failures are logged and reported as `0`
//! (no valid address) or `false`; the caller decides whether they are fatal.
//! Addresses and sizes are raw 64-bit virtual-address-space quantities.
//!
//! The process-wide address space is a single shared resource. Every
//! allocator entry point serializes on one internal mutex, so concurrent
//! calls from multiple threads are safe; see [`patch_replace`] for the one
//! contract this crate leaves to the caller.

mod alloc;
mod patch;
mod protection;
mod region;
mod sys;
mod sysinfo;

pub use alloc::{alloc, alloc_aligned, free, protect};
pub use patch::{flush_instruction_cache, patch_replace};
pub use protection::Protection;
pub use sysinfo::{system_info, ProcessorArchitecture, SystemInfo};
