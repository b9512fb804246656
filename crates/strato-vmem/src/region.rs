//! Process-wide bookkeeping for regions handed out by the allocator.
//!
//! The host's own allocator is the source of truth for what is mapped, but it
//! does not answer two questions this layer needs answered deterministically:
//! the extent to release when a region is freed by base address alone, and
//! the protection that was effective at an address before a re-protection
//! (POSIX `mprotect` reports nothing). The table mirrors both, keyed by the
//! page-rounded ranges the host actually applies.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use crate::Protection;

#[derive(Debug, Clone, Copy)]
struct Span {
    end: u64,
    prot: Protection,
}

/// Range bookkeeping behind the single allocator mutex.
#[derive(Debug, Default)]
pub(crate) struct RegionTable {
    /// Allocation base -> one-past-end of the reserved extent.
    allocations: BTreeMap<u64, u64>,
    /// Protection spans keyed by start address. Spans never overlap; a span
    /// carries one uniform protection. Partial re-protection splits the
    /// affected spans, and a covering re-protection merges them back.
    spans: BTreeMap<u64, Span>,
}

impl RegionTable {
    pub(crate) fn insert_allocation(&mut self, base: u64, size: u64, prot: Protection) {
        let end = base + size;
        self.allocations.insert(base, end);
        self.carve(base, end);
        self.spans.insert(base, Span { end, prot });
    }

    /// Removes the allocation starting at `base`, returning its reserved
    /// size. `None` when `base` is not the base of a live allocation
    /// (double free, or an address this allocator never produced).
    pub(crate) fn remove_allocation(&mut self, base: u64) -> Option<u64> {
        let end = self.allocations.remove(&base)?;
        self.carve(base, end);
        Some(end - base)
    }

    pub(crate) fn allocation_size(&self, base: u64) -> Option<u64> {
        self.allocations.get(&base).map(|end| end - base)
    }

    /// Protection currently recorded at `addr`, if the address lies inside a
    /// tracked span.
    pub(crate) fn protection_at(&self, addr: u64) -> Option<Protection> {
        let (_, span) = self.spans.range(..=addr).next_back()?;
        (addr < span.end).then_some(span.prot)
    }

    /// Records a protection change over `[addr, addr + size)` and returns the
    /// protection previously recorded at `addr`. Ranges that touch no tracked
    /// allocation are left alone: the table only mirrors memory it handed
    /// out, so stale entries can never shadow host reuse of foreign ranges.
    pub(crate) fn set_protection(
        &mut self,
        addr: u64,
        size: u64,
        prot: Protection,
    ) -> Option<Protection> {
        let end = addr.checked_add(size)?;
        if !self.overlaps_allocation(addr, end) {
            return None;
        }
        let old = self.carve(addr, end);
        self.spans.insert(addr, Span { end, prot });
        old
    }

    fn overlaps_allocation(&self, addr: u64, end: u64) -> bool {
        self.allocations
            .range(..end)
            .next_back()
            .is_some_and(|(_, &alloc_end)| alloc_end > addr)
    }

    /// Removes span coverage of `[addr, end)`, splitting spans that straddle
    /// either boundary, and returns the protection previously recorded at
    /// `addr`.
    fn carve(&mut self, addr: u64, end: u64) -> Option<Protection> {
        let old = self.protection_at(addr);
        let mut overlapped = Vec::new();
        for (&start, span) in self.spans.range(..end).rev() {
            if span.end <= addr {
                break;
            }
            overlapped.push(start);
        }
        for start in overlapped {
            let span = self.spans.remove(&start).expect("span start collected above");
            if start < addr {
                self.spans.insert(
                    start,
                    Span {
                        end: addr,
                        prot: span.prot,
                    },
                );
            }
            if span.end > end {
                self.spans.insert(
                    end,
                    Span {
                        end: span.end,
                        prot: span.prot,
                    },
                );
            }
        }
        old
    }
}

pub(crate) fn table() -> &'static Mutex<RegionTable> {
    static TABLE: OnceLock<Mutex<RegionTable>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(RegionTable::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_lifecycle() {
        let mut table = RegionTable::default();
        table.insert_allocation(0x1000, 0x4000, Protection::READ_WRITE);

        assert_eq!(table.allocation_size(0x1000), Some(0x4000));
        assert_eq!(table.protection_at(0x1000), Some(Protection::READ_WRITE));
        assert_eq!(table.protection_at(0x4FFF), Some(Protection::READ_WRITE));
        assert_eq!(table.protection_at(0x5000), None);

        assert_eq!(table.remove_allocation(0x1000), Some(0x4000));
        assert_eq!(table.protection_at(0x1000), None);
        // Double free.
        assert_eq!(table.remove_allocation(0x1000), None);
        // Never a base we produced.
        assert_eq!(table.remove_allocation(0x2000), None);
    }

    #[test]
    fn partial_reprotect_splits_spans() {
        let mut table = RegionTable::default();
        table.insert_allocation(0x1000, 0x4000, Protection::READ_WRITE);

        let old = table.set_protection(0x2000, 0x1000, Protection::EXECUTE_READ);
        assert_eq!(old, Some(Protection::READ_WRITE));

        assert_eq!(table.protection_at(0x1FFF), Some(Protection::READ_WRITE));
        assert_eq!(table.protection_at(0x2000), Some(Protection::EXECUTE_READ));
        assert_eq!(table.protection_at(0x2FFF), Some(Protection::EXECUTE_READ));
        assert_eq!(table.protection_at(0x3000), Some(Protection::READ_WRITE));
    }

    #[test]
    fn covering_reprotect_merges_spans() {
        let mut table = RegionTable::default();
        table.insert_allocation(0x1000, 0x4000, Protection::READ_WRITE);
        table.set_protection(0x2000, 0x1000, Protection::EXECUTE_READ);

        let old = table.set_protection(0x1000, 0x4000, Protection::READ);
        assert_eq!(old, Some(Protection::READ_WRITE));
        for addr in [0x1000, 0x2000, 0x2FFF, 0x4FFF] {
            assert_eq!(table.protection_at(addr), Some(Protection::READ));
        }
    }

    #[test]
    fn untracked_ranges_are_ignored() {
        let mut table = RegionTable::default();
        assert_eq!(
            table.set_protection(0x9000, 0x1000, Protection::READ),
            None
        );
        assert_eq!(table.protection_at(0x9000), None);
    }

    #[test]
    fn reprotect_spanning_adjacent_allocations() {
        let mut table = RegionTable::default();
        table.insert_allocation(0x1000, 0x1000, Protection::READ);
        table.insert_allocation(0x2000, 0x1000, Protection::READ_WRITE);

        let old = table.set_protection(0x1000, 0x2000, Protection::NONE);
        assert_eq!(old, Some(Protection::READ));
        assert_eq!(table.protection_at(0x1800), Some(Protection::NONE));
        assert_eq!(table.protection_at(0x2800), Some(Protection::NONE));

        // Releasing one allocation must not disturb the other's spans.
        assert_eq!(table.remove_allocation(0x1000), Some(0x1000));
        assert_eq!(table.protection_at(0x1800), None);
        assert_eq!(table.protection_at(0x2800), Some(Protection::NONE));
    }
}
