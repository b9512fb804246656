use std::sync::OnceLock;

/// Host processor architecture, as far as this layer cares to distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorArchitecture {
    Amd64,
    Unknown,
}

/// Immutable snapshot of the host's memory geometry and processor topology.
///
/// Produced once per process by [`system_info`]; higher layers use it to size
/// and place guest regions.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub processor_architecture: ProcessorArchitecture,
    /// Granularity of protection changes.
    pub page_size: u64,
    /// Granularity at which fresh allocations are placed. Coarser than the
    /// page size on hosts that reserve in larger chunks.
    pub allocation_granularity: u64,
    /// Lowest virtual address the host will hand to an application mapping.
    pub minimum_application_address: u64,
    /// Highest virtual address usable by application mappings.
    pub maximum_application_address: u64,
    pub active_processor_mask: u64,
    pub number_of_processors: u32,
    pub processor_level: u16,
    pub processor_revision: u16,
}

/// Queries the host once and returns the cached snapshot thereafter.
pub fn system_info() -> &'static SystemInfo {
    static INFO: OnceLock<SystemInfo> = OnceLock::new();
    INFO.get_or_init(crate::sys::query_system_info)
}

pub(crate) fn page_size() -> u64 {
    system_info().page_size
}

/// `alignment` must be a nonzero power of two.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_up(1, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_down(0x2000, 0x1000), 0x2000);
    }

    #[test]
    fn snapshot_is_stable_and_sane() {
        let first = system_info();
        let second = system_info();
        assert!(std::ptr::eq(first, second));

        assert!(first.page_size.is_power_of_two());
        assert!(first.allocation_granularity >= first.page_size);
        assert!(first.number_of_processors >= 1);
        assert_ne!(first.active_processor_mask, 0);
        assert!(first.minimum_application_address < first.maximum_application_address);
    }
}
