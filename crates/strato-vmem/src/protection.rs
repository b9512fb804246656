use bitflags::bitflags;

bitflags! {
    /// Portable page-protection mode of a virtual-memory region.
    ///
    /// The empty set means no access at all; the eight possible values cover
    /// every combination a guest image can request. The current protection of
    /// a region is a mutable attribute, independent of its allocation state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// No access; any touch faults.
    pub const NONE: Self = Self::empty();
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    pub const EXECUTE_READ: Self = Self::EXECUTE.union(Self::READ);
    pub const EXECUTE_WRITE: Self = Self::EXECUTE.union(Self::WRITE);
    pub const EXECUTE_READ_WRITE: Self = Self::EXECUTE.union(Self::READ_WRITE);

    /// Whether instruction fetch from the region is permitted.
    #[inline]
    pub fn is_executable(self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

#[cfg(unix)]
impl Protection {
    /// Translates to the host's `PROT_*` bits. Pure; no failure path.
    pub fn to_native(self) -> libc::c_int {
        let mut native = libc::PROT_NONE;
        if self.contains(Self::READ) {
            native |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            native |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            native |= libc::PROT_EXEC;
        }
        native
    }

    /// Translates from the host's `PROT_*` bits.
    ///
    /// Codes carrying bits this layer does not model collapse to
    /// [`Protection::NONE`]; an unknown code must never widen to executable.
    pub fn from_native(native: libc::c_int) -> Self {
        if native & !(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) != 0 {
            return Self::NONE;
        }
        let mut prot = Self::NONE;
        if native & libc::PROT_READ != 0 {
            prot |= Self::READ;
        }
        if native & libc::PROT_WRITE != 0 {
            prot |= Self::WRITE;
        }
        if native & libc::PROT_EXEC != 0 {
            prot |= Self::EXECUTE;
        }
        prot
    }
}

#[cfg(windows)]
impl Protection {
    /// Translates to the host's `PAGE_*` code.
    ///
    /// The host cannot express write-without-read, so `WRITE` maps to the
    /// same code as `READ_WRITE` (and `EXECUTE_WRITE` to
    /// `EXECUTE_READ_WRITE`).
    pub fn to_native(self) -> u32 {
        use windows_sys::Win32::System::Memory::{
            PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY,
            PAGE_READWRITE,
        };

        let read = self.contains(Self::READ);
        let write = self.contains(Self::WRITE);
        match (read, write, self.is_executable()) {
            (false, false, false) => PAGE_NOACCESS,
            (true, false, false) => PAGE_READONLY,
            (_, true, false) => PAGE_READWRITE,
            (false, false, true) => PAGE_EXECUTE,
            (true, false, true) => PAGE_EXECUTE_READ,
            (_, true, true) => PAGE_EXECUTE_READWRITE,
        }
    }

    /// Translates from the host's `PAGE_*` code; unknown codes collapse to
    /// [`Protection::NONE`] rather than widening to executable.
    pub fn from_native(native: u32) -> Self {
        use windows_sys::Win32::System::Memory::{
            PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY,
            PAGE_READWRITE,
        };

        match native {
            PAGE_NOACCESS => Self::NONE,
            PAGE_READONLY => Self::READ,
            PAGE_READWRITE => Self::READ_WRITE,
            PAGE_EXECUTE => Self::EXECUTE,
            PAGE_EXECUTE_READ => Self::EXECUTE_READ,
            PAGE_EXECUTE_READWRITE => Self::EXECUTE_READ_WRITE,
            _ => Self::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executable_combinations() {
        assert!(!Protection::NONE.is_executable());
        assert!(!Protection::READ_WRITE.is_executable());
        assert!(Protection::EXECUTE.is_executable());
        assert!(Protection::EXECUTE_READ.is_executable());
        assert!(Protection::EXECUTE_READ_WRITE.is_executable());
    }

    #[cfg(unix)]
    #[test]
    fn native_round_trip() {
        for prot in [
            Protection::NONE,
            Protection::READ,
            Protection::WRITE,
            Protection::READ_WRITE,
            Protection::EXECUTE,
            Protection::EXECUTE_READ,
            Protection::EXECUTE_WRITE,
            Protection::EXECUTE_READ_WRITE,
        ] {
            assert_eq!(Protection::from_native(prot.to_native()), prot);
        }
    }

    #[cfg(unix)]
    #[test]
    fn unknown_native_bits_are_no_access() {
        let bogus = libc::PROT_READ | libc::PROT_EXEC | (1 << 20);
        assert_eq!(Protection::from_native(bogus), Protection::NONE);
    }

    #[cfg(windows)]
    #[test]
    fn native_round_trip_is_lossy_only_for_write() {
        // The host folds write-only into read-write; everything else maps
        // back exactly.
        assert_eq!(
            Protection::from_native(Protection::WRITE.to_native()),
            Protection::READ_WRITE
        );
        for prot in [
            Protection::NONE,
            Protection::READ,
            Protection::READ_WRITE,
            Protection::EXECUTE,
            Protection::EXECUTE_READ,
            Protection::EXECUTE_READ_WRITE,
        ] {
            assert_eq!(Protection::from_native(prot.to_native()), prot);
        }
    }
}
