//! Memory-region records exchanged with the host facade.

use bitflags::bitflags;

bitflags! {
    /// Page-protection bits, host-neutral.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Protection: u8 {
        /// Pages may be read.
        const READ = 0b001;
        /// Pages may be written.
        const WRITE = 0b010;
        /// Pages may be executed.
        const EXEC = 0b100;
    }
}

impl Protection {
    /// Read/write, the default for engine data regions.
    pub const RW: Protection = Protection::READ.union(Protection::WRITE);
    /// Read/execute, the steady-state protection of cache units.
    pub const RX: Protection = Protection::READ.union(Protection::EXEC);
    /// Read/write/execute, held only while emitting into a unit.
    pub const RWX: Protection = Protection::RW.union(Protection::EXEC);
}

/// Allocation state of a queried region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionState {
    /// Address range is unallocated.
    Free,
    /// Address range is reserved but not committed.
    Reserved,
    /// Address range is committed and accessible per its protection.
    Committed,
}

/// What the host reports for one address query.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegionInfo {
    /// Base address of the containing region.
    pub base: u64,
    /// Size of the region in bytes.
    pub size: u64,
    /// Current protection.
    pub prot: Protection,
    /// Allocation state.
    pub state: RegionState,
}

impl RegionInfo {
    /// Whether `addr` falls inside this region.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base.wrapping_add(self.size)
    }

    /// Whether the region is committed and readable.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.state == RegionState::Committed && self.prot.contains(Protection::READ)
    }
}

/// Handle to a reservation the host made on the engine's behalf.
///
/// The engine threads this handle back into [`commit`](crate::os::OsFacade::commit),
/// [`protect`](crate::os::OsFacade::protect), and
/// [`free`](crate::os::OsFacade::free) calls; it never fabricates one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct OsRegion {
    /// Base address of the reservation.
    pub base: u64,
    /// Reserved size in bytes.
    pub size: u64,
}

impl OsRegion {
    /// One-past-the-end address of the reservation.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base.wrapping_add(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_composites() {
        assert!(Protection::RX.contains(Protection::READ));
        assert!(Protection::RX.contains(Protection::EXEC));
        assert!(!Protection::RX.contains(Protection::WRITE));
        assert_eq!(Protection::RWX, Protection::READ | Protection::WRITE | Protection::EXEC);
    }

    #[test]
    fn test_region_info_contains() {
        let info = RegionInfo {
            base: 0x1000,
            size: 0x1000,
            prot: Protection::RX,
            state: RegionState::Committed,
        };
        assert!(info.contains(0x1000));
        assert!(info.contains(0x1fff));
        assert!(!info.contains(0x2000));
        assert!(info.is_readable());
    }
}
