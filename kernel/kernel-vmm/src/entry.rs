//! # Page-table entries
//!
//! One 64-bit word per entry, shared across all four paging levels. Bits
//! 9 and 10 are architecturally OS-available; this kernel uses them for the
//! demand-paging bookkeeping:
//!
//! - `reserved` (bit 9): the entry describes an address the owner has
//!   claimed but not yet backed with a frame. Always paired with
//!   `present = 0`; the intended permission flags stay in the low bits.
//! - `on_demand` (bit 10): the page-fault handler may back this entry with
//!   a fresh frame on first touch.

use crate::addresses::PhysicalAddress;
use bitfield_struct::bitfield;
use bitflags::bitflags;

bitflags! {
    /// Caller-facing permission and caching flags for a mapping request.
    ///
    /// The discriminants coincide with the hardware bit positions, so the
    /// conversion into a [`PageEntry`] is a plain bit-or.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        /// Writes allowed through this mapping.
        const WRITABLE = 1 << 1;
        /// User-mode access allowed.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled (MMIO).
        const CACHE_DISABLE = 1 << 4;
        /// Translation survives an address-space switch.
        const GLOBAL = 1 << 8;
        /// Instruction fetches disallowed.
        const NO_EXECUTE = 1 << 63;
    }
}

/// A single 64-bit page-table entry, any level.
///
/// For non-leaf entries the frame is the next-level node; for leaf entries
/// (PT level, or PD level with `large_page` set) it is the mapped frame.
#[bitfield(u64)]
pub struct PageEntry {
    /// Present (P, bit 0). Hardware walks only present entries.
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/supervisor (US, bit 2).
    pub user_access: bool,

    /// Page write-through (PWT, bit 3).
    pub write_through: bool,

    /// Page cache disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5); set by the CPU on first use.
    pub accessed: bool,

    /// Dirty (D, bit 6); set by the CPU on first write, leaf only.
    pub dirty: bool,

    /// Page size (PS, bit 7); at PD level marks a 2 MiB leaf.
    pub large_page: bool,

    /// Global (G, bit 8); leaf only.
    pub global: bool,

    /// Software (bit 9): address range claimed, no frame attached yet.
    pub reserved: bool,

    /// Software (bit 10): back with a frame on first-touch page fault.
    pub on_demand: bool,

    /// Software (bit 11): unused.
    pub os_spare: bool,

    /// Physical frame bits \[51:12\].
    #[bits(40)]
    frame_bits: u64,

    /// OS-available high bits (52..=58); unused.
    #[bits(7)]
    pub os_available: u8,

    /// Protection key (59..=62); unused, hardware ignores without PKU.
    #[bits(4)]
    pub protection_key: u8,

    /// No-execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntry {
    /// The physical frame this entry points at.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits() << 12)
    }

    #[inline]
    pub const fn set_frame(&mut self, frame: PhysicalAddress) {
        self.set_frame_bits(frame.as_u64() >> 12);
    }

    /// A present leaf mapping `frame` with the requested `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalAddress, flags: MapFlags) -> Self {
        let mut entry = Self::from_bits(flags.bits()).with_present(true);
        entry.set_frame(frame);
        entry
    }

    /// A present 2 MiB leaf at the PD level.
    #[inline]
    #[must_use]
    pub const fn large_leaf(frame: PhysicalAddress, flags: MapFlags) -> Self {
        Self::leaf(frame, flags).with_large_page(true)
    }

    /// A pointer to a next-level node. Permissive on purpose: effective
    /// permissions are the intersection over the walk, so restriction
    /// happens at the leaf.
    #[inline]
    #[must_use]
    pub const fn table(node: PhysicalAddress) -> Self {
        let mut entry = Self::new().with_present(true).with_writable(true);
        entry.set_frame(node);
        entry
    }

    /// A deferred mapping: not present, `reserved` + `on_demand` set, the
    /// requested permission flags preserved for the eventual commit.
    #[inline]
    #[must_use]
    pub const fn reservation(flags: MapFlags) -> Self {
        Self::from_bits(flags.bits())
            .with_present(false)
            .with_reserved(true)
            .with_on_demand(true)
    }

    /// The permission flags carried by this entry.
    #[inline]
    #[must_use]
    pub const fn map_flags(&self) -> MapFlags {
        MapFlags::from_bits_truncate(self.into_bits())
    }

    /// Present and pointing at a next-level node (not a large leaf).
    #[inline]
    #[must_use]
    pub const fn is_table(&self) -> bool {
        self.present() && !self.large_page()
    }

    /// A claimed-but-unbacked entry the fault handler may complete.
    #[inline]
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        !self.present() && self.reserved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trip() {
        let frame = PhysicalAddress::new(0x1234_5000);
        let entry = PageEntry::leaf(frame, MapFlags::WRITABLE | MapFlags::NO_EXECUTE);
        assert!(entry.present());
        assert!(entry.writable());
        assert!(entry.no_execute());
        assert!(!entry.user_access());
        assert_eq!(entry.frame(), frame);
        assert_eq!(entry.map_flags(), MapFlags::WRITABLE | MapFlags::NO_EXECUTE);
    }

    #[test]
    fn reservation_preserves_flags_without_present() {
        let entry = PageEntry::reservation(MapFlags::WRITABLE | MapFlags::USER);
        assert!(!entry.present());
        assert!(entry.reserved());
        assert!(entry.on_demand());
        assert!(entry.is_deferred());
        assert_eq!(entry.map_flags(), MapFlags::WRITABLE | MapFlags::USER);
    }

    #[test]
    fn large_leaf_sets_ps() {
        let entry = PageEntry::large_leaf(PhysicalAddress::new(0x20_0000), MapFlags::WRITABLE);
        assert!(entry.present());
        assert!(entry.large_page());
        assert!(!entry.is_table());
        assert_eq!(entry.frame().as_u64(), 0x20_0000);
    }

    #[test]
    fn frame_bits_do_not_clobber_flags() {
        let mut entry = PageEntry::new().with_present(true).with_no_execute(true);
        entry.set_frame(PhysicalAddress::new(0x000F_FFFF_FFFF_F000));
        assert!(entry.present());
        assert!(entry.no_execute());
        assert_eq!(entry.frame().as_u64(), 0x000F_FFFF_FFFF_F000);
    }
}
