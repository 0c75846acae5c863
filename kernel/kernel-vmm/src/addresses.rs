//! # Physical and virtual address newtypes
//!
//! Both address kinds are plain 64-bit values at the hardware level; the
//! newtypes exist so the type checker keeps them apart. A virtual address
//! additionally knows how to split itself into the four radix-tree indices
//! and the in-page offset:
//!
//! | Bits  | Meaning                    |
//! |-------|----------------------------|
//! | 47-39 | PML4 index (level 4)       |
//! | 38-30 | PDPT index (level 3)       |
//! | 29-21 | PD index (level 2)         |
//! | 20-12 | PT index (level 1)         |
//! | 11-0  | offset within a 4 KiB page |

use core::ops::{Add, AddAssign, Sub};

/// Size of a 4 KiB page or frame.
pub const PAGE_SIZE_4K: u64 = 4096;

/// Size of a 2 MiB large page.
pub const PAGE_SIZE_2M: u64 = 2 * 1024 * 1024;

/// Number of entries in one page-table node.
pub const ENTRIES_PER_TABLE: usize = 512;

/// First PML4 slot of the kernel upper half (virtual addresses from
/// `0xFFFF_8000_0000_0000` upward).
pub const UPPER_HALF_FIRST_SLOT: usize = 256;

/// Align `value` downwards to `align` (must be a power of two).
///
/// ```
/// # use kernel_vmm::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// assert_eq!(align_down(0x1000, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Align `value` upwards to `align` (must be a power of two).
///
/// ```
/// # use kernel_vmm::align_up;
/// assert_eq!(align_up(0x1234, 0x1000), 0x2000);
/// assert_eq!(align_up(0x1000, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// A physical address (machine bus address).
///
/// No alignment guarantee by itself; operations that store one into a
/// page-table entry check alignment first.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// A virtual address as seen through the active translation root.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl PhysicalAddress {
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl VirtualAddress {
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// The containing 4 KiB page base.
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE_4K))
    }

    /// Whether the address lies in the kernel upper half.
    #[must_use]
    pub const fn is_upper_half(self) -> bool {
        self.pml4_index() >= UPPER_HALF_FIRST_SLOT
    }

    /// PML4 index (bits 47-39).
    #[inline]
    #[must_use]
    pub const fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1ff) as usize
    }

    /// PDPT index (bits 38-30).
    #[inline]
    #[must_use]
    pub const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1ff) as usize
    }

    /// PD index (bits 29-21).
    #[inline]
    #[must_use]
    pub const fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1ff) as usize
    }

    /// PT index (bits 20-12).
    #[inline]
    #[must_use]
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x1ff) as usize
    }

    /// Offset within a 4 KiB page (bits 11-0).
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE_4K - 1)
    }

    /// Offset within a 2 MiB page (bits 20-0).
    #[inline]
    #[must_use]
    pub const fn large_page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE_2M - 1)
    }
}

impl core::fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl core::fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:016x} (physical)", self.0)
    }
}

impl core::fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl core::fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:016x} (virtual)", self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self(self.0.checked_add(rhs).expect("PhysicalAddress add"))
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self(self.0.checked_add(rhs).expect("VirtualAddress add"))
    }
}

impl AddAssign<u64> for PhysicalAddress {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl AddAssign<u64> for VirtualAddress {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl Sub<Self> for VirtualAddress {
    type Output = u64;

    fn sub(self, rhs: Self) -> u64 {
        self.0.checked_sub(rhs.0).expect("VirtualAddress sub")
    }
}

impl From<u64> for PhysicalAddress {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<u64> for VirtualAddress {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}
