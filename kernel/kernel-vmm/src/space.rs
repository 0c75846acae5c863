//! # Address spaces
//!
//! An address space is ownership of one top-level node plus the value that
//! activates it in CR3. The kernel space is captured once at init from the
//! root the boot path installed; every additional space shares the kernel
//! upper half by reference and owns its lower half exclusively.
//!
//! Creation, teardown and switching live on [`Vmm`](crate::Vmm), which has
//! the frame source and mapper at hand; this module holds the handle type
//! and the raw CR3 accessors.

use crate::addresses::PhysicalAddress;

/// Handle to one top-level page-table node.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct AddressSpace {
    root: PhysicalAddress,
}

impl AddressSpace {
    #[must_use]
    pub const fn from_root(root: PhysicalAddress) -> Self {
        Self { root }
    }

    /// The space whose root is currently installed in CR3.
    ///
    /// # Safety
    ///
    /// Requires a privileged x86-64 context with paging enabled.
    #[must_use]
    pub unsafe fn from_current() -> Self {
        Self::from_root(unsafe { current_root() })
    }

    #[must_use]
    pub const fn root(self) -> PhysicalAddress {
        self.root
    }
}

/// Reads the physical root of the active translation tree from CR3.
///
/// # Safety
///
/// Requires a privileged x86-64 context.
#[must_use]
pub unsafe fn current_root() -> PhysicalAddress {
    let value: u64;
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    // low 12 bits carry PCD/PWT, not address
    PhysicalAddress::new(value & !0xfff)
}

/// Installs `root` into CR3, flushing all non-global TLB entries.
///
/// # Safety
///
/// `root` must point at a valid, page-aligned top-level node whose upper
/// half maps the currently executing code; a bad root faults on the next
/// fetch with no way back.
pub unsafe fn load_root(root: PhysicalAddress) {
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
    }
}
