//! # Virtual memory management
//!
//! Owns the four-level x86-64 page-table tree: mapping at 4 KiB and 2 MiB
//! granularity, demand paging over two software entry bits, page-fault
//! completion, address-space lifecycle, and translation/flag queries.
//!
//! ```text
//! virtual address
//!  47      39 38      30 29      21 20      12 11         0
//! ┌──────────┬──────────┬──────────┬──────────┬────────────┐
//! │ PML4 idx │ PDPT idx │  PD idx  │  PT idx  │   offset   │
//! └────┬─────┴────┬─────┴────┬─────┴────┬─────┴────────────┘
//!      │          │          │          │
//!   CR3 ──▶ PML4 ──▶ PDPT ──▶ PD ──▶ PT ──▶ frame
//!                              │
//!                              └─ PS=1: 2 MiB leaf, walk ends here
//! ```
//!
//! The manager is an explicit context object ([`Vmm`]) over three seams:
//!
//! - [`FrameSource`]: the external physical frame allocator.
//! - [`PhysMapper`]: the one audited conversion from a physical node
//!   address to a writable view of it. On hardware this is the direct map;
//!   the point of the trait is that the conversion exists exactly once.
//! - [`TlbMaintenance`]: single-page invalidation and root activation, so
//!   the shootdown discipline is observable off-hardware.
//!
//! Nothing here is a free-floating global. The kernel glue owns the `Vmm`
//! (typically inside a [`VmmCell`](crate::vmm::VmmCell)) and threads it
//! into the page-fault vector.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod addresses;
mod entry;
mod fault;
mod space;
mod table;
mod vmm;

pub use addresses::{
    ENTRIES_PER_TABLE, PAGE_SIZE_2M, PAGE_SIZE_4K, PhysicalAddress, UPPER_HALF_FIRST_SLOT,
    VirtualAddress, align_down, align_up,
};
pub use entry::{MapFlags, PageEntry};
pub use fault::{PageFaultCode, halt};
pub use space::{AddressSpace, current_root, load_root};
pub use table::PageTable;
pub use vmm::{FaultResolution, Vmm, VmmCell, VmmError, VmmStats};

/// External physical frame allocator contract.
///
/// Frames are 4096 bytes, page-aligned, and exclusively owned by the
/// caller once handed out. The manager assumes nothing about the
/// allocator's internals.
pub trait FrameSource {
    /// One fresh frame, or `None` on exhaustion.
    fn allocate_frame(&mut self) -> Option<PhysicalAddress>;

    /// Returns a previously allocated frame to the pool.
    fn free_frame(&mut self, frame: PhysicalAddress);
}

/// Conversion from a physical frame address to a mutable view of it.
///
/// This is the only place physical/virtual arithmetic for page-table
/// nodes happens; every walk goes through it.
pub trait PhysMapper {
    /// # Safety
    ///
    /// `phys` must be the address of a live frame that is mapped (direct
    /// map or identity) at the implementation's translation, properly
    /// aligned for `T`, and not concurrently aliased as a different type.
    unsafe fn phys_to_mut<'a, T>(&self, phys: PhysicalAddress) -> &'a mut T;
}

/// TLB shootdown seam.
pub trait TlbMaintenance {
    /// Invalidates the translation for one page.
    fn flush_page(&mut self, page: VirtualAddress);

    /// Installs `root` as the active translation root; on hardware this
    /// reloads CR3 and thereby flushes all non-global entries.
    ///
    /// # Safety
    ///
    /// `root` must be a valid top-level node that keeps the executing
    /// code mapped.
    unsafe fn activate_root(&mut self, root: PhysicalAddress);
}

/// [`PhysMapper`] for a kernel whose physical memory is linearly mapped at
/// a fixed virtual base (`0` for identity mapping).
pub struct DirectMapper {
    virtual_base: u64,
}

impl DirectMapper {
    /// # Safety
    ///
    /// All physical memory handed to the manager must actually be mapped,
    /// writable, at `virtual_base + phys`.
    #[must_use]
    pub const unsafe fn new(virtual_base: u64) -> Self {
        Self { virtual_base }
    }
}

impl PhysMapper for DirectMapper {
    unsafe fn phys_to_mut<'a, T>(&self, phys: PhysicalAddress) -> &'a mut T {
        let virt = self.virtual_base.wrapping_add(phys.as_u64());
        unsafe { &mut *(virt as *mut T) }
    }
}

/// [`TlbMaintenance`] backed by `invlpg` and CR3 reload.
pub struct HardwareTlb;

impl TlbMaintenance for HardwareTlb {
    fn flush_page(&mut self, page: VirtualAddress) {
        unsafe {
            core::arch::asm!(
                "invlpg [{}]",
                in(reg) page.as_u64(),
                options(nostack, preserves_flags)
            );
        }
    }

    unsafe fn activate_root(&mut self, root: PhysicalAddress) {
        unsafe { space::load_root(root) };
    }
}

/// Trivial bump allocator over one physical region, for early boot before
/// the real physical memory manager takes over.
pub struct BumpFrameSource {
    next: u64,
    end: u64,
}

impl BumpFrameSource {
    /// Hands out frames from `[start, end)`; both must be page-aligned.
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self {
            next: start.as_u64(),
            end: end.as_u64(),
        }
    }
}

impl FrameSource for BumpFrameSource {
    fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        if self.next + PAGE_SIZE_4K > self.end {
            return None;
        }
        let frame = self.next;
        self.next += PAGE_SIZE_4K;
        Some(PhysicalAddress::new(frame))
    }

    fn free_frame(&mut self, _frame: PhysicalAddress) {
        // bump allocation does not reclaim; freed frames are dropped on
        // the floor until the real allocator is live
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Simulated physical memory: frame addresses are host pointers to
    //! page-aligned boxed frames, so an identity `PhysMapper` works.

    use crate::{FrameSource, PhysMapper, PhysicalAddress, TlbMaintenance, VirtualAddress};

    #[repr(C, align(4096))]
    pub struct Frame4K(pub [u8; 4096]);

    pub struct HostMapper;

    impl PhysMapper for HostMapper {
        unsafe fn phys_to_mut<'a, T>(&self, phys: PhysicalAddress) -> &'a mut T {
            unsafe { &mut *(phys.as_u64() as *mut T) }
        }
    }

    pub static HOST_MAPPER: HostMapper = HostMapper;

    /// Allocates real zeroed host frames and records every call.
    pub struct CountingFrames {
        pub allocated: usize,
        pub freed: Vec<PhysicalAddress>,
        pub limit: usize,
    }

    impl CountingFrames {
        pub fn new() -> Self {
            Self {
                allocated: 0,
                freed: Vec::new(),
                limit: usize::MAX,
            }
        }
    }

    impl FrameSource for CountingFrames {
        fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
            if self.allocated >= self.limit {
                return None;
            }
            self.allocated += 1;
            // leaked so the "physical" address stays valid for the test
            let frame = Box::leak(Box::new(Frame4K([0; 4096])));
            Some(PhysicalAddress::new(core::ptr::from_mut(frame) as u64))
        }

        fn free_frame(&mut self, frame: PhysicalAddress) {
            self.freed.push(frame);
        }
    }

    /// Records flushes instead of touching the CPU.
    pub struct RecordingTlb {
        pub flushed: Vec<VirtualAddress>,
        pub activated: Vec<PhysicalAddress>,
    }

    impl RecordingTlb {
        pub fn new() -> Self {
            Self {
                flushed: Vec::new(),
                activated: Vec::new(),
            }
        }
    }

    impl TlbMaintenance for RecordingTlb {
        fn flush_page(&mut self, page: VirtualAddress) {
            self.flushed.push(page);
        }

        unsafe fn activate_root(&mut self, root: PhysicalAddress) {
            self.activated.push(root);
        }
    }
}
