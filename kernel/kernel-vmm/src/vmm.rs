//! # The virtual memory manager
//!
//! One [`Vmm`] per machine. It captures the boot-installed root as the
//! kernel address space, walks and grows the paging tree through the
//! [`PhysMapper`] seam, takes frames from the external [`FrameSource`],
//! and keeps the TLB honest through [`TlbMaintenance`].
//!
//! All mutating entry points assume interrupts are suppressed for their
//! duration (interrupt gate on the fault path, [`kernel_sync::IrqGuard`]
//! on voluntary paths); the structures carry no lock of their own.

use crate::addresses::{
    PAGE_SIZE_2M, PAGE_SIZE_4K, PhysicalAddress, UPPER_HALF_FIRST_SLOT, VirtualAddress,
};
use crate::entry::{MapFlags, PageEntry};
use crate::fault::PageFaultCode;
use crate::space::AddressSpace;
use crate::table::PageTable;
use crate::{FrameSource, PhysMapper, TlbMaintenance};
use kernel_sync::SpinLock;
use log::{debug, error, trace};

/// Failure modes of the mapping and demand-paging operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("virtual address {0} is not aligned to the page size")]
    MisalignedVirtual(VirtualAddress),
    #[error("physical address {0} is not aligned to the page size")]
    MisalignedPhysical(PhysicalAddress),
    #[error("physical frame allocator is exhausted")]
    OutOfFrames,
    #[error("no mapping at {0}")]
    NotMapped(VirtualAddress),
    #[error("no reservation at {0}")]
    NotReserved(VirtualAddress),
    #[error("a 2 MiB mapping covers {0}, no 4 KiB leaf exists there")]
    LargePage(VirtualAddress),
    #[error("address space is in use and cannot be destroyed")]
    AddressSpaceInUse,
}

/// Read-only operation counters, exposed to diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmmStats {
    pub pages_mapped: u64,
    pub pages_unmapped: u64,
    pub page_faults: u64,
    pub demand_allocations: u64,
    pub tlb_flushes: u64,
    pub reserved_outstanding: u64,
}

/// Outcome of [`Vmm::handle_page_fault`].
#[derive(Debug, Clone, Copy)]
pub enum FaultResolution {
    /// A deferred mapping was completed; the faulting instruction may be
    /// resumed transparently.
    DemandServed {
        page: VirtualAddress,
        frame: PhysicalAddress,
    },
    /// Genuine fault. The caller must report and halt; there is no
    /// isolation boundary to recover behind.
    Unrecoverable {
        code: PageFaultCode,
        address: VirtualAddress,
    },
}

/// Result of a read-only walk to the leaf level.
enum Resolved<'t> {
    /// Some intermediate node on the path is missing.
    Missing,
    /// The walk ended at a 2 MiB leaf in this PD slot.
    Large { pd: &'t mut PageTable, index: usize },
    /// The PT exists; the leaf entry (present or not) lives in this slot.
    Leaf { pt: &'t mut PageTable, index: usize },
}

pub struct Vmm<'m, M, A, T>
where
    M: PhysMapper,
    A: FrameSource,
    T: TlbMaintenance,
{
    mapper: &'m M,
    frames: A,
    tlb: T,
    kernel_space: AddressSpace,
    active: AddressSpace,
    demand_paging: bool,
    stats: VmmStats,
}

impl<'m, M, A, T> Vmm<'m, M, A, T>
where
    M: PhysMapper,
    A: FrameSource,
    T: TlbMaintenance,
{
    /// Adopts `boot_root` as the kernel address space. The boot path has
    /// already built and activated it; nothing is constructed from
    /// scratch here.
    pub fn new(mapper: &'m M, frames: A, tlb: T, boot_root: AddressSpace) -> Self {
        Self {
            mapper,
            frames,
            tlb,
            kernel_space: boot_root,
            active: boot_root,
            demand_paging: true,
            stats: VmmStats::default(),
        }
    }

    /// Adopts whatever root is live in CR3.
    ///
    /// # Safety
    ///
    /// Requires a privileged x86-64 context with paging enabled, and the
    /// active root must be reachable through `mapper`.
    pub unsafe fn from_current(mapper: &'m M, frames: A, tlb: T) -> Self {
        Self::new(mapper, frames, tlb, unsafe { AddressSpace::from_current() })
    }

    #[must_use]
    pub const fn kernel_space(&self) -> AddressSpace {
        self.kernel_space
    }

    #[must_use]
    pub const fn active_space(&self) -> AddressSpace {
        self.active
    }

    #[must_use]
    pub const fn stats(&self) -> VmmStats {
        self.stats
    }

    #[must_use]
    pub const fn demand_paging(&self) -> bool {
        self.demand_paging
    }

    pub const fn set_demand_paging(&mut self, enabled: bool) {
        self.demand_paging = enabled;
    }

    #[must_use]
    pub const fn frames(&self) -> &A {
        &self.frames
    }

    pub const fn frames_mut(&mut self) -> &mut A {
        &mut self.frames
    }

    #[must_use]
    pub const fn tlb(&self) -> &T {
        &self.tlb
    }

    // ---- mapping ---------------------------------------------------------

    /// Maps one 4 KiB page, creating intermediate nodes as needed.
    ///
    /// A pre-existing leaf (present or reserved) is overwritten; the later
    /// mapping is authoritative.
    pub fn map_page(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), VmmError> {
        if !virt.is_aligned(PAGE_SIZE_4K) {
            return Err(VmmError::MisalignedVirtual(virt));
        }
        if !phys.is_aligned(PAGE_SIZE_4K) {
            return Err(VmmError::MisalignedPhysical(phys));
        }

        let pt = self.leaf_table_create(virt)?;
        let index = virt.pt_index();
        let old = pt.get(index);
        if old.is_deferred() {
            self.stats.reserved_outstanding = self.stats.reserved_outstanding.saturating_sub(1);
        }
        pt.set(index, PageEntry::leaf(phys, flags));
        self.flush_one(virt);
        self.stats.pages_mapped += 1;
        trace!("map 4K {virt} -> {phys} ({flags:?})");
        Ok(())
    }

    /// Maps one 2 MiB page as a large leaf directly at the PD level.
    pub fn map_page_2mb(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), VmmError> {
        if !virt.is_aligned(PAGE_SIZE_2M) {
            return Err(VmmError::MisalignedVirtual(virt));
        }
        if !phys.is_aligned(PAGE_SIZE_2M) {
            return Err(VmmError::MisalignedPhysical(phys));
        }

        let root = self.node_mut(self.active.root());
        let pdpt_frame = self.next_table_create(root, virt.pml4_index(), virt)?;
        let pdpt = self.node_mut(pdpt_frame);
        let pd_frame = self.next_table_create(pdpt, virt.pdpt_index(), virt)?;
        let pd = self.node_mut(pd_frame);

        let index = virt.pd_index();
        let old = pd.get(index);
        pd.set(index, PageEntry::large_leaf(phys, flags));
        if old.is_table() {
            // the slot used to point at a PT; retire every leaf it still
            // described before dropping the node, so no stale 4 KiB
            // translation survives in the TLB and no reservation leaks
            // out of the outstanding count
            let pt = self.node_mut(old.frame());
            for (slot, entry) in pt.iter() {
                if entry.present() {
                    self.flush_one(virt + slot as u64 * PAGE_SIZE_4K);
                } else if entry.is_deferred() {
                    self.stats.reserved_outstanding =
                        self.stats.reserved_outstanding.saturating_sub(1);
                }
            }
            self.frames.free_frame(old.frame());
        }
        self.flush_one(virt);
        self.stats.pages_mapped += 1;
        trace!("map 2M {virt} -> {phys} ({flags:?})");
        Ok(())
    }

    /// Clears a present 4 KiB leaf. Fails for addresses that were never
    /// mapped, including reservations that were never committed.
    pub fn unmap_page(&mut self, virt: VirtualAddress) -> Result<(), VmmError> {
        if !virt.is_aligned(PAGE_SIZE_4K) {
            return Err(VmmError::MisalignedVirtual(virt));
        }
        match self.resolve(virt) {
            Resolved::Missing => Err(VmmError::NotMapped(virt)),
            Resolved::Large { .. } => Err(VmmError::LargePage(virt)),
            Resolved::Leaf { pt, index } => {
                if !pt.get(index).present() {
                    return Err(VmmError::NotMapped(virt));
                }
                pt.set(index, PageEntry::new());
                self.flush_one(virt);
                self.stats.pages_unmapped += 1;
                trace!("unmap 4K {virt}");
                Ok(())
            }
        }
    }

    /// Resolves a virtual address through the hierarchy, joining the
    /// in-page offset back on. Works for 4 KiB and 2 MiB leaves.
    pub fn get_physical_address(
        &self,
        virt: VirtualAddress,
    ) -> Result<PhysicalAddress, VmmError> {
        match self.resolve(virt) {
            Resolved::Missing => Err(VmmError::NotMapped(virt)),
            Resolved::Large { pd, index } => {
                let entry = pd.get(index);
                Ok(entry.frame() + virt.large_page_offset())
            }
            Resolved::Leaf { pt, index } => {
                let entry = pt.get(index);
                if entry.present() {
                    Ok(entry.frame() + virt.page_offset())
                } else {
                    Err(VmmError::NotMapped(virt))
                }
            }
        }
    }

    /// Whether a present translation exists for `virt`.
    #[must_use]
    pub fn is_mapped(&self, virt: VirtualAddress) -> bool {
        self.get_physical_address(virt).is_ok()
    }

    /// Whether `virt` carries an uncommitted reservation.
    #[must_use]
    pub fn is_reserved(&self, virt: VirtualAddress) -> bool {
        match self.resolve(virt) {
            Resolved::Leaf { pt, index } => pt.get(index).is_deferred(),
            _ => false,
        }
    }

    /// Permission flags of the leaf covering `virt`, if any (present
    /// mappings and reservations both carry flags).
    #[must_use]
    pub fn flags_of(&self, virt: VirtualAddress) -> Option<MapFlags> {
        match self.resolve(virt) {
            Resolved::Missing => None,
            Resolved::Large { pd, index } => Some(pd.get(index).map_flags()),
            Resolved::Leaf { pt, index } => {
                let entry = pt.get(index);
                (entry.present() || entry.reserved()).then(|| entry.map_flags())
            }
        }
    }

    // ---- bulk wrappers ---------------------------------------------------

    /// Maps `count` consecutive 4 KiB pages. A mid-range failure aborts
    /// and leaves earlier pages mapped; there is no rollback.
    pub fn map_range(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        count: usize,
        flags: MapFlags,
    ) -> Result<(), VmmError> {
        for page in 0..count {
            let offset = page as u64 * PAGE_SIZE_4K;
            self.map_page(virt + offset, phys + offset, flags)?;
        }
        Ok(())
    }

    /// Unmaps `count` consecutive 4 KiB pages; aborts on first failure.
    pub fn unmap_range(&mut self, virt: VirtualAddress, count: usize) -> Result<(), VmmError> {
        for page in 0..count {
            self.unmap_page(virt + page as u64 * PAGE_SIZE_4K)?;
        }
        Ok(())
    }

    /// Maps `count` pages so that virtual equals physical.
    pub fn identity_map(
        &mut self,
        phys: PhysicalAddress,
        count: usize,
        flags: MapFlags,
    ) -> Result<(), VmmError> {
        self.map_range(VirtualAddress::new(phys.as_u64()), phys, count, flags)
    }

    // ---- demand paging ---------------------------------------------------

    /// Claims `count` pages starting at `virt` without consuming frames:
    /// each leaf gets `reserved` + `on_demand` set, `present` clear, and
    /// the requested flags preserved for the eventual commit.
    pub fn reserve_pages(
        &mut self,
        virt: VirtualAddress,
        count: usize,
        flags: MapFlags,
    ) -> Result<(), VmmError> {
        if !virt.is_aligned(PAGE_SIZE_4K) {
            return Err(VmmError::MisalignedVirtual(virt));
        }
        for page in 0..count {
            let addr = virt + page as u64 * PAGE_SIZE_4K;
            let pt = self.leaf_table_create(addr)?;
            let index = addr.pt_index();
            let old = pt.get(index);
            pt.set(index, PageEntry::reservation(flags));
            if old.present() {
                // a live translation may be cached for the old mapping
                self.flush_one(addr);
            }
            if !old.is_deferred() {
                self.stats.reserved_outstanding += 1;
            }
        }
        trace!("reserve {count} page(s) at {virt} ({flags:?})");
        Ok(())
    }

    /// Single-page reservation with kernel read-write flags; the frame
    /// arrives on first touch through the fault handler.
    pub fn allocate_on_demand(&mut self, virt: VirtualAddress) -> Result<(), VmmError> {
        self.reserve_pages(virt, 1, MapFlags::WRITABLE)
    }

    /// Converts a reservation into a present mapping right now, consuming
    /// one frame. Fails if `virt` carries no reservation.
    pub fn commit_page(&mut self, virt: VirtualAddress) -> Result<PhysicalAddress, VmmError> {
        match self.resolve(virt) {
            Resolved::Leaf { pt, index } if pt.get(index).is_deferred() => {
                let flags = pt.get(index).map_flags();
                let frame = self.frames.allocate_frame().ok_or(VmmError::OutOfFrames)?;
                pt.set(index, PageEntry::leaf(frame, flags));
                // no flush needed: a non-present entry cannot have been
                // cached by the TLB
                self.stats.reserved_outstanding =
                    self.stats.reserved_outstanding.saturating_sub(1);
                self.stats.pages_mapped += 1;
                trace!("commit {virt} -> {frame}");
                Ok(frame)
            }
            _ => Err(VmmError::NotReserved(virt)),
        }
    }

    /// Commits `count` consecutive reserved pages; aborts on first
    /// failure without rolling back earlier commits.
    pub fn commit_range(&mut self, virt: VirtualAddress, count: usize) -> Result<(), VmmError> {
        for page in 0..count {
            self.commit_page(virt + page as u64 * PAGE_SIZE_4K)?;
        }
        Ok(())
    }

    /// Entry point for the page-fault vector.
    ///
    /// Completes the deferred mapping when demand paging is enabled and
    /// the fault is a first touch of a reserved page; anything else is
    /// unrecoverable and the caller must halt after reporting.
    pub fn handle_page_fault(
        &mut self,
        code: PageFaultCode,
        address: VirtualAddress,
    ) -> FaultResolution {
        self.stats.page_faults += 1;

        if self.demand_paging && code.is_non_present() {
            let page = address.page_base();
            if let Resolved::Leaf { pt, index } = self.resolve(page) {
                let entry = pt.get(index);
                if entry.is_deferred() && entry.on_demand() {
                    let Some(frame) = self.frames.allocate_frame() else {
                        error!("demand fault at {address}: allocator exhausted");
                        return FaultResolution::Unrecoverable { code, address };
                    };
                    pt.set(index, PageEntry::leaf(frame, entry.map_flags()));
                    self.flush_one(page);
                    self.stats.demand_allocations += 1;
                    self.stats.reserved_outstanding =
                        self.stats.reserved_outstanding.saturating_sub(1);
                    debug!("demand fault at {address} served with {frame}");
                    return FaultResolution::DemandServed { page, frame };
                }
            }
        }

        error!("page fault at {address}: {}", code.explain());
        FaultResolution::Unrecoverable { code, address }
    }

    // ---- address spaces --------------------------------------------------

    /// Allocates a fresh top-level node, copies the kernel upper half by
    /// reference, and hands back the new space. Its lower half is empty.
    pub fn create_address_space(&mut self) -> Result<AddressSpace, VmmError> {
        let frame = self.frames.allocate_frame().ok_or(VmmError::OutOfFrames)?;
        let node = self.node_mut(frame);
        node.clear();

        let kernel_root = self.node_mut(self.kernel_space.root());
        for slot in UPPER_HALF_FIRST_SLOT..crate::ENTRIES_PER_TABLE {
            node.set(slot, kernel_root.get(slot));
        }

        debug!("created address space with root {frame}");
        Ok(AddressSpace::from_root(frame))
    }

    /// Frees a space's lower-half paging nodes bottom-up, then the root.
    ///
    /// The kernel-shared upper half is left untouched, and leaf data
    /// frames are not freed: the manager cannot know they are unshared
    /// (identity maps, MMIO), so frame ownership stays with the mapper.
    pub fn destroy_address_space(&mut self, space: AddressSpace) -> Result<(), VmmError> {
        if space == self.kernel_space || space == self.active {
            return Err(VmmError::AddressSpaceInUse);
        }

        let root = self.node_mut(space.root());
        for slot in 0..UPPER_HALF_FIRST_SLOT {
            let entry = root.get(slot);
            if entry.is_table() {
                self.free_directory_pointer(entry.frame());
            }
        }
        self.frames.free_frame(space.root());
        debug!("destroyed address space with root {}", space.root());
        Ok(())
    }

    /// Makes `space` the active translation tree.
    ///
    /// # Safety
    ///
    /// `space` must hold a valid root whose upper half maps the running
    /// kernel; on hardware this reloads CR3.
    pub unsafe fn switch_address_space(&mut self, space: AddressSpace) {
        self.active = space;
        self.stats.tlb_flushes += 1;
        unsafe { self.tlb.activate_root(space.root()) };
        trace!("switched to address space {}", space.root());
    }

    // ---- walk internals --------------------------------------------------

    fn node_mut(&self, phys: PhysicalAddress) -> &'m mut PageTable {
        unsafe { self.mapper.phys_to_mut::<PageTable>(phys) }
    }

    /// Returns the next-level node below `table[index]`, creating and
    /// zeroing it if the slot is empty. A large leaf in the slot is a
    /// structure conflict, never dereferenced as a node.
    fn next_table_create(
        &mut self,
        table: &mut PageTable,
        index: usize,
        virt: VirtualAddress,
    ) -> Result<PhysicalAddress, VmmError> {
        let entry = table.get(index);
        if entry.present() {
            if entry.large_page() {
                return Err(VmmError::LargePage(virt));
            }
            return Ok(entry.frame());
        }

        let frame = self.frames.allocate_frame().ok_or(VmmError::OutOfFrames)?;
        self.node_mut(frame).clear();
        table.set(index, PageEntry::table(frame));
        Ok(frame)
    }

    /// Walks to the PT for `virt`, creating missing levels.
    fn leaf_table_create(&mut self, virt: VirtualAddress) -> Result<&'m mut PageTable, VmmError> {
        let root = self.node_mut(self.active.root());
        let pdpt_frame = self.next_table_create(root, virt.pml4_index(), virt)?;
        let pdpt = self.node_mut(pdpt_frame);
        let pd_frame = self.next_table_create(pdpt, virt.pdpt_index(), virt)?;
        let pd = self.node_mut(pd_frame);
        let pt_frame = self.next_table_create(pd, virt.pd_index(), virt)?;
        Ok(self.node_mut(pt_frame))
    }

    /// Read-only walk; never allocates.
    fn resolve(&self, virt: VirtualAddress) -> Resolved<'m> {
        let root = self.node_mut(self.active.root());
        let e4 = root.get(virt.pml4_index());
        if !e4.is_table() {
            return Resolved::Missing;
        }
        let pdpt = self.node_mut(e4.frame());
        let e3 = pdpt.get(virt.pdpt_index());
        if !e3.is_table() {
            // 1 GiB leaves are never produced by this manager
            return Resolved::Missing;
        }
        let pd = self.node_mut(e3.frame());
        let e2 = pd.get(virt.pd_index());
        if e2.present() && e2.large_page() {
            return Resolved::Large {
                pd,
                index: virt.pd_index(),
            };
        }
        if !e2.present() {
            return Resolved::Missing;
        }
        Resolved::Leaf {
            pt: self.node_mut(e2.frame()),
            index: virt.pt_index(),
        }
    }

    /// Frees one PDPT subtree: subordinate PDs and PTs, then the node.
    fn free_directory_pointer(&mut self, node: PhysicalAddress) {
        let pdpt = self.node_mut(node);
        for (_, e3) in pdpt.iter() {
            if e3.is_table() {
                self.free_directory(e3.frame());
            }
        }
        self.frames.free_frame(node);
    }

    /// Frees one PD subtree: subordinate PTs, then the node. PTs hold
    /// only leaves, so they free directly.
    fn free_directory(&mut self, node: PhysicalAddress) {
        let pd = self.node_mut(node);
        for (_, e2) in pd.iter() {
            if e2.is_table() {
                self.frames.free_frame(e2.frame());
            }
        }
        self.frames.free_frame(node);
    }

    fn flush_one(&mut self, virt: VirtualAddress) {
        self.tlb.flush_page(virt.page_base());
        self.stats.tlb_flushes += 1;
    }
}

/// Explicitly initialized process-wide holder for the one [`Vmm`], for the
/// interrupt glue that cannot thread a borrow through the fault vector.
pub struct VmmCell<M, A, T>
where
    M: PhysMapper + 'static,
    A: FrameSource,
    T: TlbMaintenance,
{
    inner: SpinLock<Option<Vmm<'static, M, A, T>>>,
}

impl<M, A, T> VmmCell<M, A, T>
where
    M: PhysMapper + 'static,
    A: FrameSource,
    T: TlbMaintenance,
{
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Installs the manager; returns `false` if one is already installed.
    pub fn init(&self, vmm: Vmm<'static, M, A, T>) -> bool {
        self.inner.with_lock(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(vmm);
            true
        })
    }

    /// Runs `f` against the manager; `None` before [`init`](Self::init).
    pub fn with<R>(&self, f: impl FnOnce(&mut Vmm<'static, M, A, T>) -> R) -> Option<R> {
        self.inner.with_lock(|slot| slot.as_mut().map(f))
    }
}

impl<M, A, T> Default for VmmCell<M, A, T>
where
    M: PhysMapper + 'static,
    A: FrameSource,
    T: TlbMaintenance,
{
    fn default() -> Self {
        Self::new()
    }
}
