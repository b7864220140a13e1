//! # Pager
//!
//! [`Vmm`] owns the way to page tables ([`PhysMapper`]) and the paging
//! controls of the CPU ([`PagingControl`]). It edits translation trees
//! through [`AddressSpace`] and keeps the TLB coherent: every change to the
//! active tree is followed by an invalidation of that page.
//!
//! Page tables are never allocated here. A mapping whose L3, L2 or L1 table
//! does not exist yet fails with [`MemoryError::TableLevelMissing`].
//!
//! The `*_in` variants work on an explicit root, e.g. to populate a process
//! address space before it is loaded; the plain variants use the active root.
//! [`Vmm::copy_user_region_in`] gives a new address space private copies of
//! another one's user pages, as needed for `fork`.
//!
//! # Example
//! ```rust
//! use kernel_alloc::vmm::Vmm;
//! use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//! use kernel_vmem::PageEntryBits;
//! use kernel_vmem::testing::{SoftCpu, SoftPhysMemory};
//!
//! let (mut phys, root) = SoftPhysMemory::with_boot_tables(0x1000);
//! phys.install_path(root, VirtualAddress::new(0x40_0000), 0x10_0000).unwrap();
//! let mut vmm = Vmm::new(phys, SoftCpu::new(root).with_pae());
//!
//! vmm.map_page(
//!     VirtualAddress::new(0x40_0000),
//!     PhysicalAddress::new(0x50_0000),
//!     PageEntryBits::kernel_rw(),
//! ).unwrap();
//! assert_eq!(
//!     vmm.query(VirtualAddress::new(0x40_0010)),
//!     Some(PhysicalAddress::new(0x50_0010))
//! );
//! ```

use kernel_info::memory::IDENTITY_HUGE_PAGES;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_memory_error::{MemoryError, OrAbort};
use kernel_vmem::dump::{WalkEnd, dump_walk};
use kernel_vmem::{AddressSpace, FrameAlloc, Leaf, PageEntryBits, PagingControl, PhysMapper, lookup, translate};
use log::{debug, info, warn};

/// The kernel pager.
pub struct Vmm<M, C> {
    mapper: M,
    cpu: C,
}

impl<M: PhysMapper, C: PagingControl> Vmm<M, C> {
    #[must_use]
    pub const fn new(mapper: M, cpu: C) -> Self {
        Self { mapper, cpu }
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn cpu(&self) -> &C {
        &self.cpu
    }

    #[must_use]
    pub fn into_parts(self) -> (M, C) {
        (self.mapper, self.cpu)
    }

    /// The active L4 table.
    #[must_use]
    pub fn current_root(&self) -> PhysicalPage<Size4K> {
        self.cpu.root()
    }

    /// Switches the active translation tree.
    ///
    /// # Safety
    /// `root` must be a complete translation tree that maps the executing
    /// code, its stack and all data in use at their current addresses.
    pub unsafe fn load_root(&mut self, root: PhysicalPage<Size4K>) {
        debug!("pager: loading root {root}");
        self.cpu.load_root(root);
    }

    #[must_use]
    pub fn paging_enabled(&self) -> bool {
        self.cpu.paging_enabled()
    }

    /// Turns on paging with the current root.
    ///
    /// # Safety
    /// As [`load_root`](Self::load_root), for the current root.
    pub unsafe fn enable_paging(&mut self) {
        self.cpu.enable_paging();
    }

    /// Identity maps the low `huge_pages` × 2 MiB of the active tree with
    /// supervisor read/write huge pages. The root is not reloaded.
    ///
    /// # Errors
    /// See [`AddressSpace::identity_map_low`].
    pub fn identity_map_low(&mut self, huge_pages: usize) -> Result<usize, MemoryError> {
        let root = self.current_root();
        let written = AddressSpace::new(&mut self.mapper, root)
            .identity_map_low(huge_pages, PageEntryBits::kernel_rw())?;
        info!("pager: identity mapped {written} of {huge_pages} huge pages");
        Ok(written)
    }

    /// Extends the identity map over the low memory span and enables paging
    /// if it is still off.
    ///
    /// # Errors
    /// - [`MemoryError::PagingUnavailable`] if PAE is disabled.
    /// - Those of [`identity_map_low`](Self::identity_map_low).
    pub fn setup_and_enable_paging(&mut self) -> Result<(), MemoryError> {
        if !self.cpu.pae_enabled() {
            warn!("pager: CR4.PAE is clear; 4-level paging unavailable");
            return Err(MemoryError::PagingUnavailable);
        }
        self.identity_map_low(IDENTITY_HUGE_PAGES)?;
        if !self.cpu.paging_enabled() {
            self.cpu.enable_paging();
            info!("pager: paging enabled with root {}", self.current_root());
        }
        Ok(())
    }

    /// Maps the 4 KiB page at `va` to the frame at `pa` in the active tree.
    ///
    /// # Errors
    /// See [`map_page_in`](Self::map_page_in).
    pub fn map_page(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        let root = self.current_root();
        self.map_page_in(root, va, pa, flags)
    }

    /// Writes `pa | flags | present` into the L1 entry of `va` under `root`.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] if `va` or `pa` is not 4 KiB aligned.
    /// - [`MemoryError::TableLevelMissing`] if an intermediate table is
    ///   absent or huge.
    pub fn map_page_in(
        &mut self,
        root: PhysicalPage<Size4K>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        let page = VirtualPage::from_aligned(va).ok_or(MemoryError::InvalidArgument)?;
        let frame = PhysicalPage::from_aligned(pa).ok_or(MemoryError::InvalidArgument)?;
        AddressSpace::new(&mut self.mapper, root).map_4k(page, frame, flags)?;
        self.invalidate_if_active(root, page);
        Ok(())
    }

    /// Removes the 4 KiB mapping of `va` from the active tree and returns the
    /// frame it pointed to.
    ///
    /// # Errors
    /// See [`unmap_page_in`](Self::unmap_page_in).
    pub fn unmap_page(
        &mut self,
        va: VirtualAddress,
    ) -> Result<Option<PhysicalPage<Size4K>>, MemoryError> {
        let root = self.current_root();
        self.unmap_page_in(root, va)
    }

    /// Zeroes the L1 entry of the page containing `va` under `root`.
    ///
    /// # Errors
    /// [`MemoryError::TableLevelMissing`] if an intermediate table is absent or huge.
    pub fn unmap_page_in(
        &mut self,
        root: PhysicalPage<Size4K>,
        va: VirtualAddress,
    ) -> Result<Option<PhysicalPage<Size4K>>, MemoryError> {
        let page = va.page::<Size4K>();
        let old = AddressSpace::new(&mut self.mapper, root).unmap_4k(page)?;
        self.invalidate_if_active(root, page);
        Ok(old)
    }

    /// Translates `va` in the active tree, following huge leaves.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        translate(&self.mapper, self.current_root(), va)
    }

    #[must_use]
    pub fn query_in(&self, root: PhysicalPage<Size4K>, va: VirtualAddress) -> Option<PhysicalAddress> {
        translate(&self.mapper, root, va)
    }

    /// Flags of the leaf translating `va` in the active tree; `None` if unmapped.
    #[must_use]
    pub fn leaf_flags(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        self.leaf_flags_in(self.current_root(), va)
    }

    #[must_use]
    pub fn leaf_flags_in(&self, root: PhysicalPage<Size4K>, va: VirtualAddress) -> Option<PageEntryBits> {
        lookup(&self.mapper, root, va).map(Leaf::flags)
    }

    /// [`map_page`](Self::map_page) with the user bit added to `flags`.
    ///
    /// # Errors
    /// As [`map_page`](Self::map_page).
    pub fn map_user_page(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        self.map_page(va, pa, flags.with_user_access(true))
    }

    /// Backs `[va, va + size)` in the active tree with fresh frames.
    ///
    /// # Errors
    /// See [`map_user_region_in`](Self::map_user_region_in).
    pub fn map_user_region<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        va: VirtualAddress,
        size: u64,
        flags: PageEntryBits,
    ) -> Result<usize, MemoryError> {
        let root = self.current_root();
        self.map_user_region_in(root, frames, va, size, flags)
    }

    /// Backs every 4 KiB page overlapping `[va, va + size)` under `root`
    /// with one frame from `frames`, mapped with `flags` plus the user bit.
    /// Returns the number of pages mapped.
    ///
    /// On failure, pages already mapped by this call are unmapped and their
    /// frames returned before the error is reported.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] if the range wraps the address space.
    /// - [`MemoryError::OutOfMemory`] if `frames` runs dry.
    /// - [`MemoryError::TableLevelMissing`] if a page has no L1 table.
    pub fn map_user_region_in<F: FrameAlloc>(
        &mut self,
        root: PhysicalPage<Size4K>,
        frames: &mut F,
        va: VirtualAddress,
        size: u64,
        flags: PageEntryBits,
    ) -> Result<usize, MemoryError> {
        let (first, pages) = page_span(va, size)?;
        let flags = flags.with_user_access(true);

        for i in 0..pages {
            let page = nth_page(first, i)?;
            let Some(frame) = frames.alloc_4k() else {
                warn!("pager: out of frames after {i} of {pages} pages at {va}");
                self.roll_back(root, frames, first, i);
                return Err(MemoryError::OutOfMemory);
            };
            if let Err(e) = self.map_page_in(root, page.base(), frame.base(), flags) {
                warn!("pager: mapping {page} failed: {e}");
                if let Err(free) = frames.free_4k(frame) {
                    warn!("pager: could not return frame {frame}: {free}");
                }
                self.roll_back(root, frames, first, i);
                return Err(e);
            }
        }
        debug!("pager: {pages} user pages at {va}");
        Ok(pages)
    }

    /// [`map_user_region`](Self::map_user_region) that treats every failure
    /// as fatal, reporting the caller's location.
    #[track_caller]
    pub fn map_user_region_or_abort<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        va: VirtualAddress,
        size: u64,
        flags: PageEntryBits,
    ) -> usize {
        self.map_user_region(frames, va, size, flags).unwrap_or_abort()
    }

    /// Unmaps every 4 KiB page overlapping `[va, va + size)` in the active
    /// tree and returns the frames they pointed to. Returns the number of
    /// frames released.
    ///
    /// # Errors
    /// - [`MemoryError::TableLevelMissing`] if a page has no L1 table.
    /// - Errors of [`FrameAlloc::free_4k`] for foreign or already free frames.
    pub fn release_user_region<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        va: VirtualAddress,
        size: u64,
    ) -> Result<usize, MemoryError> {
        let root = self.current_root();
        let (first, pages) = page_span(va, size)?;
        let mut released = 0;
        for i in 0..pages {
            if let Some(frame) = self.unmap_page_in(root, nth_page(first, i)?.base())? {
                frames.free_4k(frame)?;
                released += 1;
            }
        }
        Ok(released)
    }

    /// Copies the user pages of `[va, va + size)` from the active tree into
    /// `child`.
    ///
    /// # Errors
    /// See [`copy_user_region_in`](Self::copy_user_region_in).
    pub fn copy_user_region<F: FrameAlloc>(
        &mut self,
        child: PhysicalPage<Size4K>,
        frames: &mut F,
        va: VirtualAddress,
        size: u64,
    ) -> Result<usize, MemoryError> {
        let parent = self.current_root();
        self.copy_user_region_in(parent, child, frames, va, size)
    }

    /// Gives `child` private copies of the user pages `parent` maps in
    /// `[va, va + size)`.
    ///
    /// Every 4 KiB page whose leaf under `parent` is a present user page gets
    /// a fresh frame from `frames` holding a copy of its contents, mapped in
    /// `child` with the parent's flags minus `global`. Absent pages, kernel
    /// pages and huge leaves are skipped. Returns the number of pages copied.
    ///
    /// On failure, pages already copied by this call are unmapped from
    /// `child` and their frames returned before the error is reported.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] if `parent == child` or the range
    ///   wraps the address space.
    /// - [`MemoryError::OutOfMemory`] if `frames` runs dry.
    /// - [`MemoryError::TableLevelMissing`] if `child` has no L1 table for a
    ///   copied page.
    /// - [`MemoryError::OutOfRange`] if a frame is not reachable for copying.
    pub fn copy_user_region_in<F: FrameAlloc>(
        &mut self,
        parent: PhysicalPage<Size4K>,
        child: PhysicalPage<Size4K>,
        frames: &mut F,
        va: VirtualAddress,
        size: u64,
    ) -> Result<usize, MemoryError> {
        if parent == child {
            return Err(MemoryError::InvalidArgument);
        }
        let (first, pages) = page_span(va, size)?;

        let mut copied = 0;
        for i in 0..pages {
            let page = nth_page(first, i)?;
            let Some((src, flags)) = self.user_source(parent, page) else {
                continue;
            };
            let Some(dst) = frames.alloc_4k() else {
                warn!("pager: out of frames after copying {copied} pages at {va}");
                self.roll_back_copy(parent, child, frames, first, i);
                return Err(MemoryError::OutOfMemory);
            };
            let result = self
                .mapper
                .copy_frame(src, dst)
                .and_then(|()| self.map_page_in(child, page.base(), dst.base(), flags));
            if let Err(e) = result {
                warn!("pager: copying {page} into {child} failed: {e}");
                if let Err(free) = frames.free_4k(dst) {
                    warn!("pager: could not return frame {dst}: {free}");
                }
                self.roll_back_copy(parent, child, frames, first, i);
                return Err(e);
            }
            copied += 1;
        }
        debug!("pager: copied {copied} user pages at {va} from {parent} to {child}");
        Ok(copied)
    }

    /// Logs the translation path of `va` in the active tree.
    #[allow(clippy::must_use_candidate)]
    pub fn dump_walk(&self, va: VirtualAddress) -> WalkEnd {
        dump_walk(&self.mapper, self.current_root(), va)
    }

    fn invalidate_if_active(&self, root: PhysicalPage<Size4K>, page: VirtualPage<Size4K>) {
        if root == self.cpu.root() {
            self.cpu.invalidate_page(page);
        }
    }

    /// Frame and child flags of `page` if `parent` maps it as a 4 KiB user page.
    fn user_source(
        &self,
        parent: PhysicalPage<Size4K>,
        page: VirtualPage<Size4K>,
    ) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        match lookup(&self.mapper, parent, page.base())? {
            Leaf::Page4K(frame, bits) if bits.user_access() => {
                Some((frame, bits.flags_only().with_global_translation(false)))
            }
            Leaf::Page4K(..) => None,
            leaf => {
                debug!("pager: not copying {} KiB leaf at {page}", leaf.size() >> 10);
                None
            }
        }
    }

    /// Undoes the first `scanned` pages of a region copy into `child`.
    fn roll_back_copy<F: FrameAlloc>(
        &mut self,
        parent: PhysicalPage<Size4K>,
        child: PhysicalPage<Size4K>,
        frames: &mut F,
        first: VirtualPage<Size4K>,
        scanned: usize,
    ) {
        for i in 0..scanned {
            let Ok(page) = nth_page(first, i) else {
                return;
            };
            if self.user_source(parent, page).is_some() {
                self.roll_back_page(child, frames, page);
            }
        }
    }

    fn roll_back<F: FrameAlloc>(
        &mut self,
        root: PhysicalPage<Size4K>,
        frames: &mut F,
        first: VirtualPage<Size4K>,
        mapped: usize,
    ) {
        for i in 0..mapped {
            let Ok(page) = nth_page(first, i) else {
                return;
            };
            self.roll_back_page(root, frames, page);
        }
    }

    fn roll_back_page<F: FrameAlloc>(
        &mut self,
        root: PhysicalPage<Size4K>,
        frames: &mut F,
        page: VirtualPage<Size4K>,
    ) {
        match self.unmap_page_in(root, page.base()) {
            Ok(Some(frame)) => {
                if let Err(e) = frames.free_4k(frame) {
                    warn!("pager: rollback could not return {frame}: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => warn!("pager: rollback could not unmap {page}: {e}"),
        }
    }
}

/// First page and page count of the 4 KiB-aligned hull of `[va, va + size)`.
fn page_span(va: VirtualAddress, size: u64) -> Result<(VirtualPage<Size4K>, usize), MemoryError> {
    let start = va.align_down::<Size4K>();
    let end = va
        .checked_add(size)
        .and_then(VirtualAddress::align_up::<Size4K>)
        .ok_or(MemoryError::InvalidArgument)?;
    let bytes = end.offset_from(start).ok_or(MemoryError::InvalidArgument)?;
    let pages = usize::try_from(bytes / Size4K::SIZE).map_err(|_| MemoryError::InvalidArgument)?;
    Ok((start.page(), pages))
}

fn nth_page(first: VirtualPage<Size4K>, i: usize) -> Result<VirtualPage<Size4K>, MemoryError> {
    first
        .checked_add_pages(i as u64)
        .ok_or(MemoryError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::testing::{SoftCpu, SoftPhysMemory};

    #[test]
    fn page_span_covers_partial_pages() {
        let (first, pages) = page_span(VirtualAddress::new(0x40_0800), 0x1000).unwrap();
        assert_eq!(first.base().as_u64(), 0x40_0000);
        assert_eq!(pages, 2);
        assert_eq!(page_span(VirtualAddress::new(0x40_0000), 0).unwrap().1, 0);
        assert_eq!(
            page_span(VirtualAddress::new(u64::MAX - 0xFFF), 0x2000),
            Err(MemoryError::InvalidArgument)
        );
    }

    #[test]
    fn misaligned_mappings_are_rejected() {
        let (phys, root) = SoftPhysMemory::with_boot_tables(0x1000);
        let mut vmm = Vmm::new(phys, SoftCpu::new(root));
        assert_eq!(
            vmm.map_page(
                VirtualAddress::new(0x40_0010),
                PhysicalAddress::new(0x50_0000),
                PageEntryBits::kernel_rw()
            ),
            Err(MemoryError::InvalidArgument)
        );
        assert_eq!(
            vmm.map_page(
                VirtualAddress::new(0x40_0000),
                PhysicalAddress::new(0x50_0001),
                PageEntryBits::kernel_rw()
            ),
            Err(MemoryError::InvalidArgument)
        );
    }

    #[test]
    fn inactive_roots_are_not_invalidated() {
        let (mut phys, root) = SoftPhysMemory::with_boot_tables(0x1000);
        let other_root = PhysicalAddress::new(0x8000).page();
        phys.install(other_root);
        phys.install_path(other_root, VirtualAddress::new(0x40_0000), 0x20_0000)
            .unwrap();

        let mut vmm = Vmm::new(phys, SoftCpu::new(root));
        vmm.map_page_in(
            other_root,
            VirtualAddress::new(0x40_0000),
            PhysicalAddress::new(0x50_0000),
            PageEntryBits::user_rw(),
        )
        .unwrap();
        assert_eq!(vmm.cpu().invalidations(), 0);
        assert_eq!(vmm.query(VirtualAddress::new(0x40_0000)), None);
        assert_eq!(
            vmm.query_in(other_root, VirtualAddress::new(0x40_0000)),
            Some(PhysicalAddress::new(0x50_0000))
        );
        assert!(vmm
            .leaf_flags_in(other_root, VirtualAddress::new(0x40_0000))
            .is_some_and(|f| f.user_access()));
    }
}
