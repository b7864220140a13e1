//! # Soft MMU
//!
//! Host-side doubles for the two hardware seams:
//!
//! - [`SoftPhysMemory`] holds page tables keyed by their physical frame, so
//!   walks run against ordinary heap memory. Other frames hold plain bytes
//!   and read as zero until written.
//! - [`SoftCpu`] models `CR0.PG`, `CR4.PAE`, `CR3` and a TLB that caches
//!   translations until they are invalidated. Tests use it to observe that
//!   every change to an active mapping is followed by an `invlpg`.

use crate::address_space::translate;
use crate::entry::{PageEntryBits, PageTableEntry};
use crate::table::{L2Index, L3Index, L4Index, PageTable};
use crate::{PagingControl, PhysMapper};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::cell::{Cell, RefCell};
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage,
};
use kernel_memory_error::MemoryError;

const FRAME_BYTES: usize = 4096;

/// Page tables living in host memory, addressed by simulated physical frames.
#[derive(Default)]
pub struct SoftPhysMemory {
    tables: BTreeMap<u64, Box<PageTable>>,
    data: BTreeMap<u64, Box<[u8; FRAME_BYTES]>>,
}

impl SoftPhysMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty root at `root_base` linked to an L3 table (`L4[0]`) and an L2
    /// table (`L3[0]`) in the two following frames, like the boot tables.
    ///
    /// # Panics
    /// If `root_base` is not 4 KiB aligned.
    #[must_use]
    pub fn with_boot_tables(root_base: u64) -> (Self, PhysicalPage<Size4K>) {
        let page = |pa: u64| {
            PhysicalPage::<Size4K>::from_aligned(PhysicalAddress::new(pa))
                .unwrap_or_else(|| panic!("{pa:#x} is not a frame base"))
        };
        let (root, l3, l2) = (page(root_base), page(root_base + 0x1000), page(root_base + 0x2000));

        let mut phys = Self::new();
        phys.install(root);
        phys.install(l3);
        phys.install(l2);
        phys.link(root, L4Index::of(VirtualAddress::zero()).as_usize(), l3);
        phys.link(l3, L3Index::of(VirtualAddress::zero()).as_usize(), l2);
        (phys, root)
    }

    /// Places a zeroed table at `frame`, replacing any previous one.
    pub fn install(&mut self, frame: PhysicalPage<Size4K>) -> &mut PageTable {
        self.tables.insert(frame.base().as_u64(), Box::new(PageTable::zeroed()));
        self.table_slot(frame)
    }

    fn table_slot(&mut self, frame: PhysicalPage<Size4K>) -> &mut PageTable {
        self.tables
            .get_mut(&frame.base().as_u64())
            .map(Box::as_mut)
            .unwrap_or_else(|| panic!("no table at {frame}"))
    }

    /// Writes a table link into `parent[slot]`.
    ///
    /// # Panics
    /// If `parent` is not installed or `slot` is not below 512.
    pub fn link(&mut self, parent: PhysicalPage<Size4K>, slot: usize, child: PhysicalPage<Size4K>) {
        let index = u16::try_from(slot)
            .ok()
            .and_then(L4Index::new)
            .unwrap_or_else(|| panic!("slot {slot} out of range"));
        self.table_slot(parent)
            .set(index, PageTableEntry::table(child, PageEntryBits::table_link()));
    }

    /// Creates whatever tables are missing between `root` and the L1 table
    /// covering `va`, taking frames upward from `next_free`.
    ///
    /// # Errors
    /// [`MemoryError::TableLevelMissing`] if the path crosses a huge leaf.
    pub fn install_path(
        &mut self,
        root: PhysicalPage<Size4K>,
        va: VirtualAddress,
        mut next_free: u64,
    ) -> Result<(), MemoryError> {
        let slots = [
            L4Index::of(va).as_usize(),
            L3Index::of(va).as_usize(),
            L2Index::of(va).as_usize(),
        ];
        let mut table = root;
        for slot in slots {
            let index = u16::try_from(slot)
                .ok()
                .and_then(L4Index::new)
                .ok_or(MemoryError::InvalidArgument)?;
            let entry = self.table(table).ok_or(MemoryError::OutOfRange)?.get(index);
            table = if let Some(next) = entry.next_table() {
                next
            } else if entry.is_present() {
                return Err(MemoryError::TableLevelMissing);
            } else {
                let frame = PhysicalPage::from_aligned(PhysicalAddress::new(next_free))
                    .ok_or(MemoryError::InvalidArgument)?;
                next_free += 0x1000;
                self.install(frame);
                self.link(table, slot, frame);
                frame
            };
        }
        Ok(())
    }

    /// Stores `bytes` at `offset` within the data frame `frame`.
    ///
    /// # Panics
    /// If `frame` holds a page table or the bytes run past the frame end.
    pub fn write_frame(&mut self, frame: PhysicalPage<Size4K>, offset: usize, bytes: &[u8]) {
        assert!(
            self.table(frame).is_none(),
            "{frame} holds a page table"
        );
        self.data
            .entry(frame.base().as_u64())
            .or_insert_with(|| Box::new([0; FRAME_BYTES]))[offset..offset + bytes.len()]
            .copy_from_slice(bytes);
    }

    /// Contents of the data frame `frame`; `None` if it was never written.
    #[must_use]
    pub fn frame_bytes(&self, frame: PhysicalPage<Size4K>) -> Option<&[u8; FRAME_BYTES]> {
        self.data.get(&frame.base().as_u64()).map(Box::as_ref)
    }

    /// Number of installed tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl PhysMapper for SoftPhysMemory {
    fn table(&self, frame: PhysicalPage<Size4K>) -> Option<&PageTable> {
        self.tables.get(&frame.base().as_u64()).map(Box::as_ref)
    }

    fn table_mut(&mut self, frame: PhysicalPage<Size4K>) -> Option<&mut PageTable> {
        self.tables.get_mut(&frame.base().as_u64()).map(Box::as_mut)
    }

    /// Table frames are not data; copying from or onto one is out of range.
    fn copy_frame(
        &mut self,
        src: PhysicalPage<Size4K>,
        dst: PhysicalPage<Size4K>,
    ) -> Result<(), MemoryError> {
        if self.table(src).is_some() || self.table(dst).is_some() {
            return Err(MemoryError::OutOfRange);
        }
        let bytes = self
            .data
            .get(&src.base().as_u64())
            .cloned()
            .unwrap_or_else(|| Box::new([0; FRAME_BYTES]));
        self.data.insert(dst.base().as_u64(), bytes);
        Ok(())
    }
}

/// A CPU with paging control bits and a translation cache.
pub struct SoftCpu {
    paging: Cell<bool>,
    pae: Cell<bool>,
    root: Cell<PhysicalPage<Size4K>>,
    tlb: RefCell<BTreeMap<u64, PhysicalPage<Size4K>>>,
    invalidations: Cell<usize>,
    root_loads: Cell<usize>,
}

impl SoftCpu {
    /// Paging and PAE off, `CR3 = root`, empty TLB.
    #[must_use]
    pub const fn new(root: PhysicalPage<Size4K>) -> Self {
        Self {
            paging: Cell::new(false),
            pae: Cell::new(false),
            root: Cell::new(root),
            tlb: RefCell::new(BTreeMap::new()),
            invalidations: Cell::new(0),
            root_loads: Cell::new(0),
        }
    }

    #[must_use]
    pub fn with_pae(self) -> Self {
        self.pae.set(true);
        self
    }

    #[must_use]
    pub fn with_paging(self) -> Self {
        self.paging.set(true);
        self
    }

    /// Number of `invlpg` executed so far.
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.get()
    }

    /// Number of `CR3` writes so far.
    #[must_use]
    pub fn root_loads(&self) -> usize {
        self.root_loads.get()
    }

    /// Whether the TLB currently holds a translation for `va`.
    #[must_use]
    pub fn cached(&self, va: VirtualAddress) -> bool {
        self.tlb.borrow().contains_key(&va.align_down::<Size4K>().as_u64())
    }

    /// A memory access at `va`: served from the TLB if cached, otherwise
    /// walked through `mapper` and cached at 4 KiB granularity.
    #[must_use]
    pub fn access<M: PhysMapper + ?Sized>(
        &self,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let key = va.align_down::<Size4K>().as_u64();
        if let Some(frame) = self.tlb.borrow().get(&key) {
            return Some(frame.join(va.offset::<Size4K>()));
        }
        let pa = translate(mapper, self.root.get(), va)?;
        self.tlb
            .borrow_mut()
            .insert(key, PhysicalPage::containing(pa));
        Some(pa)
    }
}

impl PagingControl for SoftCpu {
    fn paging_enabled(&self) -> bool {
        self.paging.get()
    }

    fn pae_enabled(&self) -> bool {
        self.pae.get()
    }

    fn enable_paging(&self) {
        self.paging.set(true);
    }

    fn root(&self) -> PhysicalPage<Size4K> {
        self.root.get()
    }

    fn load_root(&self, root: PhysicalPage<Size4K>) {
        self.root.set(root);
        self.root_loads.set(self.root_loads.get() + 1);
        self.tlb.borrow_mut().clear();
    }

    fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        self.invalidations.set(self.invalidations.get() + 1);
        self.tlb.borrow_mut().remove(&page.base().as_u64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressSpace;

    #[test]
    fn tlb_serves_stale_translations_until_invalidated() {
        let (mut phys, root) = SoftPhysMemory::with_boot_tables(0x1000);
        let va = VirtualAddress::new(0x40_0000);
        phys.install_path(root, va, 0x10_0000).unwrap();
        let cpu = SoftCpu::new(root).with_pae().with_paging();

        let frame = |pa| PhysicalPage::containing(PhysicalAddress::new(pa));
        AddressSpace::new(&mut phys, root)
            .map_4k(va.page(), frame(0x50_0000), PageEntryBits::kernel_rw())
            .unwrap();
        assert_eq!(cpu.access(&phys, va), Some(PhysicalAddress::new(0x50_0000)));
        assert!(cpu.cached(va));

        AddressSpace::new(&mut phys, root)
            .map_4k(va.page(), frame(0x60_0000), PageEntryBits::kernel_rw())
            .unwrap();
        assert_eq!(cpu.access(&phys, va), Some(PhysicalAddress::new(0x50_0000)));

        cpu.invalidate_page(va.page());
        assert_eq!(cpu.access(&phys, VirtualAddress::new(0x40_0008)), Some(PhysicalAddress::new(0x60_0008)));
        assert_eq!(cpu.invalidations(), 1);
    }

    #[test]
    fn install_path_only_fills_gaps() {
        let (mut phys, root) = SoftPhysMemory::with_boot_tables(0x1000);
        assert_eq!(phys.len(), 3);
        phys.install_path(root, VirtualAddress::new(0x40_0000), 0x10_0000)
            .unwrap();
        assert_eq!(phys.len(), 4);
        phys.install_path(root, VirtualAddress::new(0x40_1000), 0x20_0000)
            .unwrap();
        assert_eq!(phys.len(), 4);
        phys.install_path(root, VirtualAddress::new(0x0000_0080_0000_0000), 0x30_0000)
            .unwrap();
        assert_eq!(phys.len(), 7);
    }

    #[test]
    fn frame_copies_carry_bytes_but_never_touch_tables() {
        let (mut phys, root) = SoftPhysMemory::with_boot_tables(0x1000);
        let frame = |pa| PhysicalPage::containing(PhysicalAddress::new(pa));

        phys.write_frame(frame(0x50_0000), 0xFF8, b"tailbyte");
        phys.copy_frame(frame(0x50_0000), frame(0x60_0000)).unwrap();
        assert_eq!(&phys.frame_bytes(frame(0x60_0000)).unwrap()[0xFF8..], b"tailbyte");

        phys.copy_frame(frame(0x70_0000), frame(0x60_0000)).unwrap();
        assert!(phys.frame_bytes(frame(0x60_0000)).unwrap().iter().all(|&b| b == 0));

        assert_eq!(phys.copy_frame(root, frame(0x60_0000)), Err(MemoryError::OutOfRange));
        assert_eq!(phys.copy_frame(frame(0x50_0000), root), Err(MemoryError::OutOfRange));
    }

    #[test]
    fn root_load_flushes_everything() {
        let (phys, root) = SoftPhysMemory::with_boot_tables(0x1000);
        let cpu = SoftCpu::new(root);
        assert_eq!(cpu.access(&phys, VirtualAddress::new(0x1000)), None);
        cpu.load_root(root);
        assert_eq!(cpu.root_loads(), 1);
        assert!(!cpu.paging_enabled());
        cpu.enable_paging();
        assert!(cpu.paging_enabled());
    }
}
