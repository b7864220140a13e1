//! # Address Space
//!
//! Walks and edits one 4-level translation tree rooted at an L4 table.
//!
//! The walker only ever follows tables that already exist. Mapping a page
//! whose L3, L2 or L1 table is absent, or whose path crosses a huge leaf,
//! fails with [`MemoryError::TableLevelMissing`]; intermediate tables are
//! provided by the boot page tables.
//!
//! None of the mutating methods touch the TLB. The pager (`Vmm`) pairs every
//! change of an active mapping with an invalidation.

use crate::entry::{PageEntryBits, PageTableEntry};
use crate::PhysMapper;
use crate::table::{
    L1Index, L2Index, L3Index, L4Index, Level4, PageTable, TableIndex, TableLevel,
};
use core::fmt;
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress, VirtualPage,
};
use kernel_memory_error::MemoryError;

/// The terminal entry of a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leaf {
    Page4K(PhysicalPage<Size4K>, PageEntryBits),
    Page2M(PhysicalPage<Size2M>, PageEntryBits),
    Page1G(PhysicalPage<Size1G>, PageEntryBits),
}

impl Leaf {
    /// The physical address `va` resolves to through this leaf.
    #[must_use]
    pub const fn translate(self, va: VirtualAddress) -> PhysicalAddress {
        match self {
            Self::Page4K(frame, _) => frame.join(va.offset::<Size4K>()),
            Self::Page2M(frame, _) => frame.join(va.offset::<Size2M>()),
            Self::Page1G(frame, _) => frame.join(va.offset::<Size1G>()),
        }
    }

    /// Flags of the leaf entry, without the frame address.
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        match self {
            Self::Page4K(_, f) | Self::Page2M(_, f) | Self::Page1G(_, f) => f.flags_only(),
        }
    }

    #[must_use]
    pub const fn size(self) -> u64 {
        match self {
            Self::Page4K(..) => Size4K::SIZE,
            Self::Page2M(..) => Size2M::SIZE,
            Self::Page1G(..) => Size1G::SIZE,
        }
    }
}

/// Why a walk ended without reaching a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStop {
    /// The entry at this level (`"L4"` … `"L1"`) was absent.
    NotPresent(&'static str),
    /// The table frame at this level is not reachable through the mapper.
    Unreachable(&'static str),
}

/// Follows the translation path of `va` under `root`, handing every entry
/// read to `visit` together with its slot, and stops at the first leaf.
///
/// # Errors
/// The level at which the path ended without a leaf.
pub fn walk<M: PhysMapper + ?Sized>(
    mapper: &M,
    root: PhysicalPage<Size4K>,
    va: VirtualAddress,
    mut visit: impl FnMut(&dyn fmt::Display, PageTableEntry),
) -> Result<Leaf, WalkStop> {
    let e4 = step(mapper, root, L4Index::of(va), &mut visit)?;
    let l3 = e4.next_table().ok_or(WalkStop::NotPresent(Level4::NAME))?;

    let e3 = step(mapper, l3, L3Index::of(va), &mut visit)?;
    if e3.is_huge() {
        return Ok(Leaf::Page1G(PhysicalPage::containing(e3.address()), e3.bits()));
    }

    let e2 = step(mapper, PhysicalPage::containing(e3.address()), L2Index::of(va), &mut visit)?;
    if e2.is_huge() {
        return Ok(Leaf::Page2M(PhysicalPage::containing(e2.address()), e2.bits()));
    }

    let e1 = step(mapper, PhysicalPage::containing(e2.address()), L1Index::of(va), &mut visit)?;
    Ok(Leaf::Page4K(PhysicalPage::containing(e1.address()), e1.bits()))
}

/// Reads `table[index]`, which must be present.
fn step<M: PhysMapper + ?Sized, L: TableLevel>(
    mapper: &M,
    table: PhysicalPage<Size4K>,
    index: TableIndex<L>,
    visit: &mut impl FnMut(&dyn fmt::Display, PageTableEntry),
) -> Result<PageTableEntry, WalkStop> {
    let entry = mapper
        .table(table)
        .ok_or(WalkStop::Unreachable(L::NAME))?
        .get(index);
    visit(&index, entry);
    if entry.is_present() {
        Ok(entry)
    } else {
        Err(WalkStop::NotPresent(L::NAME))
    }
}

/// Finds the leaf translating `va` under `root`, following huge leaves.
///
/// Returns `None` if any entry on the path is absent or a table frame is not
/// reachable through `mapper`.
#[must_use]
pub fn lookup<M: PhysMapper + ?Sized>(
    mapper: &M,
    root: PhysicalPage<Size4K>,
    va: VirtualAddress,
) -> Option<Leaf> {
    walk(mapper, root, va, |_, _| {}).ok()
}

/// Translates `va` under `root` (VA → PA, including the in-page offset).
#[must_use]
pub fn translate<M: PhysMapper + ?Sized>(
    mapper: &M,
    root: PhysicalPage<Size4K>,
    va: VirtualAddress,
) -> Option<PhysicalAddress> {
    lookup(mapper, root, va).map(|leaf| leaf.translate(va))
}

/// Mutable handle to one translation tree.
pub struct AddressSpace<'m, M: PhysMapper + ?Sized> {
    root: PhysicalPage<Size4K>,
    mapper: &'m mut M,
}

impl<'m, M: PhysMapper + ?Sized> AddressSpace<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m mut M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// The L4 table frame.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    fn table_mut(&mut self, frame: PhysicalPage<Size4K>) -> Result<&mut PageTable, MemoryError> {
        self.mapper.table_mut(frame).ok_or_else(|| {
            log::warn!("page table frame {frame} is not reachable through the mapper");
            MemoryError::OutOfRange
        })
    }

    /// Follows `table[index]` to the next level, which must exist and not be huge.
    fn descend<L: TableLevel>(
        &mut self,
        table: PhysicalPage<Size4K>,
        index: TableIndex<L>,
    ) -> Result<PhysicalPage<Size4K>, MemoryError> {
        let entry = self.table_mut(table)?.get(index);
        entry.next_table().ok_or_else(|| {
            log::debug!("walk stopped at {index}: {entry:?}");
            MemoryError::TableLevelMissing
        })
    }

    /// The L1 table covering `page`.
    fn l1_table(&mut self, page: VirtualPage<Size4K>) -> Result<PhysicalPage<Size4K>, MemoryError> {
        let va = page.base();
        let l3 = self.descend(self.root, L4Index::of(va))?;
        let l2 = self.descend(l3, L3Index::of(va))?;
        self.descend(l2, L2Index::of(va))
    }

    /// Writes the L1 entry for `page` as `frame | flags | present`.
    ///
    /// # Errors
    /// [`MemoryError::TableLevelMissing`] if the L3, L2 or L1 table is absent
    /// or replaced by a huge leaf.
    pub fn map_4k(
        &mut self,
        page: VirtualPage<Size4K>,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        let l1 = self.l1_table(page)?;
        self.table_mut(l1)?
            .set(L1Index::of(page.base()), PageTableEntry::leaf_4k(frame, flags));
        Ok(())
    }

    /// Zeroes the L1 entry for `page` and returns the frame it mapped, if any.
    ///
    /// # Errors
    /// [`MemoryError::TableLevelMissing`] if any table on the path is absent.
    pub fn unmap_4k(
        &mut self,
        page: VirtualPage<Size4K>,
    ) -> Result<Option<PhysicalPage<Size4K>>, MemoryError> {
        let l1 = self.l1_table(page)?;
        let index = L1Index::of(page.base());
        let table = self.table_mut(l1)?;
        let old = table.get(index);
        table.set(index, PageTableEntry::EMPTY);
        Ok(old
            .is_present()
            .then(|| PhysicalPage::containing(old.address())))
    }

    /// Identity maps the first `huge_pages` × 2 MiB of the address space with
    /// huge leaves in the table reached through `L4[0]` → `L3[0]`.
    ///
    /// Existing entries are overwritten, except those linking to an L1 table,
    /// which are left alone so finer-grained mappings survive. Returns the
    /// number of entries written.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] if `huge_pages` exceeds one table.
    /// - [`MemoryError::TableLevelMissing`] if `L4[0]` or `L3[0]` is absent.
    pub fn identity_map_low(
        &mut self,
        huge_pages: usize,
        flags: PageEntryBits,
    ) -> Result<usize, MemoryError> {
        if huge_pages > crate::table::ENTRIES_PER_TABLE {
            return Err(MemoryError::InvalidArgument);
        }

        let zero = VirtualAddress::zero();
        let l3 = self.descend(self.root, L4Index::of(zero))?;
        let l2 = self.descend(l3, L3Index::of(zero))?;
        let table = self.table_mut(l2)?;

        let mut written = 0;
        for index in L2Index::all().take(huge_pages) {
            if table.get(index).next_table().is_some() {
                log::debug!("identity map: keeping L1 table under {index}");
                continue;
            }
            let frame = PhysicalAddress::new(index.as_u64() * Size2M::SIZE).page::<Size2M>();
            table.set(index, PageTableEntry::huge_2m(frame, flags));
            written += 1;
        }
        Ok(written)
    }

    /// See [`lookup`].
    #[must_use]
    pub fn lookup(&self, va: VirtualAddress) -> Option<Leaf> {
        lookup(&*self.mapper, self.root, va)
    }

    /// See [`translate`].
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        translate(&*self.mapper, self.root, va)
    }
}
