//! # Page Tables and Level Indices
//!
//! All four levels share one [`PageTable`] layout; the level is carried by
//! the index type instead, so an L2 index can never be used where the walk
//! expects an L1 slot.
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L4   |  L3   |  L2   |  L1   | offset |
//! ```

use crate::entry::PageTableEntry;
use core::fmt;
use core::marker::PhantomData;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

mod sealed {
    pub trait Sealed {}
}

/// A paging level: the bit position of its 9-bit slice of the virtual address.
pub trait TableLevel: sealed::Sealed + Copy + Ord + fmt::Debug {
    const SHIFT: u32;
    const NAME: &'static str;
}

macro_rules! level {
    ($name:ident, $shift:literal, $label:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {}

        impl sealed::Sealed for $name {}

        impl TableLevel for $name {
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $label;
        }
    };
}

level!(Level4, 39, "L4");
level!(Level3, 30, "L3");
level!(Level2, 21, "L2");
level!(Level1, 12, "L1");

/// Index into a table of level `L`; always `< 512`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableIndex<L: TableLevel> {
    index: u16,
    _level: PhantomData<L>,
}

pub type L4Index = TableIndex<Level4>;
pub type L3Index = TableIndex<Level3>;
pub type L2Index = TableIndex<Level2>;
pub type L1Index = TableIndex<Level1>;

impl<L: TableLevel> TableIndex<L> {
    /// Extracts this level's 9 bits from `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress) -> Self {
        Self {
            index: ((va.as_u64() >> L::SHIFT) & 0x1FF) as u16,
            _level: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn new(index: u16) -> Option<Self> {
        if (index as usize) < ENTRIES_PER_TABLE {
            Some(Self {
                index,
                _level: PhantomData,
            })
        } else {
            None
        }
    }

    /// Indices `0..512` in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..512u16).map(|index| Self {
            index,
            _level: PhantomData,
        })
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.index as usize
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.index as u64
    }
}

impl<L: TableLevel> fmt::Debug for TableIndex<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", L::NAME, self.index)
    }
}

impl<L: TableLevel> fmt::Display for TableIndex<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:3}]", L::NAME, self.index)
    }
}

/// One page-aligned table of 512 entries.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::EMPTY; ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get<L: TableLevel>(&self, i: TableIndex<L>) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    /// Plain store; TLB maintenance is the caller's business.
    #[inline]
    pub const fn set<L: TableLevel>(&mut self, i: TableIndex<L>, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}
