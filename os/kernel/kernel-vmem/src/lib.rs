//! # Virtual Memory Support
//!
//! x86-64 4-level paging for the kernel's memory core: entry and table
//! types, a walker over pre-existing tables, and the seams through which the
//! walker reaches physical memory, physical frames and the CPU.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L4   |  L3   |  L2   |  L1   | Offset |
//! ```
//!
//! ```text
//!  L4  →  L3  →  L2  →  L1  →  Physical Page
//!          │      │      └───► 4 KiB leaf
//!          │      └──────────► PS=1 → 2 MiB leaf
//!          └─────────────────► PS=1 → 1 GiB leaf
//! ```
//!
//! Each table holds 512 entries of 8 bytes. A present non-leaf entry carries
//! the frame of the next table; a leaf carries the frame it maps together
//! with the permission bits ([`PageEntryBits`]).
//!
//! ## Seams
//!
//! - [`PhysMapper`]: how a table frame, or the contents of any frame, is
//!   reached from the current address space (identity map, HHDM, or
//!   simulated memory in tests).
//! - [`FrameAlloc`]: where 4 KiB frames for mapped pages come from.
//! - [`PagingControl`]: `CR0`/`CR3`/`CR4` and `invlpg`.
//!
//! The walker never allocates intermediate tables. Mapping below an absent
//! level yields [`MemoryError::TableLevelMissing`].
//!
//! With the `test-support` feature, [`testing`] provides a simulated
//! physical memory and CPU for host tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "test-support"))]
extern crate alloc;

pub mod address_space;
pub mod control;
pub mod dump;
pub mod entry;
pub mod table;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use crate::address_space::{AddressSpace, Leaf, WalkStop, lookup, translate, walk};
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use crate::control::CpuPagingControl;
pub use crate::control::PagingControl;
pub use crate::entry::{PageEntryBits, PageTableEntry};
pub use crate::table::{
    ENTRIES_PER_TABLE, L1Index, L2Index, L3Index, L4Index, PageTable, TableIndex, TableLevel,
};
pub use kernel_memory_addresses as addresses;
pub use kernel_memory_error::MemoryError;

use kernel_memory_addresses::{PhysicalPage, Size4K};

/// Source of **physical** 4 KiB frames.
///
/// Returned frames are exclusively owned by the caller until handed back
/// through [`free_4k`](Self::free_4k).
pub trait FrameAlloc {
    /// One free frame, or `None` when exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Returns a frame obtained from [`alloc_4k`](Self::alloc_4k).
    ///
    /// # Errors
    /// [`MemoryError::OutOfRange`] for foreign frames,
    /// [`MemoryError::DoubleFree`] for frames that are already free.
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) -> Result<(), MemoryError>;
}

impl<F: FrameAlloc + ?Sized> FrameAlloc for &mut F {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) -> Result<(), MemoryError> {
        (**self).free_4k(frame)
    }
}

/// Reaches page tables by their physical frame.
///
/// Typical patterns:
/// - **Early boot**: low memory is identity mapped; the frame base is the pointer.
/// - **Kernel**: a higher-half direct map adds a constant offset.
///
/// Implementations return `None` for frames they cannot reach; the walker
/// reports those as [`MemoryError::OutOfRange`].
pub trait PhysMapper {
    fn table(&self, frame: PhysicalPage<Size4K>) -> Option<&PageTable>;

    fn table_mut(&mut self, frame: PhysicalPage<Size4K>) -> Option<&mut PageTable>;

    /// Copies the 4 KiB contents of `src` over `dst`.
    ///
    /// # Errors
    /// [`MemoryError::OutOfRange`] if either frame is not reachable.
    fn copy_frame(
        &mut self,
        src: PhysicalPage<Size4K>,
        dst: PhysicalPage<Size4K>,
    ) -> Result<(), MemoryError>;
}

impl<M: PhysMapper + ?Sized> PhysMapper for &mut M {
    fn table(&self, frame: PhysicalPage<Size4K>) -> Option<&PageTable> {
        (**self).table(frame)
    }

    fn table_mut(&mut self, frame: PhysicalPage<Size4K>) -> Option<&mut PageTable> {
        (**self).table_mut(frame)
    }

    fn copy_frame(
        &mut self,
        src: PhysicalPage<Size4K>,
        dst: PhysicalPage<Size4K>,
    ) -> Result<(), MemoryError> {
        (**self).copy_frame(src, dst)
    }
}
