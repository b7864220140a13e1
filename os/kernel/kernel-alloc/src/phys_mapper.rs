//! # Offset-based `PhysMapper`
//!
//! The kernel reaches page-table frames through a fixed linear window:
//!
//! - During early boot low memory is identity mapped, so the frame base *is*
//!   the pointer (offset `0`).
//! - Once a higher-half direct map (HHDM) is in place, every physical address
//!   is visible at `HHDM_BASE + pa`.
//!
//! Both are the same mapper with a different offset. Frames at or above
//! `limit` are reported as unreachable instead of being dereferenced. The
//! same window serves page tables and the frame copies of a forked region.

use core::ptr::with_exposed_provenance_mut;
use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_memory_error::MemoryError;
use kernel_vmem::{PageTable, PhysMapper};

const FRAME_BYTES: usize = 4096;

/// [`PhysMapper`] for a linear `pa + offset` window covering `[0, limit)`.
pub struct OffsetPhysMapper {
    offset: u64,
    limit: u64,
}

impl OffsetPhysMapper {
    /// # Safety
    /// Every physical frame below `limit` must be mapped writable at
    /// `offset + pa` for as long as the mapper is used, and no other code
    /// may hold references into page tables reached through it.
    #[must_use]
    pub const unsafe fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// Mapper for the boot identity map of `[0, limit)`.
    ///
    /// # Safety
    /// As [`new`](Self::new) with `offset = 0`.
    #[must_use]
    pub const unsafe fn identity(limit: u64) -> Self {
        unsafe { Self::new(0, limit) }
    }

    /// Mapper for the higher-half direct map at [`HHDM_BASE`].
    ///
    /// # Safety
    /// As [`new`](Self::new) with `offset = HHDM_BASE`.
    #[must_use]
    pub const unsafe fn hhdm(limit: u64) -> Self {
        unsafe { Self::new(HHDM_BASE, limit) }
    }

    /// The virtual address at which `frame` is visible, if it is covered.
    #[must_use]
    pub const fn window_address(&self, frame: PhysicalPage<Size4K>) -> Option<u64> {
        let pa = frame.base().as_u64();
        if pa >= self.limit {
            return None;
        }
        self.offset.checked_add(pa)
    }

    fn frame_ptr<T>(&self, frame: PhysicalPage<Size4K>) -> Option<*mut T> {
        let va = usize::try_from(self.window_address(frame)?).ok()?;
        Some(with_exposed_provenance_mut(va))
    }
}

impl PhysMapper for OffsetPhysMapper {
    fn table(&self, frame: PhysicalPage<Size4K>) -> Option<&PageTable> {
        let ptr = self.frame_ptr::<PageTable>(frame)?;
        // SAFETY: covered frames are mapped at `ptr` (constructor contract);
        // the frame base is 4 KiB aligned as `PageTable` requires.
        unsafe { ptr.as_ref() }
    }

    fn table_mut(&mut self, frame: PhysicalPage<Size4K>) -> Option<&mut PageTable> {
        let ptr = self.frame_ptr::<PageTable>(frame)?;
        // SAFETY: as above; `&mut self` keeps the reference unique.
        unsafe { ptr.as_mut() }
    }

    fn copy_frame(
        &mut self,
        src: PhysicalPage<Size4K>,
        dst: PhysicalPage<Size4K>,
    ) -> Result<(), MemoryError> {
        let from = self.frame_ptr::<[u8; FRAME_BYTES]>(src).ok_or(MemoryError::OutOfRange)?;
        let to = self.frame_ptr::<[u8; FRAME_BYTES]>(dst).ok_or(MemoryError::OutOfRange)?;
        if src != dst {
            // SAFETY: both frames are mapped (constructor contract) and two
            // distinct frames never overlap.
            unsafe { core::ptr::copy_nonoverlapping(from, to, 1) };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn window_covers_frames_below_the_limit() {
        let mapper = unsafe { OffsetPhysMapper::hhdm(0x200_0000) };
        let frame = PhysicalAddress::new(0x1000).page();
        assert_eq!(mapper.window_address(frame), Some(HHDM_BASE + 0x1000));
        assert_eq!(
            mapper.window_address(PhysicalAddress::new(0x200_0000).page()),
            None
        );
        assert!(mapper.table(PhysicalAddress::new(0x300_0000).page()).is_none());
    }

    #[test]
    fn identity_mapper_reaches_real_tables() {
        let mut table = Box::new(PageTable::zeroed());
        let addr = core::ptr::from_mut::<PageTable>(&mut table).expose_provenance() as u64;
        let frame = PhysicalAddress::new(addr).page();

        let mut mapper = unsafe { OffsetPhysMapper::identity(u64::MAX) };
        let index = kernel_vmem::L1Index::new(3).unwrap();
        mapper
            .table_mut(frame)
            .unwrap()
            .set(index, kernel_vmem::PageTableEntry::from_raw(0x5003));
        assert_eq!(table.get(index).raw(), 0x5003);
    }

    #[test]
    fn frames_are_copied_through_the_window() {
        let frame_of = |table: &mut Box<PageTable>| {
            let addr = core::ptr::from_mut::<PageTable>(table).expose_provenance() as u64;
            PhysicalAddress::new(addr).page()
        };
        let mut src = Box::new(PageTable::zeroed());
        let mut dst = Box::new(PageTable::zeroed());
        let index = kernel_vmem::L2Index::new(511).unwrap();
        src.set(index, kernel_vmem::PageTableEntry::from_raw(0xABC0_0083));
        let (from, to) = (frame_of(&mut src), frame_of(&mut dst));

        let mut mapper = unsafe { OffsetPhysMapper::identity(u64::MAX) };
        mapper.copy_frame(from, to).unwrap();
        assert_eq!(dst.get(index).raw(), 0xABC0_0083);
        assert_eq!(mapper.copy_frame(from, from), Ok(()));

        let mut bounded = unsafe { OffsetPhysMapper::identity(0x1000) };
        assert_eq!(bounded.copy_frame(from, to), Err(MemoryError::OutOfRange));
    }
}
