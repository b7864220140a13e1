//! # Kernel Heap
//!
//! Boundary-tag, first-fit allocator with an explicit doubly linked free list
//! over one contiguous, already mapped window.
//!
//! The heap never dereferences raw pointers. Its metadata lives inside a
//! byte arena (`S: AsMut<[u8]>`) and blocks are addressed by arena offset;
//! callers see payload addresses as [`VirtualAddress`]es relative to the
//! window `base`. The same code runs over the kernel's static window and over
//! a `Vec<u8>` in host tests.
//!
//! ## Allocation
//! 1. `total = align16(size + 48)`.
//! 2. Walk the free list from its head; take the first block with
//!    `block.size >= total`.
//! 3. If `block.size > total + 80`, carve `total` bytes from the front and
//!    leave the remainder in the block's position on the list; otherwise hand
//!    out the whole block.
//! 4. Zero the payload.
//!
//! ## Free
//! The header sits 32 bytes before the payload. After validating its tag the
//! block is merged with a free successor (via its own size) and a free
//! predecessor (via the footer right in front of the header), and the merged
//! block is pushed to the head of the list. No two neighbouring blocks are
//! ever both free.
//!
//! Every operation returns a [`MemoryError`] instead of aborting; the
//! fail-fast policy lives in [`checked`](crate::checked).

mod stats;
mod tag;

pub use stats::{BlockInfo, HeapStats};
pub use tag::{BLOCK_ALIGN, BoundaryTag, FOOTER_SIZE, HEADER_SIZE, MIN_BLOCK, OVERHEAD, SPLIT_SLACK};

use kernel_memory_addresses::VirtualAddress;
use kernel_memory_error::MemoryError;
use log::{debug, info, warn};
use tag::{NEXT_OFFSET, PREV_OFFSET, RESERVED_OFFSET, block_size_for, read_link, read_tag, read_u64, write_link, write_u64};

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    allocations: u64,
    frees: u64,
    forward_merges: u64,
    backward_merges: u64,
}

/// A heap over the window `[base, base + storage.len())`.
pub struct Heap<S> {
    base: VirtualAddress,
    storage: S,
    len: usize,
    head: Option<usize>,
    used: usize,
    counters: Counters,
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> Heap<S> {
    /// Formats `storage` as a single free block.
    ///
    /// The window is truncated to a multiple of 16 bytes.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] if `base` is not 16-byte aligned, the
    /// window is smaller than one minimal block, or it wraps the address space.
    pub fn new(base: VirtualAddress, storage: S) -> Result<Self, MemoryError> {
        let len = storage.as_ref().len() & !(BLOCK_ALIGN - 1);
        if !base.as_u64().is_multiple_of(BLOCK_ALIGN as u64) || len < MIN_BLOCK {
            return Err(MemoryError::InvalidArgument);
        }
        base.checked_add(len as u64)
            .ok_or(MemoryError::InvalidArgument)?;

        let mut heap = Self {
            base,
            storage,
            len,
            head: None,
            used: 0,
            counters: Counters::default(),
        };
        heap.write_block(0, len, true)?;
        heap.push_front(0)?;
        debug!("heap: {len:#x} bytes at {base}");
        Ok(heap)
    }

    /// Start of the window.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Window size in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.len
    }

    /// Whether `addr` lies inside the window.
    #[must_use]
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr.offset_from(self.base)
            .is_some_and(|rel| rel < self.len as u64)
    }

    /// Gives the backing storage back.
    #[must_use]
    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Reserves `size` bytes and returns the zeroed payload address.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] if `size == 0`.
    /// - [`MemoryError::OutOfMemory`] if no free block fits.
    pub fn allocate(&mut self, size: usize) -> Result<VirtualAddress, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let total = block_size_for(size).ok_or(MemoryError::OutOfMemory)?;

        let mut cursor = self.head;
        while let Some(off) = cursor {
            let block = self.tag(off)?.block_len();
            if block >= total {
                let taken = if block > total + SPLIT_SLACK {
                    let rest = off + total;
                    self.write_block(rest, block - total, true)?;
                    self.take_position(off, rest)?;
                    total
                } else {
                    self.unlink(off)?;
                    block
                };
                self.write_block(off, taken, false)?;
                self.zero_payload(off, taken)?;
                self.used += taken;
                self.counters.allocations += 1;
                return Ok(self.address_of(off + HEADER_SIZE));
            }
            cursor = self.next_of(off)?;
        }

        debug!("heap: no free block for {size} bytes ({total} with metadata)");
        Err(MemoryError::OutOfMemory)
    }

    /// Releases the block whose payload starts at `ptr`.
    ///
    /// # Errors
    /// - [`MemoryError::OutOfRange`] if the header is outside the window.
    /// - [`MemoryError::InvalidArgument`] if `ptr` does not designate a block.
    /// - [`MemoryError::DoubleFree`] if the block is already free.
    ///
    /// No state changes on error.
    pub fn free(&mut self, ptr: VirtualAddress) -> Result<(), MemoryError> {
        let (off, tag) = self.block_at(ptr)?;
        if tag.free() {
            #[cfg(debug_assertions)]
            debug!("heap: double free of {ptr} (block +{off:#x})");
            return Err(MemoryError::DoubleFree);
        }
        self.used -= tag.block_len();
        self.counters.frees += 1;
        self.release(off, tag.block_len())
    }

    /// Changes the size of an allocation.
    ///
    /// - `None` behaves like [`allocate`](Self::allocate).
    /// - `new_size == 0` frees `ptr` and returns `None`.
    /// - Shrinking stays in place; a large enough tail becomes a free block.
    /// - Growing allocates a new block, copies the old payload and frees the
    ///   old block.
    ///
    /// # Errors
    /// Those of [`allocate`](Self::allocate) and [`free`](Self::free). On
    /// error the original allocation is untouched.
    pub fn resize(
        &mut self,
        ptr: Option<VirtualAddress>,
        new_size: usize,
    ) -> Result<Option<VirtualAddress>, MemoryError> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size).map(Some);
        };
        if new_size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        let (off, tag) = self.block_at(ptr)?;
        if tag.free() {
            return Err(MemoryError::InvalidArgument);
        }
        let block = tag.block_len();
        let total = block_size_for(new_size).ok_or(MemoryError::OutOfMemory)?;

        if total <= block {
            if block > total + SPLIT_SLACK {
                self.write_block(off, total, false)?;
                self.used -= block - total;
                self.release(off + total, block - total)?;
            }
            return Ok(Some(ptr));
        }

        let moved = self.allocate(new_size)?;
        let new_off = self.offset_of(moved)?;
        let keep = (block - OVERHEAD).min(new_size);
        let src = off + HEADER_SIZE;
        self.arena_mut()
            .copy_within(src..src + keep, new_off + HEADER_SIZE);
        self.free(ptr)?;
        Ok(Some(moved))
    }

    /// Reserves `size` bytes at an `align`-aligned address.
    ///
    /// Alignments up to 16 are served by [`allocate`](Self::allocate).
    /// Larger ones over-allocate and keep the raw payload address in the
    /// eight bytes just below the returned address; release such blocks with
    /// [`free_aligned`](Self::free_aligned) and the same `align`.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] if `align` is not a power of two,
    /// otherwise those of [`allocate`](Self::allocate).
    pub fn allocate_aligned(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        if !align.is_power_of_two() {
            return Err(MemoryError::InvalidArgument);
        }
        if align <= BLOCK_ALIGN {
            return self.allocate(size);
        }
        if size == 0 {
            return Err(MemoryError::InvalidArgument);
        }

        let padded = size
            .checked_add(align)
            .and_then(|n| n.checked_add(BLOCK_ALIGN))
            .ok_or(MemoryError::OutOfMemory)?;
        let raw = self.allocate(padded)?;
        let aligned = kernel_memory_addresses::align_up(raw.as_u64() + 8, align as u64)
            .map(VirtualAddress::new)
            .ok_or(MemoryError::OutOfMemory)?;
        let stash = self.relative(aligned)? - 8;
        write_u64(self.arena_mut(), stash, raw.as_u64())?;
        Ok(aligned)
    }

    /// Releases an allocation made by [`allocate_aligned`](Self::allocate_aligned).
    ///
    /// # Errors
    /// As [`free`](Self::free), applied to the stashed raw address.
    pub fn free_aligned(&mut self, ptr: VirtualAddress, align: usize) -> Result<(), MemoryError> {
        if align <= BLOCK_ALIGN {
            return self.free(ptr);
        }
        let stash = self
            .relative(ptr)?
            .checked_sub(8)
            .ok_or(MemoryError::OutOfRange)?;
        let raw = read_u64(self.arena(), stash).map_err(|_| MemoryError::OutOfRange)?;
        self.free(VirtualAddress::new(raw))
    }

    /// Payload capacity of the allocated block at `ptr`.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] unless `ptr` designates an allocated block.
    pub fn usable_size(&self, ptr: VirtualAddress) -> Result<usize, MemoryError> {
        match self.block_at(ptr)? {
            (_, tag) if tag.free() => Err(MemoryError::InvalidArgument),
            (_, tag) => Ok(tag.block_len() - OVERHEAD),
        }
    }

    /// The payload bytes of the allocated block at `ptr`.
    ///
    /// # Errors
    /// As [`usable_size`](Self::usable_size).
    pub fn payload(&self, ptr: VirtualAddress) -> Result<&[u8], MemoryError> {
        let size = self.usable_size(ptr)?;
        let start = self.relative(ptr)?;
        self.arena()
            .get(start..start + size)
            .ok_or(MemoryError::OutOfRange)
    }

    /// Mutable view of [`payload`](Self::payload).
    ///
    /// # Errors
    /// As [`usable_size`](Self::usable_size).
    pub fn payload_mut(&mut self, ptr: VirtualAddress) -> Result<&mut [u8], MemoryError> {
        let size = self.usable_size(ptr)?;
        let start = self.relative(ptr)?;
        self.arena_mut()
            .get_mut(start..start + size)
            .ok_or(MemoryError::OutOfRange)
    }

    /// A raw pointer to `addr` inside the backing storage.
    ///
    /// # Errors
    /// [`MemoryError::OutOfRange`] if `addr` is outside the window.
    pub fn as_mut_ptr(&mut self, addr: VirtualAddress) -> Result<*mut u8, MemoryError> {
        let rel = self.relative(addr)?;
        self.arena_mut()
            .get_mut(rel..)
            .map(<[u8]>::as_mut_ptr)
            .ok_or(MemoryError::OutOfRange)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let (free_blocks, largest_free) = self
            .free_list()
            .fold((0, 0), |(n, max), b| (n + 1, max.max(b.size)));
        HeapStats {
            capacity: self.len,
            used: self.used,
            free: self.len - self.used,
            allocations: self.counters.allocations,
            frees: self.counters.frees,
            forward_merges: self.counters.forward_merges,
            backward_merges: self.counters.backward_merges,
            free_blocks,
            largest_free,
        }
    }

    /// All blocks in address order. Stops at the first damaged tag.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut off = 0;
        core::iter::from_fn(move || {
            if off >= self.len {
                return None;
            }
            let tag = self.tag(off).ok()?;
            let info = BlockInfo {
                offset: off,
                size: tag.block_len(),
                free: tag.free(),
            };
            off += info.size;
            Some(info)
        })
    }

    /// Free-list members from the head. Stops at the first damaged link.
    pub fn free_list(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut cursor = self.head;
        let mut budget = self.len / MIN_BLOCK;
        core::iter::from_fn(move || {
            let off = cursor?;
            if budget == 0 {
                return None;
            }
            budget -= 1;
            let tag = self.tag(off).ok()?;
            cursor = self.next_of(off).ok()?;
            Some(BlockInfo {
                offset: off,
                size: tag.block_len(),
                free: tag.free(),
            })
        })
    }

    /// Verifies every structural invariant of the heap.
    ///
    /// # Errors
    /// [`MemoryError::Corrupted`] with the offset of the first violation:
    /// - header and footer differ, or blocks do not tile the window;
    /// - two neighbouring blocks are both free;
    /// - the free list holds an allocated block, has a broken back link, or
    ///   disagrees with the number of free blocks;
    /// - the used-byte counter disagrees with the blocks.
    pub fn check(&self) -> Result<(), MemoryError> {
        let mut off = 0;
        let mut previous_free = false;
        let mut free_blocks = 0;
        let mut used = 0;
        while off < self.len {
            let tag = self.tag(off)?;
            let size = tag.block_len();
            if read_tag(self.arena(), off + size - FOOTER_SIZE)? != tag {
                return Err(MemoryError::Corrupted(off));
            }
            if tag.free() {
                if previous_free {
                    return Err(MemoryError::Corrupted(off));
                }
                free_blocks += 1;
            } else {
                used += size;
            }
            previous_free = tag.free();
            off += size;
        }

        let mut listed = 0;
        let mut back = None;
        let mut cursor = self.head;
        while let Some(off) = cursor {
            if !self.tag(off)?.free() || self.prev_of(off)? != back || listed == free_blocks {
                return Err(MemoryError::Corrupted(off));
            }
            listed += 1;
            back = Some(off);
            cursor = self.next_of(off)?;
        }

        if listed != free_blocks || used != self.used {
            return Err(MemoryError::Corrupted(0));
        }
        Ok(())
    }

    /// Logs statistics and every block.
    pub fn dump(&self) {
        info!("heap {} +{:#x}: {}", self.base, self.len, self.stats());
        for block in self.blocks() {
            info!(
                "  {:#018x} {:>8} {}",
                self.base.as_u64() + block.offset as u64,
                block.size,
                if block.free { "free" } else { "used" }
            );
        }
        if let Err(e) = self.check() {
            warn!("heap: integrity check failed: {e}");
        }
    }

    fn arena(&self) -> &[u8] {
        &self.storage.as_ref()[..self.len]
    }

    fn arena_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.storage.as_mut()[..len]
    }

    fn address_of(&self, rel: usize) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + rel as u64)
    }

    /// Arena offset of `addr`.
    fn relative(&self, addr: VirtualAddress) -> Result<usize, MemoryError> {
        addr.offset_from(self.base)
            .and_then(|rel| usize::try_from(rel).ok())
            .filter(|&rel| rel < self.len)
            .ok_or(MemoryError::OutOfRange)
    }

    /// Header offset for the payload address `ptr`.
    fn offset_of(&self, ptr: VirtualAddress) -> Result<usize, MemoryError> {
        let rel = self.relative(ptr)?;
        let off = rel.checked_sub(HEADER_SIZE).ok_or(MemoryError::OutOfRange)?;
        if !rel.is_multiple_of(BLOCK_ALIGN) {
            return Err(MemoryError::InvalidArgument);
        }
        Ok(off)
    }

    /// The block designated by the payload address `ptr`, if its tags agree.
    fn block_at(&self, ptr: VirtualAddress) -> Result<(usize, BoundaryTag), MemoryError> {
        let off = self.offset_of(ptr)?;
        let tag = read_tag(self.arena(), off).map_err(|_| MemoryError::InvalidArgument)?;
        if !tag.fits(off, self.len) {
            return Err(MemoryError::InvalidArgument);
        }
        let footer = read_tag(self.arena(), off + tag.block_len() - FOOTER_SIZE)
            .map_err(|_| MemoryError::InvalidArgument)?;
        if footer != tag {
            return Err(MemoryError::InvalidArgument);
        }
        Ok((off, tag))
    }

    fn tag(&self, off: usize) -> Result<BoundaryTag, MemoryError> {
        let tag = read_tag(self.arena(), off)?;
        if tag.fits(off, self.len) {
            Ok(tag)
        } else {
            Err(MemoryError::Corrupted(off))
        }
    }

    fn write_block(&mut self, off: usize, size: usize, free: bool) -> Result<(), MemoryError> {
        let tag = BoundaryTag::block(size, free).into_bits();
        let footer = off + size - FOOTER_SIZE;
        let arena = self.arena_mut();
        write_u64(arena, off, tag)?;
        write_link(arena, off + NEXT_OFFSET, None)?;
        write_link(arena, off + PREV_OFFSET, None)?;
        write_u64(arena, off + RESERVED_OFFSET, 0)?;
        write_u64(arena, footer, tag)?;
        write_u64(arena, footer + 8, 0)
    }

    fn zero_payload(&mut self, off: usize, size: usize) -> Result<(), MemoryError> {
        self.arena_mut()
            .get_mut(off + HEADER_SIZE..off + size - FOOTER_SIZE)
            .ok_or(MemoryError::Corrupted(off))?
            .fill(0);
        Ok(())
    }

    fn next_of(&self, off: usize) -> Result<Option<usize>, MemoryError> {
        read_link(self.arena(), off + NEXT_OFFSET)
    }

    fn prev_of(&self, off: usize) -> Result<Option<usize>, MemoryError> {
        read_link(self.arena(), off + PREV_OFFSET)
    }

    fn set_next(&mut self, off: usize, next: Option<usize>) -> Result<(), MemoryError> {
        write_link(self.arena_mut(), off + NEXT_OFFSET, next)
    }

    fn set_prev(&mut self, off: usize, prev: Option<usize>) -> Result<(), MemoryError> {
        write_link(self.arena_mut(), off + PREV_OFFSET, prev)
    }

    fn push_front(&mut self, off: usize) -> Result<(), MemoryError> {
        self.set_prev(off, None)?;
        self.set_next(off, self.head)?;
        if let Some(head) = self.head {
            self.set_prev(head, Some(off))?;
        }
        self.head = Some(off);
        Ok(())
    }

    fn unlink(&mut self, off: usize) -> Result<(), MemoryError> {
        let next = self.next_of(off)?;
        let prev = self.prev_of(off)?;
        match prev {
            Some(p) => self.set_next(p, next)?,
            None => self.head = next,
        }
        if let Some(n) = next {
            self.set_prev(n, prev)?;
        }
        self.set_next(off, None)?;
        self.set_prev(off, None)
    }

    /// Puts the free block at `new` where `old` is on the list.
    fn take_position(&mut self, old: usize, new: usize) -> Result<(), MemoryError> {
        let next = self.next_of(old)?;
        let prev = self.prev_of(old)?;
        self.set_next(new, next)?;
        self.set_prev(new, prev)?;
        match prev {
            Some(p) => self.set_next(p, Some(new))?,
            None => self.head = Some(new),
        }
        if let Some(n) = next {
            self.set_prev(n, Some(new))?;
        }
        Ok(())
    }

    /// Marks `[off, off + size)` free, merges it with free neighbours and
    /// pushes the result to the list head.
    fn release(&mut self, off: usize, size: usize) -> Result<(), MemoryError> {
        let mut start = off;
        let mut size = size;

        let next = off + size;
        if next < self.len {
            let tag = self.tag(next)?;
            if tag.free() {
                self.unlink(next)?;
                size += tag.block_len();
                self.counters.forward_merges += 1;
            }
        }

        if off > 0 {
            let footer_at = off - FOOTER_SIZE;
            let footer = read_tag(self.arena(), footer_at)?;
            if footer.free() {
                let prev = off
                    .checked_sub(footer.block_len())
                    .ok_or(MemoryError::Corrupted(footer_at))?;
                if self.tag(prev)? != footer {
                    return Err(MemoryError::Corrupted(prev));
                }
                self.unlink(prev)?;
                start = prev;
                size += footer.block_len();
                self.counters.backward_merges += 1;
            }
        }

        self.write_block(start, size, true)?;
        self.push_front(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x80_0000;

    fn heap(len: usize) -> Heap<Vec<u8>> {
        Heap::new(VirtualAddress::new(BASE), vec![0xAA; len]).unwrap()
    }

    #[test]
    fn new_formats_one_free_block() {
        let heap = heap(0x1008);
        assert_eq!(heap.capacity(), 0x1000);
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(
            blocks,
            [BlockInfo {
                offset: 0,
                size: 0x1000,
                free: true
            }]
        );
        heap.check().unwrap();
    }

    #[test]
    fn new_rejects_bad_windows() {
        assert!(matches!(
            Heap::new(VirtualAddress::new(BASE + 8), vec![0; 0x100]),
            Err(MemoryError::InvalidArgument)
        ));
        assert!(matches!(
            Heap::new(VirtualAddress::new(BASE), vec![0; MIN_BLOCK - 1]),
            Err(MemoryError::InvalidArgument)
        ));
        assert!(matches!(
            Heap::new(VirtualAddress::new(u64::MAX - 0xF), vec![0; 0x100]),
            Err(MemoryError::InvalidArgument)
        ));
    }

    #[test]
    fn allocation_splits_and_zeroes() {
        let mut heap = heap(0x1000);
        let a = heap.allocate(100).unwrap();
        assert_eq!(a.as_u64(), BASE + HEADER_SIZE as u64);
        assert!(heap.payload(a).unwrap().iter().all(|&b| b == 0));
        assert_eq!(heap.usable_size(a), Ok(160 - OVERHEAD));

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], BlockInfo { offset: 0, size: 160, free: false });
        assert_eq!(blocks[1], BlockInfo { offset: 160, size: 0x1000 - 160, free: true });
        heap.check().unwrap();
    }

    #[test]
    fn small_remainders_are_not_split_off() {
        let mut heap = heap(160 + 80);
        let a = heap.allocate(100).unwrap();
        assert_eq!(heap.usable_size(a), Ok(240 - OVERHEAD));
        assert_eq!(heap.stats().free_blocks, 0);
        assert_eq!(heap.allocate(1), Err(MemoryError::OutOfMemory));
    }

    #[test]
    fn zero_size_is_invalid() {
        let mut heap = heap(0x1000);
        assert_eq!(heap.allocate(0), Err(MemoryError::InvalidArgument));
        assert_eq!(heap.stats().allocations, 0);
    }

    #[test]
    fn free_coalesces_both_ways() {
        let mut heap = heap(0x1000);
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let c = heap.allocate(64).unwrap();

        heap.free(a).unwrap();
        heap.free(c).unwrap();
        assert_eq!(heap.stats().forward_merges, 1);
        heap.free(b).unwrap();

        let stats = heap.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.largest_free, 0x1000);
        assert_eq!(stats.used, 0);
        assert_eq!(stats.backward_merges, 1);
        assert_eq!(stats.forward_merges, 2);
        heap.check().unwrap();
    }

    #[test]
    fn misuse_is_reported_without_mutation() {
        let mut heap = heap(0x1000);
        let a = heap.allocate(64).unwrap();
        let before = heap.stats();

        assert_eq!(heap.free(VirtualAddress::new(BASE - 0x100)), Err(MemoryError::OutOfRange));
        assert_eq!(heap.free(VirtualAddress::new(BASE + 0x2000)), Err(MemoryError::OutOfRange));
        assert_eq!(heap.free(VirtualAddress::new(a.as_u64() + 16)), Err(MemoryError::InvalidArgument));
        assert_eq!(heap.free(VirtualAddress::new(a.as_u64() + 4)), Err(MemoryError::InvalidArgument));
        assert_eq!(heap.stats(), before);

        heap.free(a).unwrap();
        let after = heap.stats();
        assert_eq!(heap.free(a), Err(MemoryError::DoubleFree));
        assert_eq!(heap.stats(), after);
        heap.check().unwrap();
    }

    #[test]
    fn resize_shrinks_in_place_and_grows_by_copy() {
        let mut heap = heap(0x2000);
        let a = heap.allocate(512).unwrap();
        heap.payload_mut(a).unwrap()[..4].copy_from_slice(b"kmem");

        assert_eq!(heap.resize(Some(a), 32), Ok(Some(a)));
        assert_eq!(heap.usable_size(a), Ok(block_size_for(32).unwrap() - OVERHEAD));
        heap.check().unwrap();

        let _pin = heap.allocate(16).unwrap();
        let b = heap.resize(Some(a), 1024).unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(&heap.payload(b).unwrap()[..4], b"kmem");
        assert_eq!(heap.usable_size(a), Err(MemoryError::InvalidArgument));
        heap.check().unwrap();
    }

    #[test]
    fn resize_edge_cases() {
        let mut heap = heap(0x1000);
        let a = heap.resize(None, 40).unwrap().unwrap();
        assert_eq!(heap.resize(Some(a), 0), Ok(None));
        assert_eq!(heap.stats().used, 0);

        let b = heap.allocate(64).unwrap();
        let before = heap.stats();
        assert_eq!(heap.resize(Some(b), 0x10_0000), Err(MemoryError::OutOfMemory));
        assert_eq!(heap.stats().used, before.used);
        assert!(heap.payload(b).is_ok());
    }

    #[test]
    fn aligned_allocations_round_trip() {
        let mut heap = heap(0x4000);
        let p = heap.allocate_aligned(100, 256).unwrap();
        assert!(p.as_u64().is_multiple_of(256));
        assert!(heap.contains(p));
        assert_eq!(heap.stats().allocations, 1);

        heap.free_aligned(p, 256).unwrap();
        assert_eq!(heap.stats().used, 0);
        assert_eq!(heap.allocate_aligned(8, 3), Err(MemoryError::InvalidArgument));

        let q = heap.allocate_aligned(8, 8).unwrap();
        heap.free_aligned(q, 8).unwrap();
        heap.check().unwrap();
    }

    #[test]
    fn exhaustion_then_recovery() {
        let mut heap = heap(0x800);
        let mut live = Vec::new();
        while let Ok(p) = heap.allocate(48) {
            live.push(p);
        }
        assert!(!live.is_empty());
        assert_eq!(heap.allocate(48), Err(MemoryError::OutOfMemory));
        for p in live {
            heap.free(p).unwrap();
        }
        assert_eq!(heap.stats().free_blocks, 1);
        assert!(heap.allocate(0x800 - OVERHEAD).is_ok());
    }

    #[test]
    fn check_detects_damaged_footers() {
        let mut heap = heap(0x1000);
        let a = heap.allocate(64).unwrap();
        let footer = heap.usable_size(a).unwrap() + HEADER_SIZE;
        heap.arena_mut()[footer] ^= 0xFF;
        assert_eq!(heap.check(), Err(MemoryError::Corrupted(0)));
        assert_eq!(heap.free(a), Err(MemoryError::InvalidArgument));
    }
}
