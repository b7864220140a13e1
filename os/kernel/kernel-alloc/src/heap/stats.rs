use core::fmt;

/// Snapshot of heap occupancy and activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Window size in bytes.
    pub capacity: usize,
    /// Bytes in allocated blocks, metadata included.
    pub used: usize,
    /// `capacity - used`.
    pub free: usize,
    pub allocations: u64,
    pub frees: u64,
    pub forward_merges: u64,
    pub backward_merges: u64,
    /// Blocks on the free list.
    pub free_blocks: usize,
    /// Size of the largest free block, metadata included.
    pub largest_free: usize,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} bytes used, {} free in {} blocks (largest {}), {} allocs, {} frees, merges {}/{}",
            self.used,
            self.capacity,
            self.free,
            self.free_blocks,
            self.largest_free,
            self.allocations,
            self.frees,
            self.forward_merges,
            self.backward_merges,
        )
    }
}

/// One block as seen by the diagnostics iterators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Arena offset of the header.
    pub offset: usize,
    /// Total size including header and footer.
    pub size: usize,
    pub free: bool,
}
