//! # Memory Layout

use kernel_memory_addresses::{PageSize, PhysicalAddress, Size2M, Size4K, VirtualAddress};

/// Size of one physical frame managed by the frame allocator.
pub const FRAME_SIZE: u64 = Size4K::SIZE;

/// Start of the kernel heap window.
///
/// The bootstrap page tables must already map this range when the heap is
/// initialized; the heap never maps memory itself.
pub const HEAP_WINDOW_START: u64 = 0x0080_0000; // 8 MiB

/// Size of the kernel heap window.
pub const HEAP_WINDOW_SIZE: u64 = 0x0180_0000; // 24 MiB

/// Exclusive end of the kernel heap window.
pub const HEAP_WINDOW_END: u64 = HEAP_WINDOW_START + HEAP_WINDOW_SIZE;

/// Number of 2 MiB huge pages written by the low identity-map bootstrap.
pub const IDENTITY_HUGE_PAGES: usize = 16;

/// Bytes of low memory identity mapped (`va == pa`) by the pager bootstrap.
pub const IDENTITY_LOW_BYTES: u64 = IDENTITY_HUGE_PAGES as u64 * Size2M::SIZE; // 32 MiB

/// Default start of the physical frame pool (right above the identity map).
pub const FRAME_POOL_START: u64 = IDENTITY_LOW_BYTES;

/// Default size of the physical frame pool.
pub const FRAME_POOL_SIZE: u64 = 0x0600_0000; // 96 MiB

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

const _: () = {
    assert!(HEAP_WINDOW_START.is_multiple_of(FRAME_SIZE));
    assert!(HEAP_WINDOW_SIZE.is_multiple_of(FRAME_SIZE));
    assert!(HEAP_WINDOW_END <= IDENTITY_LOW_BYTES);
    assert!(IDENTITY_HUGE_PAGES <= 512);
    assert!(FRAME_POOL_START >= HEAP_WINDOW_END);
    assert!(FRAME_POOL_START.is_multiple_of(FRAME_SIZE));
};

/// Runtime view of the layout, so boot code and tests can substitute their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub heap_window_start: VirtualAddress,
    pub heap_window_size: u64,
    pub frame_pool_start: PhysicalAddress,
    pub frame_pool_size: u64,
    pub identity_huge_pages: usize,
}

impl MemoryLayout {
    /// The layout described by the constants in this module.
    pub const DEFAULT: Self = Self {
        heap_window_start: VirtualAddress::new(HEAP_WINDOW_START),
        heap_window_size: HEAP_WINDOW_SIZE,
        frame_pool_start: PhysicalAddress::new(FRAME_POOL_START),
        frame_pool_size: FRAME_POOL_SIZE,
        identity_huge_pages: IDENTITY_HUGE_PAGES,
    };

    /// Bytes covered by the identity-map bootstrap.
    #[must_use]
    pub const fn identity_span(&self) -> u64 {
        self.identity_huge_pages as u64 * Size2M::SIZE
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
