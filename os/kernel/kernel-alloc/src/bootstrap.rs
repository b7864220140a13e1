//! # Memory Bring-up
//!
//! The three memory components depend on each other during boot:
//!
//! 1. The heap comes first. It only needs its window, which the boot page
//!    tables already map.
//! 2. The frame allocator draws its bitmap from the heap.
//! 3. The pager extends the low identity map over the active root.
//!
//! [`bootstrap_memory`] runs these steps in order and stops at the first
//! failure.

#![allow(unsafe_code)]

use crate::frame_alloc::{FrameStats, LockedFrameAlloc};
use crate::global::KernelHeap;
use crate::heap::HeapStats;
use crate::vmm::Vmm;
use core::fmt;
use kernel_info::memory::MemoryLayout;
use kernel_memory_error::MemoryError;
use kernel_vmem::{PagingControl, PhysMapper};
use log::info;

/// State of the memory subsystem after [`bootstrap_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    pub heap: HeapStats,
    pub frames: FrameStats,
    /// Huge entries written by the identity map (existing L1 links are kept).
    pub identity_entries: usize,
    pub paging_enabled: bool,
}

impl fmt::Display for BootReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heap [{}], frames [{}], {} identity entries, paging {}",
            self.heap,
            self.frames,
            self.identity_entries,
            if self.paging_enabled { "on" } else { "off" }
        )
    }
}

/// The heap window of `layout` as a byte slice.
///
/// # Safety
/// The window must be mapped writable at its virtual address, must not be
/// used by anything else, and this function must be called at most once.
///
/// # Errors
/// [`MemoryError::OutOfRange`] if the window does not fit the address width.
pub unsafe fn heap_window(layout: &MemoryLayout) -> Result<&'static mut [u8], MemoryError> {
    let start = usize::try_from(layout.heap_window_start.as_u64()).map_err(|_| MemoryError::OutOfRange)?;
    let len = usize::try_from(layout.heap_window_size).map_err(|_| MemoryError::OutOfRange)?;
    // SAFETY: upheld by the caller.
    Ok(unsafe { core::slice::from_raw_parts_mut(core::ptr::with_exposed_provenance_mut(start), len) })
}

/// Brings up heap, frames and identity map in that order.
///
/// # Errors
/// The first error of [`KernelHeap::init`], [`LockedFrameAlloc::init`] or
/// [`Vmm::identity_map_low`].
pub fn bootstrap_memory<M: PhysMapper, C: PagingControl>(
    heap: &KernelHeap,
    window: &'static mut [u8],
    frames: &LockedFrameAlloc,
    layout: &MemoryLayout,
    vmm: &mut Vmm<M, C>,
) -> Result<BootReport, MemoryError> {
    heap.init(window)?;
    frames.init(layout.frame_pool_start, layout.frame_pool_size)?;
    let identity_entries = vmm.identity_map_low(layout.identity_huge_pages)?;

    let report = BootReport {
        heap: heap.stats().ok_or(MemoryError::NotInitialized)?,
        frames: frames.stats(),
        identity_entries,
        paging_enabled: vmm.paging_enabled(),
    };
    info!("memory: {report}");
    Ok(report)
}
