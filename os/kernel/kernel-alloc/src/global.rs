//! # Kernel Global Allocator
//!
//! [`KernelHeap`] puts a [`Heap`] over the static heap window behind an
//! interrupt-safe [`SpinLock`] and exposes it as a [`GlobalAlloc`]. The kernel
//! binary installs it:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static HEAP: KernelHeap = KernelHeap::new();
//! ```
//!
//! The heap is not initialized lazily. Until [`KernelHeap::init`] runs every
//! allocation returns null, which the `alloc` crate turns into an allocation
//! error.
//!
//! Alignments above 16 bytes go through [`Heap::allocate_aligned`];
//! `dealloc` routes them back through [`Heap::free_aligned`] using the
//! alignment of the `Layout`.

#![allow(unsafe_code)]

use crate::heap::{BLOCK_ALIGN, Heap, HeapStats};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, null_mut};
use kernel_memory_addresses::VirtualAddress;
use kernel_memory_error::MemoryError;
use kernel_sync::SpinLock;
use log::{error, info, warn};

type StaticHeap = Heap<&'static mut [u8]>;

/// The kernel's global allocator.
pub struct KernelHeap {
    inner: SpinLock<Option<StaticHeap>>,
}

impl KernelHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Formats `window` as the heap. Leading bytes up to the first 16-byte
    /// boundary are left unused. A second call is a logged no-op.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] if the window is too small.
    pub fn init(&self, window: &'static mut [u8]) -> Result<(), MemoryError> {
        let mut guard = self.inner.lock_irq();
        if let Some(heap) = guard.as_ref() {
            warn!("heap already initialized at {}", heap.base());
            return Ok(());
        }

        let skip = window.as_ptr().align_offset(BLOCK_ALIGN);
        let window = window.get_mut(skip..).ok_or(MemoryError::InvalidArgument)?;
        let base = VirtualAddress::from_ptr(window.as_ptr());
        let heap = Heap::new(base, window)?;
        info!("heap: {} bytes at {base}", heap.capacity());
        *guard = Some(heap);
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.lock_irq().is_some()
    }

    #[must_use]
    pub fn stats(&self) -> Option<HeapStats> {
        self.inner.lock_irq().as_ref().map(Heap::stats)
    }

    /// Runs `f` on the heap with interrupts masked.
    ///
    /// # Errors
    /// [`MemoryError::NotInitialized`] before [`init`](Self::init).
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut StaticHeap) -> R) -> Result<R, MemoryError> {
        self.inner
            .lock_irq()
            .as_mut()
            .map(f)
            .ok_or(MemoryError::NotInitialized)
    }

    /// Logs statistics and blocks.
    pub fn dump(&self) {
        match self.inner.lock_irq().as_ref() {
            Some(heap) => heap.dump(),
            None => info!("heap: not initialized"),
        }
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut guard = self.inner.lock_irq();
        let Some(heap) = guard.as_mut() else {
            return null_mut();
        };
        let size = layout.size().max(1);
        let block = if layout.align() <= BLOCK_ALIGN {
            heap.allocate(size)
        } else {
            heap.allocate_aligned(size, layout.align())
        };
        block
            .and_then(|va| heap.as_mut_ptr(va))
            .unwrap_or(null_mut())
    }

    /// Payloads are zeroed by the heap on every allocation.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { self.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut guard = self.inner.lock_irq();
        let Some(heap) = guard.as_mut() else {
            error!("dealloc({ptr:p}) before heap init");
            return;
        };
        if let Err(e) = heap.free_aligned(VirtualAddress::from_ptr(ptr), layout.align()) {
            error!("dealloc({ptr:p}, {layout:?}): {e}");
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= BLOCK_ALIGN {
            let mut guard = self.inner.lock_irq();
            let Some(heap) = guard.as_mut() else {
                return null_mut();
            };
            return match heap.resize(Some(VirtualAddress::from_ptr(ptr)), new_size) {
                Ok(Some(va)) => heap.as_mut_ptr(va).unwrap_or(null_mut()),
                Ok(None) | Err(_) => null_mut(),
            };
        }

        // SAFETY: `layout.align()` is a valid alignment and the caller
        // guarantees `new_size` does not overflow when rounded to it.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let moved = unsafe { self.alloc(new_layout) };
        if !moved.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, moved, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_window(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    #[test]
    fn allocations_fail_before_init() {
        let heap = KernelHeap::new();
        let layout = Layout::from_size_align(32, 8).unwrap();
        assert!(unsafe { heap.alloc(layout) }.is_null());
        assert_eq!(heap.with_heap(|h| h.capacity()), Err(MemoryError::NotInitialized));
        assert!(heap.stats().is_none());
    }

    #[test]
    fn init_is_idempotent() {
        let heap = KernelHeap::new();
        heap.init(leaked_window(0x1000)).unwrap();
        let capacity = heap.stats().unwrap().capacity;
        heap.init(leaked_window(0x8000)).unwrap();
        assert_eq!(heap.stats().unwrap().capacity, capacity);
        assert!(heap.is_initialized());
    }

    #[test]
    fn honours_layout_alignment() {
        let heap = KernelHeap::new();
        heap.init(leaked_window(0x10000)).unwrap();

        for align in [1, 8, 16, 64, 4096] {
            let layout = Layout::from_size_align(24, align).unwrap();
            let p = unsafe { heap.alloc_zeroed(layout) };
            assert!(!p.is_null());
            assert_eq!(p.addr() % align, 0);
            assert!(unsafe { core::slice::from_raw_parts(p, 24) }.iter().all(|&b| b == 0));
            unsafe { heap.dealloc(p, layout) };
        }
        let stats = heap.stats().unwrap();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn realloc_keeps_contents() {
        let heap = KernelHeap::new();
        heap.init(leaked_window(0x10000)).unwrap();

        for align in [8, 256] {
            let layout = Layout::from_size_align(16, align).unwrap();
            unsafe {
                let p = heap.alloc(layout);
                p.copy_from_nonoverlapping(b"0123456789abcdef".as_ptr(), 16);
                let q = heap.realloc(p, layout, 1000);
                assert!(!q.is_null());
                assert_eq!(q.addr() % align, 0);
                assert_eq!(core::slice::from_raw_parts(q, 16), b"0123456789abcdef");
                heap.dealloc(q, Layout::from_size_align(1000, align).unwrap());
            }
        }
        assert_eq!(heap.stats().unwrap().used, 0);
    }
}
