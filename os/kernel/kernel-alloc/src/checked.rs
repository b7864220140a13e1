//! # Checked Heap Entry Points
//!
//! Fail-fast wrappers around [`Heap`] for kernel code that has no way to
//! recover from a bad allocation. Every call carries a [`CallSite`]. Invalid
//! use or allocation failure dumps the heap and raises a fatal fault naming
//! the site:
//!
//! | Condition                      | Fault                         |
//! |--------------------------------|-------------------------------|
//! | `size == 0`                    | [`MemoryError::InvalidArgument`] |
//! | `size` above the heap capacity | [`MemoryError::OutOfMemory`]  |
//! | no fitting block               | [`MemoryError::OutOfMemory`]  |
//! | pointer outside the window     | [`MemoryError::OutOfRange`]   |
//! | pointer not a block            | [`MemoryError::InvalidArgument`] |
//! | double free                    | [`MemoryError::DoubleFree`] (debug builds only) |
//!
//! Release builds log a double free and carry on. Freeing the zero address
//! does nothing, and reallocating it allocates.
//!
//! The macros capture `file!()`, `line!()` and `module_path!()`:
//!
//! ```rust
//! use kernel_alloc::heap::Heap;
//! use kernel_alloc::{kfree, kmalloc, krealloc};
//! use kernel_memory_addresses::VirtualAddress;
//!
//! let mut heap = Heap::new(VirtualAddress::new(0x8000_0000), vec![0u8; 4096]).unwrap();
//! let p = kmalloc!(&mut heap, 100);
//! let p = krealloc!(&mut heap, Some(p), 200).unwrap();
//! kfree!(&mut heap, p);
//! assert_eq!(heap.stats().used, 0);
//! ```

use crate::heap::Heap;
use kernel_memory_addresses::VirtualAddress;
use kernel_memory_error::{CallSite, MemoryError, fatal};
use log::{error, warn};

#[cold]
fn fault<S: AsRef<[u8]> + AsMut<[u8]>>(heap: &Heap<S>, error: MemoryError, site: CallSite) -> ! {
    error!("heap: {error} at {site}");
    heap.dump();
    fatal(error, site)
}

fn check_size<S: AsRef<[u8]> + AsMut<[u8]>>(heap: &Heap<S>, size: usize, site: CallSite) {
    if size == 0 {
        fault(heap, MemoryError::InvalidArgument, site);
    }
    if size > heap.capacity() {
        fault(heap, MemoryError::OutOfMemory, site);
    }
}

fn check_window<S: AsRef<[u8]> + AsMut<[u8]>>(heap: &Heap<S>, ptr: VirtualAddress, site: CallSite) {
    if !heap.contains(ptr) {
        fault(heap, MemoryError::OutOfRange, site);
    }
}

fn settle_free<S: AsRef<[u8]> + AsMut<[u8]>>(
    heap: &Heap<S>,
    ptr: VirtualAddress,
    result: Result<(), MemoryError>,
    site: CallSite,
) {
    match result {
        Ok(()) => {}
        Err(MemoryError::DoubleFree) if !cfg!(debug_assertions) => {
            warn!("heap: double free of {ptr} at {site}, ignored");
        }
        Err(e) => fault(heap, e, site),
    }
}

/// Allocates `size` zeroed bytes or faults.
#[must_use]
pub fn alloc_at<S: AsRef<[u8]> + AsMut<[u8]>>(
    heap: &mut Heap<S>,
    size: usize,
    site: CallSite,
) -> VirtualAddress {
    check_size(heap, size, site);
    match heap.allocate(size) {
        Ok(ptr) => ptr,
        Err(e) => fault(heap, e, site),
    }
}

/// Frees `ptr` or faults. The zero address is ignored.
pub fn free_at<S: AsRef<[u8]> + AsMut<[u8]>>(heap: &mut Heap<S>, ptr: VirtualAddress, site: CallSite) {
    if ptr.is_zero() {
        return;
    }
    check_window(heap, ptr, site);
    let result = heap.free(ptr);
    settle_free(heap, ptr, result, site);
}

/// [`Heap::resize`] that faults instead of failing.
///
/// Returns `None` only when `size == 0` released `ptr`.
#[must_use]
pub fn realloc_at<S: AsRef<[u8]> + AsMut<[u8]>>(
    heap: &mut Heap<S>,
    ptr: Option<VirtualAddress>,
    size: usize,
    site: CallSite,
) -> Option<VirtualAddress> {
    let ptr = ptr.filter(|p| !p.is_zero());
    match ptr {
        Some(ptr) if size > heap.capacity() => {
            check_window(heap, ptr, site);
            fault(heap, MemoryError::OutOfMemory, site);
        }
        Some(ptr) => check_window(heap, ptr, site),
        None => check_size(heap, size, site),
    }
    match heap.resize(ptr, size) {
        Ok(moved) => moved,
        Err(e) => fault(heap, e, site),
    }
}

/// Allocates `size` bytes aligned to `align` or faults.
#[must_use]
pub fn alloc_aligned_at<S: AsRef<[u8]> + AsMut<[u8]>>(
    heap: &mut Heap<S>,
    size: usize,
    align: usize,
    site: CallSite,
) -> VirtualAddress {
    check_size(heap, size, site);
    match heap.allocate_aligned(size, align) {
        Ok(ptr) => ptr,
        Err(e) => fault(heap, e, site),
    }
}

/// Frees a block from [`alloc_aligned_at`] or faults. The zero address is
/// ignored.
pub fn free_aligned_at<S: AsRef<[u8]> + AsMut<[u8]>>(
    heap: &mut Heap<S>,
    ptr: VirtualAddress,
    align: usize,
    site: CallSite,
) {
    if ptr.is_zero() {
        return;
    }
    check_window(heap, ptr, site);
    let result = heap.free_aligned(ptr, align);
    settle_free(heap, ptr, result, site);
}

/// [`alloc_at`] reporting the caller's location.
#[track_caller]
#[must_use]
pub fn alloc_checked<S: AsRef<[u8]> + AsMut<[u8]>>(heap: &mut Heap<S>, size: usize) -> VirtualAddress {
    alloc_at(heap, size, CallSite::caller())
}

/// [`free_at`] reporting the caller's location.
#[track_caller]
pub fn free_checked<S: AsRef<[u8]> + AsMut<[u8]>>(heap: &mut Heap<S>, ptr: VirtualAddress) {
    free_at(heap, ptr, CallSite::caller());
}

/// [`realloc_at`] reporting the caller's location.
#[track_caller]
#[must_use]
pub fn realloc_checked<S: AsRef<[u8]> + AsMut<[u8]>>(
    heap: &mut Heap<S>,
    ptr: Option<VirtualAddress>,
    size: usize,
) -> Option<VirtualAddress> {
    realloc_at(heap, ptr, size, CallSite::caller())
}

/// `kmalloc!(heap, size)`: [`alloc_at`] at the invocation site.
#[macro_export]
macro_rules! kmalloc {
    ($heap:expr, $size:expr) => {
        $crate::checked::alloc_at($heap, $size, $crate::call_site!())
    };
}

/// `kfree!(heap, ptr)`: [`free_at`] at the invocation site.
#[macro_export]
macro_rules! kfree {
    ($heap:expr, $ptr:expr) => {
        $crate::checked::free_at($heap, $ptr, $crate::call_site!())
    };
}

/// `krealloc!(heap, ptr, size)`: [`realloc_at`] at the invocation site.
#[macro_export]
macro_rules! krealloc {
    ($heap:expr, $ptr:expr, $size:expr) => {
        $crate::checked::realloc_at($heap, $ptr, $size, $crate::call_site!())
    };
}

/// `kmalloc_aligned!(heap, size, align)`: [`alloc_aligned_at`] at the invocation site.
#[macro_export]
macro_rules! kmalloc_aligned {
    ($heap:expr, $size:expr, $align:expr) => {
        $crate::checked::alloc_aligned_at($heap, $size, $align, $crate::call_site!())
    };
}

/// `kfree_aligned!(heap, ptr, align)`: [`free_aligned_at`] at the invocation site.
#[macro_export]
macro_rules! kfree_aligned {
    ($heap:expr, $ptr:expr, $align:expr) => {
        $crate::checked::free_aligned_at($heap, $ptr, $align, $crate::call_site!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap<Vec<u8>> {
        Heap::new(VirtualAddress::new(0x1_0000), vec![0u8; 2048]).unwrap()
    }

    #[test]
    fn macros_round_trip() {
        let mut heap = heap();
        let a = kmalloc!(&mut heap, 40);
        let b = kmalloc_aligned!(&mut heap, 40, 256);
        assert_eq!(b.as_u64() % 256, 0);
        let a = krealloc!(&mut heap, Some(a), 300).unwrap();
        assert!(krealloc!(&mut heap, Some(a), 0).is_none());
        kfree_aligned!(&mut heap, b, 256);
        assert_eq!(heap.stats().used, 0);
        heap.check().unwrap();
    }

    #[test]
    fn realloc_of_none_allocates() {
        let mut heap = heap();
        let p = realloc_checked(&mut heap, None, 64).unwrap();
        assert_eq!(heap.usable_size(p).unwrap(), 64);
        free_checked(&mut heap, p);
    }

    #[test]
    fn zero_address_is_not_a_block() {
        let mut heap = heap();
        let p = kmalloc!(&mut heap, 64);
        let before = heap.stats();
        kfree!(&mut heap, VirtualAddress::zero());
        kfree_aligned!(&mut heap, VirtualAddress::zero(), 256);
        assert_eq!(heap.stats(), before);

        let q = krealloc!(&mut heap, Some(VirtualAddress::zero()), 32).unwrap();
        assert_ne!(q, p);
        assert!(heap.usable_size(q).unwrap() >= 32);
    }

    #[test]
    #[should_panic(expected = "invalid argument")]
    fn zero_size_is_fatal() {
        let mut heap = heap();
        let _ = kmalloc!(&mut heap, 0);
    }

    #[test]
    #[should_panic(expected = "out of memory at")]
    fn oversized_request_is_fatal() {
        let mut heap = heap();
        let _ = alloc_checked(&mut heap, 4096);
    }

    #[test]
    #[should_panic(expected = "checked.rs")]
    fn exhaustion_reports_the_call_site() {
        let mut heap = heap();
        let _ = alloc_checked(&mut heap, 1500);
        let _ = alloc_checked(&mut heap, 1500);
    }

    #[test]
    #[should_panic(expected = "address outside the managed range")]
    fn foreign_pointer_is_fatal() {
        let mut heap = heap();
        kfree!(&mut heap, VirtualAddress::new(0x2_0000));
    }

    #[test]
    #[should_panic(expected = "kernel_alloc::checked::tests")]
    fn interior_pointer_is_fatal() {
        let mut heap = heap();
        let p = kmalloc!(&mut heap, 64);
        kfree!(&mut heap, VirtualAddress::new(p.as_u64() + 16));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "double free"))]
    fn double_free_is_fatal_in_debug_builds() {
        let mut heap = heap();
        let p = kmalloc!(&mut heap, 64);
        kfree!(&mut heap, p);
        kfree!(&mut heap, p);
        assert_eq!(heap.stats().used, 0);
    }
}
