//! # Typed Memory Addresses
//!
//! Strongly typed wrappers that keep physical and virtual addresses apart and
//! carry the page granularity in the type.
//!
//! - [`PhysicalAddress`] / [`VirtualAddress`]: plain `u64` newtypes.
//! - [`PhysicalPage<S>`] / [`VirtualPage<S>`]: page-aligned bases of size `S`.
//! - [`PageSize`]: sealed marker trait implemented by [`Size4K`], [`Size2M`], [`Size1G`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_0123);
//! assert_eq!(va.page::<Size4K>().base().as_u64(), 0x0040_0000);
//! assert_eq!(va.offset::<Size4K>(), 0x123);
//! assert!(!va.is_aligned::<Size2M>());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Align `x` down to a multiple of `a` (`a` must be a power of two).
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to a multiple of `a` (`a` must be a power of two).
///
/// Returns `None` if the rounded value does not fit into `u64`.
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    debug_assert!(a.is_power_of_two());
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
        assert_eq!(align_up(0x2000, 0x1000), Some(0x2000));
        assert_eq!(align_up(u64::MAX, 0x1000), None);
    }

    #[test]
    fn pages_round_down_and_join() {
        let pa = PhysicalAddress::new(0x0010_0FFF);
        let page = pa.page::<Size4K>();
        assert_eq!(page.base(), PhysicalAddress::new(0x0010_0000));
        assert_eq!(page.join(0xFFF), pa);
        assert_eq!(
            page.checked_add_pages(15).map(PhysicalPage::base),
            Some(PhysicalAddress::new(0x0010_F000))
        );
    }

    #[test]
    fn from_aligned_rejects_offsets() {
        assert!(VirtualPage::<Size4K>::from_aligned(VirtualAddress::new(0x40_0000)).is_some());
        assert!(VirtualPage::<Size4K>::from_aligned(VirtualAddress::new(0x40_0010)).is_none());
        assert!(PhysicalPage::<Size2M>::from_aligned(PhysicalAddress::new(0x20_0000)).is_some());
    }

    #[test]
    fn virtual_align_up_handles_overflow() {
        let va = VirtualAddress::new(u64::MAX - 3);
        assert!(va.align_up::<Size4K>().is_none());
        assert_eq!(
            VirtualAddress::new(0x40_0001).align_up::<Size4K>(),
            Some(VirtualAddress::new(0x40_1000))
        );
    }
}
