//! Translation lookaside buffer maintenance.

use kernel_memory_addresses::{Size4K, VirtualPage};

/// Drops the cached translation for one 4 KiB page on the current CPU.
///
/// # Safety
/// Must run at CPL 0.
#[inline]
pub unsafe fn invalidate_page(page: VirtualPage<Size4K>) {
    let va = page.base().as_u64();
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
}
