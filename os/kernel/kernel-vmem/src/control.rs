//! # Paging Control
//!
//! The pager never touches control registers directly; it goes through
//! [`PagingControl`] so the same walk logic runs against the real CPU and
//! against a simulated one in tests.

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualPage};

/// Per-CPU paging state: enable bit, translation root and TLB.
pub trait PagingControl {
    /// `CR0.PG`.
    fn paging_enabled(&self) -> bool;

    /// `CR4.PAE`; 4-level paging cannot be enabled without it.
    fn pae_enabled(&self) -> bool;

    /// Sets `CR0.PG`.
    fn enable_paging(&self);

    /// The active L4 table (`CR3`).
    fn root(&self) -> PhysicalPage<Size4K>;

    /// Switches to another L4 table; drops all non-global translations.
    fn load_root(&self, root: PhysicalPage<Size4K>);

    /// Drops the cached translation of one page (`invlpg`).
    fn invalidate_page(&self, page: VirtualPage<Size4K>);
}

impl<C: PagingControl + ?Sized> PagingControl for &C {
    fn paging_enabled(&self) -> bool {
        (**self).paging_enabled()
    }

    fn pae_enabled(&self) -> bool {
        (**self).pae_enabled()
    }

    fn enable_paging(&self) {
        (**self).enable_paging();
    }

    fn root(&self) -> PhysicalPage<Size4K> {
        (**self).root()
    }

    fn load_root(&self, root: PhysicalPage<Size4K>) {
        (**self).load_root(root);
    }

    fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        (**self).invalidate_page(page);
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use cpu::CpuPagingControl;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
mod cpu {
    use super::PagingControl;
    use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualPage};
    use kernel_registers::cr0::Cr0;
    use kernel_registers::cr3::Cr3;
    use kernel_registers::cr4::Cr4;
    use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe, tlb};

    /// [`PagingControl`] backed by the control registers of the executing CPU.
    pub struct CpuPagingControl {
        _private: (),
    }

    impl CpuPagingControl {
        /// # Safety
        /// All methods execute privileged instructions: the value must only
        /// be used at CPL 0.
        #[must_use]
        pub const unsafe fn new() -> Self {
            Self { _private: () }
        }
    }

    impl PagingControl for CpuPagingControl {
        fn paging_enabled(&self) -> bool {
            unsafe { Cr0::load_unsafe() }.pg_paging()
        }

        fn pae_enabled(&self) -> bool {
            unsafe { Cr4::load_unsafe() }.pae()
        }

        fn enable_paging(&self) {
            unsafe {
                let cr0 = Cr0::load_unsafe();
                cr0.with_pg_paging(true).store_unsafe();
            }
        }

        fn root(&self) -> PhysicalPage<Size4K> {
            unsafe { Cr3::load_unsafe() }.root()
        }

        fn load_root(&self, root: PhysicalPage<Size4K>) {
            unsafe { Cr3::from_root(root).store_unsafe() }
        }

        fn invalidate_page(&self, page: VirtualPage<Size4K>) {
            unsafe { tlb::invalidate_page(page) }
        }
    }
}
