use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3 with PCID disabled: the physical frame of the active L4 table plus
/// the cache-control bits used for the walk of that table.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    #[bits(3)]
    _reserved0: u8,
    /// Bit 3: PWT: write-through for L4 accesses.
    pub pwt: bool,
    /// Bit 4: PCD: cache disable for L4 accesses.
    pub pcd: bool,
    #[bits(7)]
    _reserved1: u8,
    /// Bits 12..=51: L4 physical base >> 12.
    #[bits(40)]
    root_frame: u64,
    #[bits(12)]
    _reserved2: u16,
}

impl Cr3 {
    /// A CR3 value selecting `root` with write-back caching.
    #[must_use]
    pub const fn from_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_root_frame(root.base().as_u64() >> 12)
    }

    /// The L4 table frame this register selects.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::containing(PhysicalAddress::new(self.root_frame() << 12))
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
