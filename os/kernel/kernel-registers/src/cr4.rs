use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// CR4 (x86-64). Bits 0–22 are defined; the rest are reserved.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr4 {
    pub vme: bool,
    pub pvi: bool,
    pub tsd: bool,
    pub de: bool,
    /// Bit 4: PSE: page-size extensions.
    pub pse: bool,
    /// Bit 5: PAE: physical address extension; mandatory for 4-level paging.
    pub pae: bool,
    pub mce: bool,
    /// Bit 7: PGE: honour the global bit in leaf entries.
    pub pge: bool,
    pub pce: bool,
    pub osfxsr: bool,
    pub osxmmexcpt: bool,
    pub umip: bool,
    /// Bit 12: LA57: 5-level paging. Unsupported by the pager.
    pub la57: bool,
    pub vmxe: bool,
    pub smxe: bool,
    #[bits(1)]
    _reserved15: u8,
    pub fsgsbase: bool,
    /// Bit 17: PCIDE: process-context identifiers in CR3.
    pub pcide: bool,
    pub osxsave: bool,
    #[bits(1)]
    _reserved19: u8,
    pub smep: bool,
    pub smap: bool,
    pub pke: bool,
    #[bits(41)]
    _reserved23: u64,
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr4 {
    unsafe fn load_unsafe() -> Self {
        let cr4: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr4)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr4 {
    unsafe fn store_unsafe(self) {
        let cr4 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pae_is_bit_5() {
        assert!(Cr4::from_bits(1 << 5).pae());
        assert_eq!(Cr4::new().with_pae(true).with_pge(true).into_bits(), 0xA0);
    }
}
