use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// CR0 in 64-bit mode.
///
/// Only the architecturally defined bits are exposed; reserved ranges are
/// private and default to zero.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr0 {
    /// Bit 0: Protection Enable (PE).
    pub pe_protection_enable: bool,
    /// Bit 1: Monitor Coprocessor (MP).
    pub mp_monitor_coprocessor: bool,
    /// Bit 2: x87 Emulation (EM).
    pub em_emulation: bool,
    /// Bit 3: Task Switched (TS).
    pub ts_task_switched: bool,
    /// Bit 4: Extension Type (ET), hardwired to 1 on modern CPUs.
    pub et_extension_type: bool,
    /// Bit 5: Numeric Error (NE).
    pub ne_numeric_error: bool,
    #[bits(10, default = 0)]
    _reserved_6_15: u16,
    /// Bit 16: Write Protect (WP): supervisor writes honour read-only pages.
    pub wp_write_protect: bool,
    #[bits(default = 0)]
    _reserved_17: bool,
    /// Bit 18: Alignment Mask (AM).
    pub am_alignment_mask: bool,
    #[bits(10, default = 0)]
    _reserved_19_28: u16,
    /// Bit 29: Not Write-through (NW).
    pub nw_not_write_through: bool,
    /// Bit 30: Cache Disable (CD).
    pub cd_cache_disable: bool,
    /// Bit 31: Paging (PG). Requires PE.
    pub pg_paging: bool,
    #[bits(32, default = 0)]
    _reserved_32_63: u32,
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr0 {
    unsafe fn load_unsafe() -> Self {
        let cr0: u64;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr0)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr0 {
    unsafe fn store_unsafe(self) {
        let cr0 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_is_bit_31() {
        let cr0 = Cr0::new().with_pg_paging(true);
        assert_eq!(cr0.into_bits(), 1 << 31);
        assert!(Cr0::from_bits(0x8000_0011).pg_paging());
        assert!(!Cr0::from_bits(0x11).pg_paging());
    }
}
