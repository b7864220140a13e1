//! # Page-Table Entries
//!
//! [`PageEntryBits`] is the bitfield view shared by all four levels;
//! [`PageTableEntry`] is the 64-bit slot stored in a [`PageTable`](crate::PageTable).

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size2M, Size4K};

/// The common superset of x86-64 entry bits (L4E, L3E, L2E, L1E).
///
/// | Bits  | Field                | Notes |
/// |-------|----------------------|-------|
/// | 0     | `present`            | `0x001` |
/// | 1     | `writable`           | `0x002` |
/// | 2     | `user_access`        | `0x004` |
/// | 3     | `write_through`      | `0x008` |
/// | 4     | `cache_disabled`     | `0x010` |
/// | 5     | `accessed`           | `0x020`, set by the CPU |
/// | 6     | `dirty`              | `0x040`, leaf only |
/// | 7     | `large_page`         | `0x080`, huge leaf at L3/L2 |
/// | 8     | `global_translation` | `0x100`, leaf only |
/// | 12–51 | physical frame       | |
/// | 63    | `no_execute`         | requires `EFER.NXE` |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global_translation: bool,

    /// Ignored by hardware.
    #[bits(3)]
    pub os_available_low: u8,

    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// Ignored by hardware.
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection key when `CR4.PKE` is set, otherwise ignored.
    #[bits(4)]
    pub protection_key: u8,

    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// The same bits with the frame address cleared.
    #[inline]
    #[must_use]
    pub const fn flags_only(self) -> Self {
        self.with_phys_addr_bits_51_12(0)
    }

    /// Supervisor read/write.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Supervisor read-only.
    #[inline]
    #[must_use]
    pub const fn kernel_ro() -> Self {
        Self::new().with_present(true)
    }

    /// User read/write.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::kernel_rw().with_user_access(true)
    }

    /// User read-only.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::kernel_ro().with_user_access(true)
    }

    /// Flags for a non-leaf entry that must not restrict its subtree.
    #[inline]
    #[must_use]
    pub const fn table_link() -> Self {
        Self::user_rw()
    }
}

/// One 64-bit slot of a page table.
///
/// Zero means absent. A present entry either links to the next-level table
/// or, with `large_page` set at L3/L2, maps a huge page directly.
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const EMPTY: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: PageEntryBits) -> Self {
        Self(bits.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> PageEntryBits {
        PageEntryBits::from_bits(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.bits().present()
    }

    #[inline]
    #[must_use]
    pub const fn is_huge(self) -> bool {
        self.bits().large_page()
    }

    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        self.bits().physical_address()
    }

    /// The next-level table frame, if this is a present, non-huge entry.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if self.is_present() && !self.is_huge() {
            Some(PhysicalPage::containing(self.address()))
        } else {
            None
        }
    }

    /// A link to the next-level table at `table`.
    #[inline]
    #[must_use]
    pub const fn table(table: PhysicalPage<Size4K>, flags: PageEntryBits) -> Self {
        Self::encode(table.base(), flags, false)
    }

    /// An L1 leaf: `frame | flags | present`.
    #[inline]
    #[must_use]
    pub const fn leaf_4k(frame: PhysicalPage<Size4K>, flags: PageEntryBits) -> Self {
        Self::encode(frame.base(), flags, false)
    }

    /// An L2 huge leaf: `frame | flags | present | PS`.
    #[inline]
    #[must_use]
    pub const fn huge_2m(frame: PhysicalPage<Size2M>, flags: PageEntryBits) -> Self {
        Self::encode(frame.base(), flags, true)
    }

    const fn encode(base: PhysicalAddress, flags: PageEntryBits, huge: bool) -> Self {
        let bits = flags
            .flags_only()
            .with_present(true)
            .with_large_page(huge)
            .with_physical_address(base);
        Self(bits.into_bits())
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let b = self.bits();
        write!(
            f,
            "{:#018x} P={} RW={} US={} PS={} NX={}",
            self.0,
            u8::from(b.present()),
            u8::from(b.writable()),
            u8::from(b.user_access()),
            u8::from(b.large_page()),
            u8::from(b.no_execute()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_positions_match_the_hardware() {
        assert_eq!(PageEntryBits::new().with_present(true).into_bits(), 0x1);
        assert_eq!(PageEntryBits::new().with_writable(true).into_bits(), 0x2);
        assert_eq!(PageEntryBits::new().with_user_access(true).into_bits(), 0x4);
        assert_eq!(PageEntryBits::new().with_write_through(true).into_bits(), 0x8);
        assert_eq!(PageEntryBits::new().with_cache_disabled(true).into_bits(), 0x10);
        assert_eq!(PageEntryBits::new().with_accessed(true).into_bits(), 0x20);
        assert_eq!(PageEntryBits::new().with_dirty(true).into_bits(), 0x40);
        assert_eq!(PageEntryBits::new().with_large_page(true).into_bits(), 0x80);
        assert_eq!(PageEntryBits::new().with_global_translation(true).into_bits(), 0x100);
        assert_eq!(PageEntryBits::new().with_no_execute(true).into_bits(), 1 << 63);
    }

    #[test]
    fn leaf_is_frame_or_flags_or_present() {
        let frame = PhysicalPage::<Size4K>::containing(PhysicalAddress::new(0x0050_0000));
        let e = PageTableEntry::leaf_4k(frame, PageEntryBits::new().with_writable(true));
        assert_eq!(e.raw(), 0x0050_0000 | 0x2 | 0x1);
        assert_eq!(e.address(), PhysicalAddress::new(0x0050_0000));
        assert!(!e.is_huge());
    }

    #[test]
    fn huge_entries_are_not_table_links() {
        let frame = PhysicalPage::<Size2M>::containing(PhysicalAddress::new(0x0060_0000));
        let e = PageTableEntry::huge_2m(frame, PageEntryBits::kernel_rw());
        assert_eq!(e.raw(), 0x0060_0000 | 0x80 | 0x2 | 0x1);
        assert!(e.next_table().is_none());
        assert!(PageTableEntry::EMPTY.next_table().is_none());
    }

    #[test]
    fn flags_from_a_live_entry_do_not_leak_the_old_frame() {
        let old = PhysicalPage::<Size4K>::containing(PhysicalAddress::new(0x0050_0000));
        let new = PhysicalPage::<Size4K>::containing(PhysicalAddress::new(0x0060_0000));
        let existing = PageTableEntry::leaf_4k(old, PageEntryBits::user_rw());
        let remapped = PageTableEntry::leaf_4k(new, existing.bits());
        assert_eq!(remapped.address(), new.base());
        assert!(remapped.bits().user_access());
    }
}
