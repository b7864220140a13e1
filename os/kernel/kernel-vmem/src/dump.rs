//! Read-only walk diagnostics.

use crate::PhysMapper;
use crate::address_space::{Leaf, WalkStop, walk};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use log::info;

/// Where a logged walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    /// A present leaf.
    Leaf(Leaf),
    /// The entry at this level (`"L4"` … `"L1"`) was absent.
    NotPresent(&'static str),
    /// The table frame at this level is not reachable through the mapper.
    Unreachable(&'static str),
}

impl From<Result<Leaf, WalkStop>> for WalkEnd {
    fn from(walked: Result<Leaf, WalkStop>) -> Self {
        match walked {
            Ok(leaf) => Self::Leaf(leaf),
            Err(WalkStop::NotPresent(level)) => Self::NotPresent(level),
            Err(WalkStop::Unreachable(level)) => Self::Unreachable(level),
        }
    }
}

/// Logs every entry on the translation path of `va` under `root`.
#[allow(clippy::must_use_candidate)]
pub fn dump_walk<M: PhysMapper + ?Sized>(
    mapper: &M,
    root: PhysicalPage<Size4K>,
    va: VirtualAddress,
) -> WalkEnd {
    info!("walk {va} from root {root}");
    let end = WalkEnd::from(walk(mapper, root, va, |index, entry| {
        info!("{index}={entry:?}");
    }));
    match end {
        WalkEnd::Leaf(leaf) => info!("-- {} KiB leaf -> {}", leaf.size() >> 10, leaf.translate(va)),
        WalkEnd::NotPresent(level) => info!("-- not present at {level}"),
        WalkEnd::Unreachable(level) => info!("-- {level} table not reachable"),
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::PageEntryBits;
    use crate::testing::SoftPhysMemory;
    use crate::{AddressSpace, lookup};
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn walk_reports_where_it_stops() {
        let (mut phys, root) = SoftPhysMemory::with_boot_tables(0x1000);
        assert_eq!(
            dump_walk(&phys, root, VirtualAddress::new(0x40_0000)),
            WalkEnd::NotPresent("L2")
        );
        assert_eq!(
            dump_walk(&phys, root, VirtualAddress::new(0x0000_0080_0000_0000)),
            WalkEnd::NotPresent("L4")
        );

        AddressSpace::new(&mut phys, root)
            .identity_map_low(1, PageEntryBits::kernel_rw())
            .unwrap();
        let end = dump_walk(&phys, root, VirtualAddress::new(0x1234));
        let WalkEnd::Leaf(leaf) = end else {
            panic!("expected a leaf, got {end:?}")
        };
        assert_eq!(leaf.translate(VirtualAddress::new(0x1234)), PhysicalAddress::new(0x1234));
    }

    #[test]
    fn logged_walk_agrees_with_lookup() {
        let (mut phys, root) = SoftPhysMemory::with_boot_tables(0x1000);
        phys.install_path(root, VirtualAddress::new(0x40_0000), 0x10_0000)
            .unwrap();
        let mut space = AddressSpace::new(&mut phys, root);
        space.identity_map_low(1, PageEntryBits::kernel_rw()).unwrap();
        space
            .map_4k(
                VirtualAddress::new(0x40_1000).page(),
                PhysicalAddress::new(0x70_0000).page(),
                PageEntryBits::user_ro(),
            )
            .unwrap();

        for va in [0x1234, 0x40_1008, 0x40_2000, 0x60_0000, 0x0000_0080_0000_0000] {
            let va = VirtualAddress::new(va);
            match (dump_walk(&phys, root, va), lookup(&phys, root, va)) {
                (WalkEnd::Leaf(logged), Some(found)) => assert_eq!(logged, found),
                (WalkEnd::NotPresent(_) | WalkEnd::Unreachable(_), None) => {}
                (end, leaf) => panic!("{va}: walk ended at {end:?}, lookup gave {leaf:?}"),
            }
        }
    }

    #[test]
    fn unreachable_root_is_reported() {
        let phys = SoftPhysMemory::new();
        let root = PhysicalAddress::new(0x9000).page();
        assert_eq!(
            dump_walk(&phys, root, VirtualAddress::zero()),
            WalkEnd::Unreachable("L4")
        );
    }
}
