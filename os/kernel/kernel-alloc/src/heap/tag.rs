//! Block layout inside the heap arena.
//!
//! ```text
//! off+0   ┌──────────────────────────────┐
//!         │ tag: free | magic | size     │ 8
//! off+8   │ next free (offset / NONE)    │ 8
//! off+16  │ prev free (offset / NONE)    │ 8
//! off+24  │ reserved                     │ 8
//! off+32  ├──────────────────────────────┤ ◄── payload
//!         │            ...               │
//! end-16  ├──────────────────────────────┤
//!         │ tag (mirror of the header)   │ 8
//! end-8   │ reserved                     │ 8
//! end     └──────────────────────────────┘
//! ```

use bitfield_struct::bitfield;
use kernel_memory_error::MemoryError;

/// Bytes in front of the payload.
pub const HEADER_SIZE: usize = 32;

/// Bytes behind the payload.
pub const FOOTER_SIZE: usize = 16;

/// Per-block metadata.
pub const OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Block sizes and payload addresses are multiples of this.
pub const BLOCK_ALIGN: usize = 16;

/// Smallest block that still carries a payload.
pub const MIN_BLOCK: usize = OVERHEAD + BLOCK_ALIGN;

/// A block is split only if the remainder would be larger than this.
pub const SPLIT_SLACK: usize = HEADER_SIZE + FOOTER_SIZE + 32;

/// Free-list terminator.
pub const NONE: u64 = u64::MAX;

/// Marker stored in every tag; rejects pointers that do not designate a block.
pub const MAGIC: u16 = 0x4B4D;

pub const NEXT_OFFSET: usize = 8;
pub const PREV_OFFSET: usize = 16;
pub const RESERVED_OFFSET: usize = 24;

/// Header and footer word of a block.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct BoundaryTag {
    pub free: bool,
    #[bits(15)]
    pub magic: u16,
    /// Total block size including header and footer.
    #[bits(48)]
    pub size: u64,
}

impl BoundaryTag {
    #[must_use]
    pub const fn block(size: usize, free: bool) -> Self {
        Self::new()
            .with_free(free)
            .with_magic(MAGIC)
            .with_size(size as u64)
    }

    /// Block size in bytes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn block_len(self) -> usize {
        self.size() as usize
    }

    /// Whether this tag can describe a block at `offset` in an arena of `arena_len` bytes.
    #[must_use]
    pub const fn fits(self, offset: usize, arena_len: usize) -> bool {
        let len = self.block_len();
        self.magic() == MAGIC
            && len >= MIN_BLOCK
            && len.is_multiple_of(BLOCK_ALIGN)
            && offset <= arena_len
            && len <= arena_len - offset
    }
}

/// `align_up(n, 16)`, or `None` on overflow.
#[must_use]
pub const fn align16(n: usize) -> Option<usize> {
    match n.checked_add(BLOCK_ALIGN - 1) {
        Some(v) => Some(v & !(BLOCK_ALIGN - 1)),
        None => None,
    }
}

/// Total block size needed for a `size`-byte payload.
#[must_use]
pub const fn block_size_for(size: usize) -> Option<usize> {
    match size.checked_add(OVERHEAD) {
        Some(n) => align16(n),
        None => None,
    }
}

pub fn read_u64(arena: &[u8], offset: usize) -> Result<u64, MemoryError> {
    let end = offset.checked_add(8).ok_or(MemoryError::Corrupted(offset))?;
    let bytes: [u8; 8] = arena
        .get(offset..end)
        .and_then(|b| b.try_into().ok())
        .ok_or(MemoryError::Corrupted(offset))?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn write_u64(arena: &mut [u8], offset: usize, value: u64) -> Result<(), MemoryError> {
    let end = offset.checked_add(8).ok_or(MemoryError::Corrupted(offset))?;
    arena
        .get_mut(offset..end)
        .ok_or(MemoryError::Corrupted(offset))?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn read_tag(arena: &[u8], offset: usize) -> Result<BoundaryTag, MemoryError> {
    read_u64(arena, offset).map(BoundaryTag::from_bits)
}

/// Offsets are stored as `u64`; [`NONE`] ends the list.
pub fn read_link(arena: &[u8], offset: usize) -> Result<Option<usize>, MemoryError> {
    match read_u64(arena, offset)? {
        NONE => Ok(None),
        v => usize::try_from(v)
            .map(Some)
            .map_err(|_| MemoryError::Corrupted(offset)),
    }
}

pub fn write_link(arena: &mut [u8], offset: usize, link: Option<usize>) -> Result<(), MemoryError> {
    write_u64(arena, offset, link.map_or(NONE, |v| v as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_packs_free_magic_and_size() {
        let tag = BoundaryTag::block(0x40, true);
        assert_eq!(tag.into_bits(), (0x40 << 16) | (u64::from(MAGIC) << 1) | 1);
        assert!(tag.fits(0, 0x40));
        assert!(!tag.fits(0x10, 0x40));
        assert!(!BoundaryTag::from_bits(0).fits(0, 0x40));
    }

    #[test]
    fn block_sizes_round_to_sixteen() {
        assert_eq!(block_size_for(1), Some(64));
        assert_eq!(block_size_for(16), Some(64));
        assert_eq!(block_size_for(17), Some(80));
        assert_eq!(block_size_for(usize::MAX), None);
    }

    #[test]
    fn words_are_little_endian_and_bounds_checked() {
        let mut arena = [0u8; 16];
        write_u64(&mut arena, 8, 0x0102).unwrap();
        assert_eq!(arena[8..10], [0x02, 0x01]);
        assert_eq!(read_u64(&arena, 8), Ok(0x0102));
        assert_eq!(read_u64(&arena, 9), Err(MemoryError::Corrupted(9)));
        write_link(&mut arena, 0, None).unwrap();
        assert_eq!(read_link(&arena, 0), Ok(None));
    }
}
