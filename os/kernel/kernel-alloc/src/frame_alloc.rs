//! # Physical Frame Allocator
//!
//! Tracks 4 KiB frames of one physical range in a bitmap, one bit per frame
//! (`1` = allocated). Allocation is a first-fit scan for the lowest clear bit,
//! so freed frames are handed out again before untouched ones above them.
//!
//! The bitmap is drawn from the global allocator at [`init`](BitmapFrameAlloc::init),
//! which makes the heap a boot-time prerequisite of this allocator.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use kernel_memory_error::MemoryError;
use kernel_sync::{IrqSpinLockGuard, SpinLock};
use kernel_vmem::FrameAlloc;
use log::{info, warn};

const FRAME_SIZE: u64 = Size4K::SIZE;
const BITS_PER_WORD: usize = u64::BITS as usize;

/// Frame counts of a [`BitmapFrameAlloc`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} frames used, {} free", self.used, self.total, self.free)
    }
}

struct Bitmap {
    start: PhysicalAddress,
    end: PhysicalAddress,
    frames: usize,
    used: usize,
    words: Box<[u64]>,
}

impl Bitmap {
    fn index_of(&self, addr: PhysicalAddress) -> Option<usize> {
        if addr.as_u64() < self.start.as_u64() || addr.as_u64() >= self.end.as_u64() {
            return None;
        }
        let offset = addr.align_down::<Size4K>().offset_from(self.start)?;
        usize::try_from(offset / FRAME_SIZE).ok()
    }

    fn is_set(&self, index: usize) -> bool {
        self.words[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    fn address_of(&self, index: usize) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + index as u64 * FRAME_SIZE)
    }
}

/// Bitmap allocator over `[start, end)`; inert until [`init`](Self::init).
#[derive(Default)]
pub struct BitmapFrameAlloc {
    state: Option<Bitmap>,
}

impl BitmapFrameAlloc {
    #[must_use]
    pub const fn new() -> Self {
        Self { state: None }
    }

    /// Manages the frames inside `[start, start + size)`.
    ///
    /// The start is aligned up and the end down to 4 KiB. A second call is a
    /// logged no-op that keeps the first range.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] if the aligned range holds no frame
    ///   or overflows.
    /// - [`MemoryError::OutOfMemory`] if the bitmap cannot be allocated.
    pub fn init(&mut self, start: PhysicalAddress, size: u64) -> Result<(), MemoryError> {
        if let Some(state) = &self.state {
            warn!(
                "frame allocator already covers {}..{}; ignoring init({start}, {size:#x})",
                state.start, state.end
            );
            return Ok(());
        }

        let end = start
            .checked_add(size)
            .ok_or(MemoryError::InvalidArgument)?
            .align_down::<Size4K>();
        let start = start
            .align_up::<Size4K>()
            .ok_or(MemoryError::InvalidArgument)?;
        let bytes = end
            .offset_from(start)
            .filter(|&b| b > 0)
            .ok_or(MemoryError::InvalidArgument)?;
        let frames = usize::try_from(bytes / FRAME_SIZE).map_err(|_| MemoryError::InvalidArgument)?;

        let len = frames.div_ceil(BITS_PER_WORD);
        let mut words = Vec::new();
        words
            .try_reserve_exact(len)
            .map_err(|_| MemoryError::OutOfMemory)?;
        words.resize(len, 0u64);

        info!("frame allocator: {frames} frames at {start}..{end}");
        self.state = Some(Bitmap {
            start,
            end,
            frames,
            used: 0,
            words: words.into_boxed_slice(),
        });
        Ok(())
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// The managed range after alignment.
    #[must_use]
    pub fn range(&self) -> Option<(PhysicalAddress, PhysicalAddress)> {
        self.state.as_ref().map(|s| (s.start, s.end))
    }

    /// The lowest free frame, now allocated; `None` when exhausted or
    /// uninitialized.
    #[must_use]
    pub fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        let state = self.state.as_mut()?;
        let (word_index, word) = state
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)?;
        let bit = (!*word).trailing_zeros() as usize;
        let index = word_index * BITS_PER_WORD + bit;
        if index >= state.frames {
            return None;
        }
        *word |= 1 << bit;
        state.used += 1;
        Some(state.address_of(index))
    }

    /// Returns the frame containing `addr`.
    ///
    /// # Errors
    /// - [`MemoryError::NotInitialized`] before [`init`](Self::init).
    /// - [`MemoryError::OutOfRange`] if `addr` is outside the managed range.
    /// - [`MemoryError::DoubleFree`] if the frame is already free.
    ///
    /// No state changes on error.
    pub fn free_frame(&mut self, addr: PhysicalAddress) -> Result<(), MemoryError> {
        let state = self.state.as_mut().ok_or(MemoryError::NotInitialized)?;
        let Some(index) = state.index_of(addr) else {
            warn!("free_frame({addr}) outside {}..{}", state.start, state.end);
            return Err(MemoryError::OutOfRange);
        };
        if !state.is_set(index) {
            #[cfg(debug_assertions)]
            warn!("double free of frame {}", state.address_of(index));
            return Err(MemoryError::DoubleFree);
        }
        state.words[index / BITS_PER_WORD] &= !(1 << (index % BITS_PER_WORD));
        state.used -= 1;
        Ok(())
    }

    /// Whether the frame containing `addr` is allocated; `false` outside the range.
    #[must_use]
    pub fn is_allocated(&self, addr: PhysicalAddress) -> bool {
        self.state
            .as_ref()
            .and_then(|s| s.index_of(addr).map(|i| s.is_set(i)))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        self.state.as_ref().map_or_else(FrameStats::default, |s| FrameStats {
            total: s.frames,
            used: s.used,
            free: s.frames - s.used,
        })
    }

    /// Logs the counts and every run of allocated frames.
    pub fn dump(&self) {
        let Some(state) = &self.state else {
            info!("frame allocator: not initialized");
            return;
        };
        info!("frame allocator {}..{}: {}", state.start, state.end, self.stats());

        let mut run: Option<usize> = None;
        for index in 0..=state.frames {
            let set = index < state.frames && state.is_set(index);
            match (run, set) {
                (None, true) => run = Some(index),
                (Some(first), false) => {
                    info!(
                        "  {}..{} allocated",
                        state.address_of(first),
                        state.address_of(index)
                    );
                    run = None;
                }
                _ => {}
            }
        }
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_frame().map(PhysicalPage::containing)
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) -> Result<(), MemoryError> {
        self.free_frame(frame.base())
    }
}

/// A [`BitmapFrameAlloc`] behind an interrupt-safe lock.
///
/// ```rust
/// use kernel_alloc::frame_alloc::LockedFrameAlloc;
/// use kernel_memory_addresses::PhysicalAddress;
///
/// static FRAMES: LockedFrameAlloc = LockedFrameAlloc::new();
///
/// FRAMES.init(PhysicalAddress::new(0x10_0000), 0x4000).unwrap();
/// let frame = FRAMES.alloc_frame().unwrap();
/// FRAMES.free_frame(frame).unwrap();
/// ```
pub struct LockedFrameAlloc {
    inner: SpinLock<BitmapFrameAlloc>,
}

impl LockedFrameAlloc {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(BitmapFrameAlloc::new()),
        }
    }

    /// Locks with interrupts masked.
    #[must_use]
    pub fn lock(&self) -> IrqSpinLockGuard<'_, BitmapFrameAlloc> {
        self.inner.lock_irq()
    }

    /// See [`BitmapFrameAlloc::init`].
    ///
    /// # Errors
    /// As [`BitmapFrameAlloc::init`].
    pub fn init(&self, start: PhysicalAddress, size: u64) -> Result<(), MemoryError> {
        self.lock().init(start, size)
    }

    #[must_use]
    pub fn alloc_frame(&self) -> Option<PhysicalAddress> {
        self.lock().alloc_frame()
    }

    /// See [`BitmapFrameAlloc::free_frame`].
    ///
    /// # Errors
    /// As [`BitmapFrameAlloc::free_frame`].
    pub fn free_frame(&self, addr: PhysicalAddress) -> Result<(), MemoryError> {
        self.lock().free_frame(addr)
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        self.lock().stats()
    }
}

impl Default for LockedFrameAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAlloc for &LockedFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_frame().map(PhysicalPage::containing)
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) -> Result<(), MemoryError> {
        self.free_frame(frame.base())
    }
}
