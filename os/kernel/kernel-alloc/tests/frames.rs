use kernel_alloc::MemoryError;
use kernel_alloc::frame_alloc::{BitmapFrameAlloc, FrameStats, LockedFrameAlloc};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::FrameAlloc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

fn pa(a: u64) -> PhysicalAddress {
    PhysicalAddress::new(a)
}

#[test]
fn sixteen_frames_then_exhaustion() {
    let mut frames = BitmapFrameAlloc::new();
    frames.init(pa(0x10_0000), 0x1_0000).unwrap();

    let got: Vec<_> = std::iter::from_fn(|| frames.alloc_frame()).collect();
    let expected: Vec<_> = (0..16).map(|i| pa(0x10_0000 + i * 0x1000)).collect();
    assert_eq!(got, expected);
    assert_eq!(*got.last().unwrap(), pa(0x10_F000));
    assert_eq!(frames.alloc_frame(), None);
    assert_eq!(
        frames.stats(),
        FrameStats {
            total: 16,
            used: 16,
            free: 0
        }
    );
}

#[test]
fn freed_frames_come_back_lowest_first() {
    let mut frames = BitmapFrameAlloc::new();
    frames.init(pa(0x20_0000), 8 * 0x1000).unwrap();
    let all: Vec<_> = (0..8).map(|_| frames.alloc_frame().unwrap()).collect();

    frames.free_frame(all[5]).unwrap();
    frames.free_frame(all[2]).unwrap();
    assert_eq!(frames.alloc_frame(), Some(all[2]));
    assert_eq!(frames.alloc_frame(), Some(all[5]));
    assert_eq!(frames.alloc_frame(), None);
}

#[test]
fn unaligned_range_is_trimmed_to_whole_frames() {
    let mut frames = BitmapFrameAlloc::new();
    frames.init(pa(0x10_0800), 0x3000).unwrap();
    assert_eq!(frames.range(), Some((pa(0x10_1000), pa(0x10_3000))));
    assert_eq!(frames.stats().total, 2);

    let first = frames.alloc_frame().unwrap();
    assert_eq!(frames.free_frame(pa(first.as_u64() + 0x123)), Ok(()));
    assert!(!frames.is_allocated(first));
}

#[test]
fn misuse_is_reported_without_state_change() {
    let mut frames = BitmapFrameAlloc::new();
    assert_eq!(frames.free_frame(pa(0x10_0000)), Err(MemoryError::NotInitialized));
    assert_eq!(frames.alloc_frame(), None);

    frames.init(pa(0x10_0000), 0x4000).unwrap();
    let a = frames.alloc_frame().unwrap();
    let before = frames.stats();

    assert_eq!(frames.free_frame(pa(0xF_F000)), Err(MemoryError::OutOfRange));
    assert_eq!(frames.free_frame(pa(0x10_4000)), Err(MemoryError::OutOfRange));
    assert_eq!(frames.free_frame(pa(0x10_1000)), Err(MemoryError::DoubleFree));
    assert_eq!(frames.stats(), before);
    assert!(frames.is_allocated(a));
}

#[test]
fn empty_ranges_are_rejected() {
    let mut frames = BitmapFrameAlloc::new();
    assert_eq!(frames.init(pa(0x10_0000), 0), Err(MemoryError::InvalidArgument));
    assert_eq!(frames.init(pa(0x10_0800), 0x800), Err(MemoryError::InvalidArgument));
    assert_eq!(frames.init(pa(u64::MAX - 0x100), 0x1000), Err(MemoryError::InvalidArgument));
    assert!(!frames.is_initialized());
}

#[test]
fn frame_alloc_trait_round_trip() {
    let locked = LockedFrameAlloc::new();
    locked.init(pa(0x30_0000), 0x2000).unwrap();

    let mut source = &locked;
    let a = source.alloc_4k().unwrap();
    let b = source.alloc_4k().unwrap();
    assert_ne!(a, b);
    assert!(source.alloc_4k().is_none());
    source.free_4k(a).unwrap();
    assert_eq!(source.free_4k(a), Err(MemoryError::DoubleFree));
    assert_eq!(locked.stats().used, 1);
}

#[test]
fn concurrent_allocations_never_share_a_frame() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 200;

    let frames = Arc::new(LockedFrameAlloc::new());
    frames.init(pa(0x100_0000), (THREADS * PER_THREAD) as u64 * 0x1000).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let frames = Arc::clone(&frames);
            thread::spawn(move || {
                let mut mine = Vec::with_capacity(PER_THREAD);
                for round in 0..PER_THREAD {
                    mine.push(frames.alloc_frame().unwrap());
                    if round % 3 == 0 {
                        let frame = mine.swap_remove(0);
                        frames.free_frame(frame).unwrap();
                    }
                }
                mine
            })
        })
        .collect();

    let mut seen = BTreeSet::new();
    for handle in handles {
        for frame in handle.join().unwrap() {
            assert!(seen.insert(frame), "frame {frame} handed out twice");
        }
    }
    let stats = frames.stats();
    assert_eq!(stats.used, seen.len());
    assert_eq!(stats.used + stats.free, stats.total);
}
