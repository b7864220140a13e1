//! # Kernel Memory Allocation
//!
//! Frame allocator, heap and pager of the kernel, plus the glue that brings
//! them up at boot.
//!
//! ```text
//! ┌───────────────────────────┐   ┌──────────────────────────────┐
//! │ checked / global          │   │ vmm::Vmm                     │
//! │  kmalloc!, GlobalAlloc    │   │  map_page, map_user_region   │
//! └─────────────┬─────────────┘   └───────┬──────────────┬───────┘
//!               │                         │              │
//! ┌─────────────▼─────────────┐   ┌───────▼──────┐ ┌─────▼────────────────┐
//! │ heap::Heap                │   │ phys_mapper  │ │ frame_alloc          │
//! │  boundary tags, free list │◄──┤  PhysMapper  │ │  bitmap over 4 KiB   │
//! └───────────────────────────┘   └──────────────┘ └──────────────────────┘
//!               ▲                                          │ bitmap storage
//!               └──────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`heap`]: first-fit allocator with boundary tags and an explicit free
//!   list. Returns [`MemoryError`] on every failure.
//! - [`checked`]: fail-fast layer over the heap that records the call site
//!   ([`kmalloc!`], [`kfree!`], [`krealloc!`], [`kmalloc_aligned!`]).
//! - [`global`]: [`KernelHeap`](global::KernelHeap), the `#[global_allocator]`.
//! - [`frame_alloc`]: bitmap allocator of physical 4 KiB frames.
//! - [`vmm`]: the pager. Maps and unmaps 4 KiB pages in existing tables and
//!   keeps the TLB coherent.
//! - [`phys_mapper`]: reaches page-table frames through the identity map or
//!   the higher-half direct map.
//! - [`bootstrap`]: boot order of the above.
//!
//! ## Locking
//!
//! Every component is a plain value. The kernel puts each one behind its own
//! [`SpinLock`](kernel_sync::SpinLock), acquired with `lock_irq()` so that
//! interrupt handlers on the same CPU cannot deadlock on it.
//!
//! ```rust
//! use kernel_alloc::frame_alloc::LockedFrameAlloc;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! static FRAMES: LockedFrameAlloc = LockedFrameAlloc::new();
//!
//! FRAMES.init(PhysicalAddress::new(0x10_0000), 0x4000).unwrap();
//! let frame = FRAMES.alloc_frame().unwrap();
//! assert_eq!(frame, PhysicalAddress::new(0x10_0000));
//! FRAMES.free_frame(frame).unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod bootstrap;
pub mod checked;
pub mod frame_alloc;
pub mod global;
pub mod heap;
pub mod phys_mapper;
pub mod vmm;

pub use kernel_memory_error::{CallSite, MemoryError, OrAbort, call_site};
