//! # Kernel Memory Configuration
//!
//! Compile-time layout of the memory subsystem. Every component that needs
//! to agree on where the heap window lives, how much low memory is identity
//! mapped, or where the frame pool starts reads it from here.
//!
//! ```text
//! Physical / identity-mapped low memory:
//!
//! 0x0000_0000 ┌──────────────────────────────┐
//!             │ firmware, kernel image       │
//! 0x0080_0000 ├──────────────────────────────┤ HEAP_WINDOW_START
//!             │ kernel heap window (24 MiB)  │
//! 0x0200_0000 ├──────────────────────────────┤ IDENTITY_LOW_BYTES, FRAME_POOL_START
//!             │ frame pool                   │
//!             └──────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod memory;
