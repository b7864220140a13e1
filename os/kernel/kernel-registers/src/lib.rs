//! # Typed `X86_64` Control Registers
//!
//! Bitfield models of the control registers the pager touches: `CR0` (paging
//! enable), `CR3` (translation root) and `CR4` (PAE), plus single-entry TLB
//! invalidation. Register access is compiled in with the `asm` feature; the
//! models themselves are plain values and usable anywhere.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "cr4")]
pub mod cr4;

#[cfg(all(feature = "tlb", feature = "asm", target_arch = "x86_64"))]
pub mod tlb;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Control registers are privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Writing a control register changes how every subsequent memory access
    /// is translated.
    unsafe fn store_unsafe(self);
}
