//! # Kernel synchronization primitives
//!
//! A spin lock with an interrupt-masking acquisition path, used to give each
//! memory component its own critical section.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::IrqGuard;
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
