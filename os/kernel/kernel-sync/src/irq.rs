//! Local interrupt masking.
//!
//! On bare-metal x86-64 the functions here execute `cli`/`sti` and read
//! `RFLAGS.IF`; they must run at CPL 0. Hosted builds (unit tests, tools)
//! have no privileged interrupt flag, so a process-wide software flag stands
//! in for it and the guard logic can be exercised off-target.

use core::marker::PhantomData;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    /// Bit 9 of `RFLAGS`.
    const IF: u64 = 1 << 9;

    #[inline]
    pub fn interrupts_enabled() -> bool {
        let rflags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nomem, preserves_flags));
        }
        rflags & IF != 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    use core::sync::atomic::{AtomicBool, Ordering};

    static SOFT_IF: AtomicBool = AtomicBool::new(false);

    #[inline]
    pub fn interrupts_enabled() -> bool {
        SOFT_IF.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn disable() {
        SOFT_IF.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn enable() {
        SOFT_IF.store(true, Ordering::SeqCst);
    }
}

/// Returns whether maskable interrupts are currently enabled on this CPU.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    arch::interrupts_enabled()
}

/// Masks interrupts on this CPU (`cli`).
#[inline]
pub fn disable_interrupts() {
    arch::disable();
}

/// Unmasks interrupts on this CPU (`sti`).
#[inline]
pub fn enable_interrupts() {
    arch::enable();
}

/// RAII guard that masks interrupts and restores the previous state on drop.
///
/// Interrupts are re-enabled on drop only if they were enabled when the
/// guard was created, so guards nest correctly. The guard is tied to the CPU
/// it was created on and is therefore neither `Send` nor `Sync`.
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct IrqGuard {
    were_enabled: bool,
    _cpu_local: PhantomData<*const ()>,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    pub fn new() -> Self {
        let were_enabled = interrupts_enabled();
        if were_enabled {
            disable_interrupts();
        }
        Self {
            were_enabled,
            _cpu_local: PhantomData,
        }
    }

    /// Whether interrupts will be re-enabled when this guard drops.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}
