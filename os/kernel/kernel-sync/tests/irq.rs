//! Interrupt-flag bookkeeping on hosted builds.
//!
//! Kept as a single test in its own binary: the emulated flag is process-wide.

use kernel_sync::irq::{self, IrqGuard};
use kernel_sync::SpinLock;

#[test]
fn guards_mask_and_restore_the_interrupt_flag() {
    irq::enable_interrupts();
    assert!(irq::interrupts_enabled());

    {
        let outer = IrqGuard::new();
        assert!(outer.restores_interrupts());
        assert!(!irq::interrupts_enabled());

        {
            let inner = IrqGuard::new();
            assert!(!inner.restores_interrupts());
        }
        assert!(!irq::interrupts_enabled(), "nested guard must not unmask");
    }
    assert!(irq::interrupts_enabled());

    let lock = SpinLock::new(5u32);
    {
        let g = lock.lock_irq();
        assert_eq!(*g, 5);
        assert!(!irq::interrupts_enabled());
    }
    assert!(irq::interrupts_enabled());
    assert!(!lock.is_locked());

    // A failed try_lock_irq leaves the flag as it found it.
    let held = lock.lock();
    assert!(lock.try_lock_irq().is_none());
    assert!(irq::interrupts_enabled());
    drop(held);

    irq::disable_interrupts();
    {
        let _g = IrqGuard::new();
    }
    assert!(!irq::interrupts_enabled(), "disabled state must survive a guard");
}
