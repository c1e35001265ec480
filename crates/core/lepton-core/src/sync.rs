//! Spin-based mutual exclusion.
//!
//! [`SpinLock`] is the plain test-and-test-and-set lock. [`IrqLock`]
//! additionally masks local interrupts for the duration of the guard, so
//! it is the one to use for state also touched from interrupt handlers
//! (run queue, wait queues, timer list). On a single CPU the masking is
//! what provides the exclusion; the atomic is a cheap re-entry check.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-test-and-set spin lock, const-constructable for statics.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to the inner value.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates an unlocked lock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Spins until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Acquires the lock if it is free, without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// Consumes the lock, returning the inner value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// RAII guard for [`SpinLock`].
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Interrupt masking
// ---------------------------------------------------------------------------

/// Masks local interrupts, returning the previous interrupt-enable state.
#[inline]
pub fn irq_save() -> bool {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let flags: u32;
        // SAFETY: pushfd/pop reads EFLAGS, cli only masks interrupts.
        unsafe {
            core::arch::asm!("pushfd; pop {}; cli", out(reg) flags, options(nomem));
        }
        (flags & (1 << 9)) != 0
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        false
    }
}

/// Restores the interrupt-enable state returned by [`irq_save`].
#[inline]
pub fn irq_restore(was_enabled: bool) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    if was_enabled {
        // SAFETY: sti only unmasks interrupts.
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = was_enabled;
}

/// A spin lock whose guard also keeps local interrupts masked.
pub struct IrqLock<T> {
    inner: SpinLock<T>,
}

impl<T> IrqLock<T> {
    /// Creates an unlocked lock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    /// Masks interrupts, then acquires the lock.
    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let was_enabled = irq_save();
        IrqLockGuard {
            guard: Some(self.inner.lock()),
            was_enabled,
        }
    }
}

// SAFETY: same reasoning as SpinLock.
unsafe impl<T: Send> Send for IrqLock<T> {}
unsafe impl<T: Send> Sync for IrqLock<T> {}

/// RAII guard for [`IrqLock`]; restores the interrupt state on drop.
pub struct IrqLockGuard<'a, T> {
    guard: Option<SpinLockGuard<'a, T>>,
    was_enabled: bool,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard present until drop")
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard present until drop")
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before unmasking.
        self.guard = None;
        irq_restore(self.was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinlock_roundtrip() {
        let lock = SpinLock::new(5);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn irqlock_nests_with_distinct_locks() {
        let a = IrqLock::new(1);
        let b = IrqLock::new(2);
        let ga = a.lock();
        let gb = b.lock();
        assert_eq!(*ga + *gb, 3);
    }

    #[test]
    fn into_inner_returns_value() {
        let lock = SpinLock::new(String::from("x"));
        assert_eq!(lock.into_inner(), "x");
    }
}
