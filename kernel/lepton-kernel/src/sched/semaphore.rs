//! Kernel counting semaphore.

use lepton_core::sync::SpinLock;

use super::{Scheduler, WaitQueue};

/// A counting semaphore for kernel-internal serialization.
///
/// `down` sleeps uninterruptibly when the count is exhausted; `up`
/// wakes the head waiter, so contenders acquire in FIFO order.
pub struct Semaphore {
    count: SpinLock<i32>,
    waiters: WaitQueue,
}

impl Semaphore {
    /// A semaphore with `count` initial permits.
    pub const fn new(count: i32) -> Self {
        Self {
            count: SpinLock::new(count),
            waiters: WaitQueue::new(),
        }
    }

    /// Acquires a permit, sleeping until one is released.
    pub fn down(&self, sched: &Scheduler) {
        loop {
            {
                let mut count = self.count.lock();
                if *count > 0 {
                    *count -= 1;
                    return;
                }
            }
            // Queue ourselves and re-check; up() wakes FIFO.
            let _ = sched.sleep_on(&self.waiters, false);
        }
    }

    /// Acquires a permit only if one is immediately available.
    pub fn try_down(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Releases a permit and wakes the longest waiter.
    pub fn up(&self, sched: &Scheduler) {
        *self.count.lock() += 1;
        self.waiters.wake_one(sched);
    }

    /// Current permit count.
    pub fn available(&self) -> i32 {
        *self.count.lock()
    }

    /// Number of sleepers.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }
}
