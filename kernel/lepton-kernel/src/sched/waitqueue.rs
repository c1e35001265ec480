//! Wait queues: ordered lists of blocked tasks.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use lepton_core::sync::IrqLock;

use crate::task::Task;

use super::Scheduler;

/// An ordered list of tasks blocked on some condition.
///
/// A task sits on at most one wait queue at a time; violating that is a
/// corrupted invariant and panics. Wakers dequeue in FIFO order.
pub struct WaitQueue {
    waiters: IrqLock<VecDeque<Arc<Task>>>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: IrqLock::new(VecDeque::new()),
        }
    }

    /// Appends `task` to the queue.
    ///
    /// # Panics
    ///
    /// Panics if the task is already on some wait queue.
    pub fn enqueue(&self, task: Arc<Task>) {
        let was_queued = task
            .on_wait_queue
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err();
        assert!(!was_queued, "task {} already on a wait queue", task.pid);
        self.waiters.lock().push_back(task);
    }

    /// Appends a poll entry for `task`.
    ///
    /// `poll`/`select` watch several queues at once through distinct
    /// entries, so this skips the one-queue accounting that ordinary
    /// sleeps maintain.
    pub fn enqueue_poll(&self, task: Arc<Task>) {
        self.waiters.lock().push_back(task);
    }

    /// Removes `task` if present (sleep epilogue, select teardown).
    pub fn remove(&self, task: &Arc<Task>) {
        let mut waiters = self.waiters.lock();
        let before = waiters.len();
        waiters.retain(|t| t.pid != task.pid);
        if waiters.len() != before {
            task.on_wait_queue.store(false, Ordering::Release);
        }
    }

    /// Wakes every queued task.
    pub fn wake_all(&self, sched: &Scheduler) {
        let drained: VecDeque<Arc<Task>> = core::mem::take(&mut *self.waiters.lock());
        for task in drained {
            task.on_wait_queue.store(false, Ordering::Release);
            sched.make_runnable(&task);
        }
    }

    /// Wakes only the head of the queue.
    pub fn wake_one(&self, sched: &Scheduler) {
        let head = self.waiters.lock().pop_front();
        if let Some(task) = head {
            task.on_wait_queue.store(false, Ordering::Release);
            sched.make_runnable(&task);
        }
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// True when nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// True if `task` is queued here.
    pub fn contains(&self, task: &Task) -> bool {
        self.waiters.lock().iter().any(|t| t.pid == task.pid)
    }
}
