//! The scheduler.
//!
//! Single CPU, cooperative inside the kernel: nothing is preempted
//! between [`Scheduler::schedule`] points. At the return-to-user
//! boundary the tick handler's `need_resched` flag forces a pass.
//!
//! Selection is the classic dynamic-priority heuristic: every task has
//! a base priority and a decaying tick counter; the runnable task with
//! the highest counter wins, FIFO on ties. When every runnable counter
//! has drained to zero, all tasks are recharged to
//! `counter / 2 + priority`, so sleepers come back with a boost.

pub mod semaphore;
pub mod waitqueue;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use lepton_core::sync::{IrqLock, SpinLock};
use lepton_syscall::{Errno, KResult};

use crate::arch::{self, SwitchFn};
use crate::task::{Pid, Task, TaskState};

pub use semaphore::Semaphore;
pub use waitqueue::WaitQueue;

/// Global scheduler statistics.
#[derive(Default)]
pub struct Kstat {
    pub context_switches: AtomicU64,
    pub forks: AtomicU64,
    pub ticks: AtomicU64,
}

/// Run queue, task table and the currently executing task.
pub struct Scheduler {
    tasks: SpinLock<BTreeMap<Pid, Arc<Task>>>,
    run_queue: IrqLock<VecDeque<Arc<Task>>>,
    current: SpinLock<Option<Arc<Task>>>,
    next_pid: AtomicU32,
    need_resched: AtomicBool,
    switch_fn: SwitchFn,
    pub kstat: Kstat,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// A scheduler wired to the real context-switch primitive.
    pub fn new() -> Self {
        Self::with_switch(arch::switch_to)
    }

    /// A scheduler with an injected switch primitive (tests).
    pub fn with_switch(switch_fn: SwitchFn) -> Self {
        Self {
            tasks: SpinLock::new(BTreeMap::new()),
            run_queue: IrqLock::new(VecDeque::new()),
            current: SpinLock::new(None),
            next_pid: AtomicU32::new(1),
            need_resched: AtomicBool::new(false),
            switch_fn,
            kstat: Kstat::default(),
        }
    }

    /// Hands out the next pid (1 goes to init).
    pub fn alloc_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a task to the table and the run queue.
    pub fn register(&self, task: Arc<Task>) {
        self.tasks.lock().insert(task.pid, task.clone());
        self.make_runnable(&task);
    }

    /// Drops a task from the table (reap).
    pub fn unregister(&self, pid: Pid) {
        self.tasks.lock().remove(&pid);
        self.run_queue.lock().retain(|t| t.pid != pid);
    }

    /// Looks up a task by pid.
    pub fn task(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().get(&pid).cloned()
    }

    /// Snapshot of every task in the system.
    pub fn all_tasks(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().values().cloned().collect()
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// The running task.
    ///
    /// # Panics
    ///
    /// Panics when called before any task exists.
    pub fn current(&self) -> Arc<Task> {
        self.try_current().expect("no current task")
    }

    /// The running task, or `None` during early boot.
    pub fn try_current(&self) -> Option<Arc<Task>> {
        self.current.lock().clone()
    }

    /// Installs the running task (boot hand-off and tests).
    pub fn set_current(&self, task: Arc<Task>) {
        *self.current.lock() = Some(task);
    }

    /// Marks a task runnable and queues it if absent.
    pub fn make_runnable(&self, task: &Arc<Task>) {
        task.set_state(TaskState::Running);
        let mut rq = self.run_queue.lock();
        if !rq.iter().any(|t| t.pid == task.pid) {
            rq.push_back(task.clone());
        }
    }

    /// True if the tick handler requested a reschedule.
    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    /// Requests a reschedule at the next boundary.
    pub fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    /// Charges one tick to the running task; when its budget drains,
    /// flags a reschedule for the boundary.
    pub fn charge_tick(&self, from_user: bool) {
        self.kstat.ticks.fetch_add(1, Ordering::Relaxed);
        let Some(cur) = self.try_current() else {
            return;
        };
        if from_user {
            cur.utime.fetch_add(1, Ordering::Relaxed);
        } else {
            cur.stime.fetch_add(1, Ordering::Relaxed);
        }
        if cur.counter.fetch_sub(1, Ordering::AcqRel) <= 1 {
            self.set_need_resched();
        }
    }

    /// Picks and switches to the best runnable task.
    pub fn schedule(&self) {
        self.need_resched.store(false, Ordering::Release);

        let next = {
            let mut rq = self.run_queue.lock();
            rq.retain(|t| t.state() == TaskState::Running);
            if rq.is_empty() {
                return;
            }

            // Recharge pass: every runnable budget is spent.
            if rq.iter().all(|t| t.counter.load(Ordering::Acquire) <= 0) {
                for task in self.tasks.lock().values() {
                    let c = task.counter.load(Ordering::Acquire);
                    let p = task.priority.load(Ordering::Acquire);
                    task.counter.store(c / 2 + p, Ordering::Release);
                }
            }

            // Highest counter wins; the earliest queued of equals wins.
            let mut best = 0;
            let mut best_counter = i32::MIN;
            for (i, task) in rq.iter().enumerate() {
                let c = task.counter.load(Ordering::Acquire);
                if c > best_counter {
                    best = i;
                    best_counter = c;
                }
            }
            let next = rq.remove(best).expect("index in range");
            rq.push_back(next.clone());
            next
        };

        let prev = {
            let mut current = self.current.lock();
            current.replace(next.clone())
        };

        match prev {
            Some(prev) if Arc::ptr_eq(&prev, &next) => {}
            prev => {
                self.kstat.context_switches.fetch_add(1, Ordering::Relaxed);
                let prev_ctx = prev
                    .map(|p| p.context.get())
                    .unwrap_or(core::ptr::null_mut());
                if !prev_ctx.is_null() {
                    (self.switch_fn)(prev_ctx, next.context.get());
                }
            }
        }
    }

    /// Runs a reschedule if the tick handler asked for one; this is the
    /// return-to-user preemption point.
    pub fn preempt_boundary(&self) {
        if self.need_resched() {
            self.schedule();
        }
    }

    /// Blocks the current task on `queue` until woken.
    ///
    /// Returns `ERESTARTSYS` if `interruptible` and a signal became
    /// pending — the syscall return layer converts that to `EINTR` or a
    /// restart. Spurious wakeups are the caller's problem: re-check the
    /// condition and sleep again.
    pub fn sleep_on(&self, queue: &WaitQueue, interruptible: bool) -> KResult<()> {
        let cur = self.current();

        if interruptible && cur.signal_pending() {
            return Err(Errno::ERESTARTSYS);
        }

        cur.set_state(if interruptible {
            TaskState::Interruptible
        } else {
            TaskState::Uninterruptible
        });
        queue.enqueue(cur.clone());
        self.schedule();

        // Back from the switch (or woken before it happened).
        queue.remove(&cur);
        cur.set_state(TaskState::Running);
        self.make_runnable(&cur);

        if interruptible && cur.signal_pending() {
            return Err(Errno::ERESTARTSYS);
        }
        Ok(())
    }
}
