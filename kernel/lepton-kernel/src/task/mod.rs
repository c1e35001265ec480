//! Task objects.
//!
//! A task is the unit of scheduling: an address space, a kernel stack, a
//! descriptor table, credentials and signal state. The kernel does not
//! distinguish threads from processes.
//!
//! Ownership follows the process tree: a parent holds strong references
//! to its children and each child keeps a weak back link, so reaping a
//! child severs the only strong edge and the task structure goes away
//! with it.

pub mod exec;
pub mod exit;
pub mod fork;
pub mod signal;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

use lepton_core::sync::SpinLock;

use crate::arch::TaskContext;
use crate::config::{DEF_PRIORITY, KSTACK_SIZE};
use crate::fs::{Dentry, FdTable};
use crate::mm::AddressSpace;
use crate::sched::WaitQueue;

use signal::SignalState;

/// Process identifier.
pub type Pid = u32;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// On the run queue (or currently executing).
    Running = 0,
    /// Sleeping; signals abort the sleep.
    Interruptible = 1,
    /// Sleeping; only an explicit wake helps.
    Uninterruptible = 2,
    /// Stopped by a job-control signal.
    Stopped = 3,
    /// Exited, awaiting a parent's `wait`.
    Zombie = 4,
    /// Fully dead; the structure lingers only until the last reference.
    Terminated = 5,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Interruptible,
            2 => Self::Uninterruptible,
            3 => Self::Stopped,
            4 => Self::Zombie,
            _ => Self::Terminated,
        }
    }
}

/// User and group identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

/// Session / process-group membership.
#[derive(Debug, Clone, Copy)]
pub struct JobIds {
    pub pgrp: Pid,
    pub session: Pid,
}

/// Parent and children links.
#[derive(Default)]
pub struct Relations {
    pub parent: Weak<Task>,
    pub children: Vec<Arc<Task>>,
}

/// Filesystem context: where relative walks start and the create mask.
#[derive(Default)]
pub struct FsContext {
    pub cwd: Option<Arc<Dentry>>,
    pub root: Option<Arc<Dentry>>,
    pub umask: u32,
}

/// Saved CPU context wrapper.
///
/// Accessed only by the scheduler with interrupts masked while the task
/// is not running, so the aliasing rules hold despite the raw cell.
pub struct ContextCell(UnsafeCell<TaskContext>);

// SAFETY: see the type docs — the scheduler serializes all access.
unsafe impl Sync for ContextCell {}

impl ContextCell {
    fn new() -> Self {
        Self(UnsafeCell::new(TaskContext::default()))
    }

    /// Raw pointer for `switch_to`.
    pub fn get(&self) -> *mut TaskContext {
        self.0.get()
    }
}

/// An independently scheduled thread of execution.
pub struct Task {
    pub pid: Pid,
    state: AtomicU8,
    /// Remaining tick budget; recharged by the scheduler.
    pub counter: AtomicI32,
    /// Base priority feeding the recharge formula.
    pub priority: AtomicI32,
    pub context: ContextCell,
    /// Kernel-mode stack (unused on the host, mapped on hardware).
    #[allow(dead_code)]
    kstack: Vec<u8>,
    pub comm: SpinLock<String>,
    pub creds: SpinLock<Credentials>,
    pub job: SpinLock<JobIds>,
    pub relations: SpinLock<Relations>,
    pub fs: SpinLock<FsContext>,
    pub fds: SpinLock<FdTable>,
    pub signals: SpinLock<SignalState>,
    pub mm: SpinLock<Option<AddressSpace>>,
    /// Status delivered to the parent's `wait`.
    pub exit_code: AtomicU32,
    /// Woken when a child of this task changes state.
    pub child_wait: Arc<WaitQueue>,
    /// Set while the task sits on some wait queue (a task is on at most
    /// one at a time).
    pub(crate) on_wait_queue: AtomicBool,
    /// Jiffies spent in user mode.
    pub utime: AtomicU64,
    /// Jiffies spent in kernel mode.
    pub stime: AtomicU64,
    /// `set_tid_address` slot.
    pub clear_child_tid: AtomicU32,
    /// Thread-local storage descriptors (`set_thread_area`).
    pub tls: SpinLock<[usize; 3]>,
}

impl Task {
    /// Builds a task in the running state with default scheduling
    /// parameters. The caller wires up relations and resources.
    pub fn new(pid: Pid, comm: &str) -> Arc<Self> {
        Arc::new(Self {
            pid,
            state: AtomicU8::new(TaskState::Running as u8),
            counter: AtomicI32::new(DEF_PRIORITY),
            priority: AtomicI32::new(DEF_PRIORITY),
            context: ContextCell::new(),
            kstack: vec![0; KSTACK_SIZE],
            comm: SpinLock::new(String::from(comm)),
            creds: SpinLock::new(Credentials::default()),
            job: SpinLock::new(JobIds { pgrp: pid, session: pid }),
            relations: SpinLock::new(Relations::default()),
            fs: SpinLock::new(FsContext {
                cwd: None,
                root: None,
                umask: 0o022,
            }),
            fds: SpinLock::new(FdTable::new()),
            signals: SpinLock::new(SignalState::new()),
            mm: SpinLock::new(None),
            exit_code: AtomicU32::new(0),
            child_wait: Arc::new(WaitQueue::new()),
            on_wait_queue: AtomicBool::new(false),
            utime: AtomicU64::new(0),
            stime: AtomicU64::new(0),
            clear_child_tid: AtomicU32::new(0),
            tls: SpinLock::new([0; 3]),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves the task to `state`.
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True when an unblocked signal awaits delivery.
    pub fn signal_pending(&self) -> bool {
        self.signals.lock().pending_deliverable()
    }

    /// The parent task, if it still exists.
    pub fn parent(&self) -> Option<Arc<Task>> {
        self.relations.lock().parent.upgrade()
    }

    /// The parent's pid, or 0 for init and orphans mid-reparent.
    pub fn ppid(&self) -> Pid {
        self.parent().map(|p| p.pid).unwrap_or(0)
    }

    /// Process group id.
    pub fn pgrp(&self) -> Pid {
        self.job.lock().pgrp
    }

    /// Session id.
    pub fn session(&self) -> Pid {
        self.job.lock().session
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_running() {
        let t = Task::new(7, "test");
        assert_eq!(t.state(), TaskState::Running);
        assert_eq!(t.pid, 7);
        assert_eq!(t.pgrp(), 7);
        assert_eq!(t.session(), 7);
    }

    #[test]
    fn state_transitions() {
        let t = Task::new(8, "test");
        t.set_state(TaskState::Interruptible);
        assert_eq!(t.state(), TaskState::Interruptible);
        t.set_state(TaskState::Zombie);
        assert_eq!(t.state(), TaskState::Zombie);
    }

    #[test]
    fn orphan_has_no_parent() {
        let t = Task::new(9, "test");
        assert!(t.parent().is_none());
        assert_eq!(t.ppid(), 0);
    }
}
