//! The kernel context.
//!
//! All global mutable state lives in one [`Kernel`] value — scheduler,
//! timer wheel, memory, VFS, IPC tables — threaded explicitly through
//! the interrupt and syscall entry points. Interior mutability stays
//! inside the subsystem structs, so entry points share `&Kernel`.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::Ordering;

use lepton_core::sync::SpinLock;
use lepton_syscall::signal::{SIGCONT, SIGKILL};
use lepton_syscall::{Errno, KResult};

use crate::fs::buffer::BufferCache;
use crate::fs::chrdev::ChrdevTable;
use crate::fs::namei::WalkCreds;
use crate::fs::{Dentry, File, Vfs};
use crate::ipc::shm::ShmTable;
use crate::mm::{FrameAllocator, PhysMapper};
use crate::sched::{Scheduler, WaitQueue};
use crate::task::exec::BinfmtRegistry;
use crate::task::{Pid, Task, TaskState};
use crate::time::TimerWheel;
use crate::tty::TtySet;

/// Everything the kernel owns.
pub struct Kernel {
    pub sched: Scheduler,
    pub timers: TimerWheel,
    pub frames: FrameAllocator,
    pub phys: PhysMapper,
    pub vfs: Vfs,
    pub buffers: BufferCache,
    pub chrdevs: ChrdevTable,
    pub ttys: TtySet,
    pub shm: ShmTable,
    pub binfmts: BinfmtRegistry,
    /// Wall-clock seconds at boot (from the RTC driver).
    pub boot_epoch: u64,
    /// xorshift state behind `getrandom`.
    random: SpinLock<u64>,
    pub nodename: SpinLock<String>,
}

impl Kernel {
    /// Assembles a kernel over the given physical memory.
    pub fn new(frames: FrameAllocator, phys: PhysMapper) -> Self {
        Self {
            sched: Scheduler::new(),
            timers: TimerWheel::new(),
            frames,
            phys,
            vfs: Vfs::new(),
            buffers: BufferCache::default(),
            chrdevs: ChrdevTable::new(),
            ttys: TtySet::new(),
            shm: ShmTable::new(),
            binfmts: BinfmtRegistry::new(),
            boot_epoch: 0,
            random: SpinLock::new(0x9E37_79B9_7F4A_7C15),
            nodename: SpinLock::new(String::from(crate::config::DEFAULT_NODENAME)),
        }
    }

    /// Host-harness constructor: fabricates a small physical memory out
    /// of a leaked heap buffer (frame addresses start at zero and the
    /// phys mapper offsets into the buffer). Absent on the real target.
    #[cfg(not(target_os = "none"))]
    pub fn new_for_tests() -> Self {
        use crate::config::PAGE_SIZE;
        use lepton_core::addr::{align_up, PhysAddr};

        const FRAMES: usize = 512;
        let buf = vec![0u8; (FRAMES + 1) * PAGE_SIZE];
        let base = Box::leak(buf.into_boxed_slice()).as_mut_ptr() as usize;
        let aligned = align_up(base, PAGE_SIZE);
        Kernel::new(
            FrameAllocator::new(PhysAddr::new(0), FRAMES),
            PhysMapper::new(aligned),
        )
    }

    // -- scheduling glue ------------------------------------------------

    /// The running task.
    pub fn current(&self) -> Arc<Task> {
        self.sched.current()
    }

    /// Timer interrupt body: advance jiffies, fire timers, charge the
    /// running task.
    pub fn timer_tick(&self, from_user: bool) {
        self.sched.charge_tick(from_user);
        self.timers.tick(&self.sched);
    }

    /// Walk bases (cwd, root) of the current task, defaulting to the
    /// filesystem root.
    pub fn walk_bases(&self) -> KResult<(Arc<Dentry>, Arc<Dentry>)> {
        let root = self.vfs.root()?;
        let Some(task) = self.sched.try_current() else {
            return Ok((root.clone(), root));
        };
        let fs = task.fs.lock();
        let cwd = fs.cwd.clone().unwrap_or_else(|| root.clone());
        let task_root = fs.root.clone().unwrap_or_else(|| root.clone());
        Ok((cwd, task_root))
    }

    /// Effective credentials of the current task (root during boot).
    pub fn walk_creds(&self) -> WalkCreds {
        match self.sched.try_current() {
            Some(task) => {
                let creds = task.creds.lock();
                WalkCreds {
                    euid: creds.euid,
                    egid: creds.egid,
                }
            }
            None => WalkCreds::ROOT,
        }
    }

    // -- signals --------------------------------------------------------

    /// Posts `sig` to `task` and kicks it awake where the rules demand.
    pub fn send_signal(&self, task: &Arc<Task>, sig: u32) -> KResult<()> {
        if !task.signals.lock().raise(sig) {
            return Err(Errno::EINVAL);
        }
        match task.state() {
            // Interruptible sleepers abort their wait.
            TaskState::Interruptible => self.sched.make_runnable(task),
            // SIGKILL pries even uninterruptible sleeps loose.
            TaskState::Uninterruptible if sig == SIGKILL => self.sched.make_runnable(task),
            // SIGCONT resumes a stopped task.
            TaskState::Stopped if sig == SIGCONT || sig == SIGKILL => {
                self.sched.make_runnable(task)
            }
            _ => {}
        }
        Ok(())
    }

    /// `kill(2)` toward one pid. Signal 0 only probes existence.
    pub fn kill_pid(&self, pid: Pid, sig: u32) -> KResult<()> {
        let task = self.sched.task(pid).ok_or(Errno::ESRCH)?;
        if task.state() == TaskState::Zombie {
            return Err(Errno::ESRCH);
        }
        if sig == 0 {
            return Ok(());
        }
        self.send_signal(&task, sig)
    }

    /// Signals every member of a process group; returns how many tasks
    /// were hit.
    pub fn kill_pgrp(&self, pgrp: Pid, sig: u32) -> KResult<usize> {
        let mut hit = 0;
        for task in self.sched.all_tasks() {
            if task.pgrp() == pgrp && task.state() != TaskState::Zombie {
                if sig != 0 {
                    self.send_signal(&task, sig)?;
                }
                hit += 1;
            }
        }
        if hit == 0 { Err(Errno::ESRCH) } else { Ok(hit) }
    }

    /// Signal-delivery boundary, run on every return to userspace.
    ///
    /// Pops deliverable signals and acts: default deaths terminate the
    /// task, stops stop it, handlers save the interrupted context and
    /// surface `(signal, action)` so the arch layer can rewrite the
    /// user frame to enter the handler (whose `sigreturn` restores the
    /// saved context bit-identically).
    pub fn deliver_signals(
        &self,
    ) -> Option<(u32, lepton_syscall::signal::SigactionAbi)> {
        let task = self.current();
        loop {
            let taken = task.signals.lock().take_deliverable();
            let Some((sig, disposition)) = taken else {
                return None;
            };
            use crate::task::signal::Disposition;
            match disposition {
                Disposition::Ignore | Disposition::Continue => {}
                Disposition::Terminate | Disposition::Core => {
                    crate::task::exit::do_exit(
                        self,
                        &task,
                        lepton_syscall::abi::wstatus_signaled(sig),
                    );
                    return None;
                }
                Disposition::Stop => {
                    task.exit_code
                        .store(lepton_syscall::abi::wstatus_stopped(sig), Ordering::Release);
                    task.set_state(TaskState::Stopped);
                    if let Some(parent) = task.parent() {
                        parent.child_wait.wake_all(&self.sched);
                    }
                    self.sched.schedule();
                    return None;
                }
                Disposition::Handler(action) => {
                    // SAFETY: the task is current and running; nobody
                    // else reads its context concurrently.
                    let context = unsafe { *task.context.get() };
                    task.signals.lock().push_frame(context);
                    return Some((sig, action));
                }
            }
        }
    }

    /// Full return-to-userspace boundary: deliver signals, then honor
    /// the tick handler's reschedule request.
    pub fn return_to_user(&self) -> Option<(u32, lepton_syscall::signal::SigactionAbi)> {
        let handler = self.deliver_signals();
        self.sched.preempt_boundary();
        handler
    }

    // -- sleeping -------------------------------------------------------

    /// Sleeps the current task for at least `ms` milliseconds.
    ///
    /// Interruptible: a signal ends the sleep early with `ERESTARTSYS`.
    pub fn msleep(&self, ms: u64) -> KResult<()> {
        let deadline = self.timers.jiffies() + TimerWheel::msecs_to_jiffies(ms);
        self.sleep_until(deadline)
    }

    /// Sleeps until the jiffy counter reaches `deadline`.
    pub fn sleep_until(&self, deadline: u64) -> KResult<()> {
        let queue = Arc::new(WaitQueue::new());
        let timer_queue = queue.clone();
        let id = self.timers.add(
            deadline,
            Box::new(move |sched| timer_queue.wake_all(sched)),
        );

        let result = loop {
            if self.timers.jiffies() >= deadline {
                break Ok(());
            }
            match self.sched.sleep_on(&queue, true) {
                Ok(()) => {}
                Err(e) => break Err(e),
            }
        };
        self.timers.del(id);
        result
    }

    // -- files ----------------------------------------------------------

    /// Drops a descriptor's reference; the release hook fires when the
    /// last reference goes away.
    pub fn close_file(&self, file: Arc<File>) {
        if Arc::strong_count(&file) == 1 {
            file.fops.release(self, &file);
        }
        drop(file);
    }

    // -- misc -----------------------------------------------------------

    /// Fills `buf` from the kernel PRNG (xorshift64).
    pub fn fill_random(&self, buf: &mut [u8]) {
        let mut state = self.random.lock();
        for chunk in buf.chunks_mut(8) {
            let mut x = *state;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            *state = x;
            let bytes = x.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// Seeds the PRNG (boot entropy).
    pub fn seed_random(&self, seed: u64) {
        *self.random.lock() = seed | 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lepton_syscall::signal::{SIGTERM, SIGUSR1};

    fn kernel_with_task() -> (Kernel, Arc<Task>) {
        let k = Kernel::new_for_tests();
        let t = Task::new(k.sched.alloc_pid(), "ktest");
        k.sched.register(t.clone());
        k.sched.set_current(t.clone());
        (k, t)
    }

    #[test]
    fn kill_sets_pending_and_wakes_sleeper() {
        let (k, _) = kernel_with_task();
        let sleeper = Task::new(k.sched.alloc_pid(), "sleeper");
        k.sched.register(sleeper.clone());
        sleeper.set_state(TaskState::Interruptible);

        k.kill_pid(sleeper.pid, SIGTERM).unwrap();
        assert!(sleeper.signals.lock().is_pending(SIGTERM));
        assert_eq!(sleeper.state(), TaskState::Running);
    }

    #[test]
    fn kill_zero_probes_existence() {
        let (k, t) = kernel_with_task();
        assert!(k.kill_pid(t.pid, 0).is_ok());
        assert_eq!(k.kill_pid(9999, 0).unwrap_err(), Errno::ESRCH);
        assert!(!t.signals.lock().pending_deliverable());
    }

    #[test]
    fn sigkill_wakes_uninterruptible() {
        let (k, _) = kernel_with_task();
        let stuck = Task::new(k.sched.alloc_pid(), "stuck");
        k.sched.register(stuck.clone());
        stuck.set_state(TaskState::Uninterruptible);

        k.kill_pid(stuck.pid, SIGUSR1).unwrap();
        assert_eq!(stuck.state(), TaskState::Uninterruptible, "ordinary signals wait");
        k.kill_pid(stuck.pid, SIGKILL).unwrap();
        assert_eq!(stuck.state(), TaskState::Running);
    }

    #[test]
    fn sigcont_resumes_stopped() {
        let (k, _) = kernel_with_task();
        let stopped = Task::new(k.sched.alloc_pid(), "stopped");
        k.sched.register(stopped.clone());
        stopped.set_state(TaskState::Stopped);

        k.kill_pid(stopped.pid, SIGUSR1).unwrap();
        assert_eq!(stopped.state(), TaskState::Stopped);
        k.kill_pid(stopped.pid, SIGCONT).unwrap();
        assert_eq!(stopped.state(), TaskState::Running);
    }

    #[test]
    fn pgrp_kill_hits_members_only() {
        let (k, t) = kernel_with_task();
        let peer = Task::new(k.sched.alloc_pid(), "peer");
        peer.job.lock().pgrp = t.pgrp();
        k.sched.register(peer.clone());
        let outsider = Task::new(k.sched.alloc_pid(), "outsider");
        k.sched.register(outsider.clone());

        let hit = k.kill_pgrp(t.pgrp(), SIGUSR1).unwrap();
        assert_eq!(hit, 2);
        assert!(peer.signals.lock().is_pending(SIGUSR1));
        assert!(!outsider.signals.lock().is_pending(SIGUSR1));

        assert_eq!(k.kill_pgrp(4242, SIGUSR1).unwrap_err(), Errno::ESRCH);
    }

    #[test]
    fn random_fills_and_varies() {
        let (k, _) = kernel_with_task();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        k.fill_random(&mut a);
        k.fill_random(&mut b);
        assert_ne!(a, b);
        assert_ne!(a, [0u8; 16]);
    }

    #[test]
    fn timer_tick_advances_jiffies() {
        let (k, _) = kernel_with_task();
        let before = k.timers.jiffies();
        k.timer_tick(false);
        assert_eq!(k.timers.jiffies(), before + 1);
    }
}
