//! `exit` and `wait` — the end of the task lifecycle.
//!
//! An exiting task releases everything it owns, hands surviving
//! children to init, turns Zombie and wakes its parent. The zombie
//! lingers — still in the task table, still linked from the parent —
//! until the parent reaps it with `waitpid`, which collects the status
//! and severs the last strong reference.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use lepton_syscall::abi::wstatus_exited;
use lepton_syscall::flags::WaitOptions;
use lepton_syscall::signal::SIGCHLD;
use lepton_syscall::{Errno, KResult};

use crate::kernel::Kernel;

use super::{Pid, Task, TaskState};

/// Terminates `task` with the given raw wait status.
///
/// Used for both voluntary exit (`wstatus_exited(code)`) and fatal
/// signals (`wstatus_signaled(sig)`).
pub fn do_exit(k: &Kernel, task: &Arc<Task>, status: u32) {
    lepton_core::kinfo!("task {} exiting, status {:#x}", task.pid, status);

    // Close every descriptor, running release hooks.
    let files = task.fds.lock().take_all();
    for file in files {
        k.close_file(file);
    }

    // Detach shared memory, then drop the whole user image.
    {
        let mut mm = task.mm.lock();
        k.shm.detach_all(k, task.pid, &mut mm);
        if let Some(space) = mm.take() {
            space.destroy(&k.frames, &k.phys);
        }
    }

    // Let go of the filesystem context.
    {
        let mut fs = task.fs.lock();
        fs.cwd = None;
        fs.root = None;
    }

    // Orphans go to init; init reaps existing zombies among them.
    reparent_children(k, task);

    task.exit_code.store(status, Ordering::Release);
    task.set_state(TaskState::Zombie);

    // The parent may be sleeping in waitpid.
    if let Some(parent) = task.parent() {
        let _ = k.send_signal(&parent, SIGCHLD);
        parent.child_wait.wake_all(&k.sched);
    } else {
        // Init (or an unreaped orphan): nobody will wait, drop it now.
        release_task(k, task);
    }

    // An exiting current task never returns to userspace; pick the
    // next runnable.
    if k.sched.try_current().is_some_and(|c| c.pid == task.pid) {
        k.sched.schedule();
    }
}

/// `exit(2)` for the current task.
pub fn sys_exit(k: &Kernel, code: u8) {
    let task = k.current();
    do_exit(k, &task, wstatus_exited(code));
}

/// Moves `task`'s children under init (pid 1) and reaps any that are
/// already zombies (init implicitly waits for everything).
fn reparent_children(k: &Kernel, task: &Arc<Task>) {
    let children: alloc::vec::Vec<Arc<Task>> =
        core::mem::take(&mut task.relations.lock().children);
    if children.is_empty() {
        return;
    }
    let init = k.sched.task(1);
    for child in children {
        match (&init, child.state()) {
            (Some(init), TaskState::Zombie) if !Arc::ptr_eq(init, task) => {
                // Nobody will ever wait for it through the old parent.
                release_task(k, &child);
            }
            (Some(init), _) => {
                child.relations.lock().parent = Arc::downgrade(init);
                init.relations.lock().children.push(child);
            }
            (None, _) => {
                child.relations.lock().parent = alloc::sync::Weak::new();
                if child.state() == TaskState::Zombie {
                    release_task(k, &child);
                }
            }
        }
    }
}

/// Frees a task structure for good.
fn release_task(k: &Kernel, task: &Arc<Task>) {
    task.set_state(TaskState::Terminated);
    k.sched.unregister(task.pid);
}

/// Does `task` match the `waitpid` pid selector?
fn matches(selector: i32, waiter: &Arc<Task>, child: &Arc<Task>) -> bool {
    if selector == -1 {
        true
    } else if selector > 0 {
        child.pid == selector as Pid
    } else if selector == 0 {
        child.pgrp() == waiter.pgrp()
    } else {
        child.pgrp() == (-selector) as Pid
    }
}

/// `waitpid(2)`: blocks until a matching child changes state.
///
/// Returns `(pid, status)`. `WNOHANG` turns the block into `(0, 0)`.
/// Reaping removes the zombie from the task table and the child list.
pub fn do_wait(k: &Kernel, selector: i32, options: WaitOptions) -> KResult<(Pid, u32)> {
    let waiter = k.current();

    loop {
        let mut have_match = false;
        let mut reap: Option<Arc<Task>> = None;
        let mut stopped: Option<Arc<Task>> = None;

        {
            let relations = waiter.relations.lock();
            for child in relations.children.iter() {
                if !matches(selector, &waiter, child) {
                    continue;
                }
                have_match = true;
                match child.state() {
                    TaskState::Zombie => {
                        reap = Some(child.clone());
                        break;
                    }
                    TaskState::Stopped if options.contains(WaitOptions::UNTRACED) => {
                        stopped = Some(child.clone());
                    }
                    _ => {}
                }
            }
        }

        if !have_match {
            return Err(Errno::ECHILD);
        }

        if let Some(child) = reap {
            let status = child.exit_code.load(Ordering::Acquire);
            waiter
                .relations
                .lock()
                .children
                .retain(|c| c.pid != child.pid);
            release_task(k, &child);
            return Ok((child.pid, status));
        }

        if let Some(child) = stopped {
            let status = child.exit_code.load(Ordering::Acquire);
            return Ok((child.pid, status));
        }

        if options.contains(WaitOptions::NOHANG) {
            return Ok((0, 0));
        }

        k.sched.sleep_on(&waiter.child_wait, true)?;
    }
}
