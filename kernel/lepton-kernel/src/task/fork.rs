//! `fork` — duplicating the current task.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use lepton_syscall::KResult;

use crate::kernel::Kernel;

use super::{Pid, Task};

/// Clones the current task.
///
/// The child shares nothing mutable: its address space is a
/// copy-on-write clone, the descriptor table references the same open
/// files (their refcounts grow), signal actions and masks are copied
/// with the pending set cleared, and the tick budget is split between
/// parent and child so forking is not a scheduling cheat. Returns the
/// child pid; the child itself resumes from the saved context with a
/// zero return value (arranged by the arch trap frame).
pub fn do_fork(k: &Kernel) -> KResult<Pid> {
    let parent = k.current();
    let pid = k.sched.alloc_pid();
    let child = Task::new(pid, &parent.comm.lock());

    // Identity and job control.
    *child.creds.lock() = *parent.creds.lock();
    *child.job.lock() = *parent.job.lock();

    // Filesystem context.
    {
        let parent_fs = parent.fs.lock();
        let mut child_fs = child.fs.lock();
        child_fs.cwd = parent_fs.cwd.clone();
        child_fs.root = parent_fs.root.clone();
        child_fs.umask = parent_fs.umask;
    }

    // Open files: shared open-file objects, copied cloexec bits.
    *child.fds.lock() = parent.fds.lock().clone_for_fork();

    // Signals: dispositions and mask are inherited, pending is not.
    {
        let parent_sig = parent.signals.lock();
        let mut child_sig = child.signals.lock();
        for sig in 1..lepton_syscall::signal::NSIG as u32 {
            if let Some(action) = parent_sig.action(sig) {
                child_sig.set_action(sig, action);
            }
        }
        child_sig.set_blocked(parent_sig.blocked());
    }

    // Address space: copy-on-write duplicate of the user half.
    {
        let parent_mm = parent.mm.lock();
        if let Some(space) = parent_mm.as_ref() {
            *child.mm.lock() = Some(space.clone_for_fork(&k.frames, &k.phys)?);
        }
    }

    // Saved CPU context starts as the parent's; the syscall layer
    // patches the child's return register before it first runs.
    // SAFETY: the child is not yet visible to the scheduler, and the
    // parent is the running task, so both contexts are quiescent.
    unsafe {
        *child.context.get() = *parent.context.get();
    }

    // Split the remaining tick budget.
    let budget = parent.counter.load(Ordering::Acquire);
    let half = budget / 2;
    parent.counter.store(budget - half, Ordering::Release);
    child.counter.store(half, Ordering::Release);
    child
        .priority
        .store(parent.priority.load(Ordering::Acquire), Ordering::Release);

    // Thread the process tree.
    {
        let mut child_rel = child.relations.lock();
        child_rel.parent = Arc::downgrade(&parent);
    }
    parent.relations.lock().children.push(child.clone());

    k.sched.register(child);
    k.sched.kstat.forks.fetch_add(1, Ordering::Relaxed);
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{File, Inode, InodeMeta};
    use crate::mm::AddressSpace;
    use crate::task::TaskState;
    use lepton_syscall::flags::{OpenFlags, S_IFREG};
    use lepton_syscall::signal::{SigactionAbi, SIGUSR1};

    struct NullOps;
    impl crate::fs::InodeOps for NullOps {}
    impl crate::fs::FileOps for NullOps {}

    fn kernel_with_parent() -> (Kernel, Arc<Task>) {
        let k = Kernel::new_for_tests();
        let t = Task::new(k.sched.alloc_pid(), "parent");
        *t.mm.lock() = Some(AddressSpace::new(&k.frames, &k.phys, None).unwrap());
        k.sched.register(t.clone());
        k.sched.set_current(t.clone());
        (k, t)
    }

    fn open_dummy(task: &Task) -> Arc<File> {
        let inode = Inode::anonymous(
            InodeMeta::new(S_IFREG | 0o644),
            Arc::new(NullOps),
            Arc::new(NullOps),
        );
        let file = File::new(inode, None, OpenFlags::RDWR);
        task.fds.lock().alloc(file.clone(), false).unwrap();
        file
    }

    #[test]
    fn child_is_registered_and_linked() {
        let (k, parent) = kernel_with_parent();
        let pid = do_fork(&k).unwrap();
        let child = k.sched.task(pid).unwrap();

        assert_eq!(child.state(), TaskState::Running);
        assert_eq!(child.ppid(), parent.pid);
        assert!(parent
            .relations
            .lock()
            .children
            .iter()
            .any(|c| c.pid == pid));
    }

    #[test]
    fn descriptor_table_shares_open_files() {
        let (k, parent) = kernel_with_parent();
        let file = open_dummy(&parent);
        let before = Arc::strong_count(&file);

        let pid = do_fork(&k).unwrap();
        assert_eq!(Arc::strong_count(&file), before + 1, "child holds a ref");

        let child = k.sched.task(pid).unwrap();
        let child_file = child.fds.lock().get(0).unwrap();
        assert!(Arc::ptr_eq(&child_file, &file));
    }

    #[test]
    fn signal_state_copied_pending_cleared() {
        let (k, parent) = kernel_with_parent();
        let action = SigactionAbi {
            sa_handler: 0x1234,
            sa_flags: 0,
            sa_restorer: 0,
            sa_mask: 0,
        };
        parent.signals.lock().set_action(SIGUSR1, action);
        parent.signals.lock().raise(SIGUSR1);

        let pid = do_fork(&k).unwrap();
        let child = k.sched.task(pid).unwrap();
        let child_sig = child.signals.lock();
        assert_eq!(child_sig.action(SIGUSR1).unwrap().sa_handler, 0x1234);
        assert!(!child_sig.is_pending(SIGUSR1), "pending set not inherited");
    }

    #[test]
    fn address_space_is_cow_cloned() {
        let (k, parent) = kernel_with_parent();
        {
            let mut mm = parent.mm.lock();
            let space = mm.as_mut().unwrap();
            space.init_brk(0x0800_0000);
            space
                .sbrk(&k.frames, &k.phys, crate::config::PAGE_SIZE as isize)
                .unwrap();
        }

        let pid = do_fork(&k).unwrap();
        let child = k.sched.task(pid).unwrap();
        let child_mm = child.mm.lock();
        assert_eq!(child_mm.as_ref().unwrap().brk, 0x0800_0000 + 4096);
        assert_eq!(child_mm.as_ref().unwrap().pd.user_pages(&k.phys), 1);
    }

    #[test]
    fn tick_budget_is_split() {
        let (k, parent) = kernel_with_parent();
        parent.counter.store(10, Ordering::Release);
        let pid = do_fork(&k).unwrap();
        let child = k.sched.task(pid).unwrap();

        assert_eq!(parent.counter.load(Ordering::Acquire), 5);
        assert_eq!(child.counter.load(Ordering::Acquire), 5);
    }
}
