//! Signal syscalls.

use lepton_syscall::signal::{sigmask, SigactionAbi, SIG_BLOCK, SIG_SETMASK, SIG_UNBLOCK};
use lepton_syscall::{Errno, KResult};

use crate::kernel::Kernel;
use crate::sched::WaitQueue;

use super::{ret, uaccess};

pub fn sys_kill(k: &Kernel, pid: i32, sig: u32) -> isize {
    let inner = || -> KResult<usize> {
        if sig != 0 && sigmask(sig).is_none() {
            return Err(Errno::EINVAL);
        }
        match pid {
            0 => {
                let pgrp = k.current().pgrp();
                k.kill_pgrp(pgrp, sig)?;
            }
            -1 => {
                // Everyone except init and self.
                let me = k.current().pid;
                let mut hit = 0;
                for task in k.sched.all_tasks() {
                    if task.pid != 1 && task.pid != me {
                        let _ = k.send_signal(&task, sig);
                        hit += 1;
                    }
                }
                if hit == 0 {
                    return Err(Errno::ESRCH);
                }
            }
            p if p > 0 => k.kill_pid(p as u32, sig)?,
            p => {
                k.kill_pgrp((-p) as u32, sig)?;
            }
        }
        Ok(0)
    };
    ret(inner())
}

/// `tkill`: exact-task variant (threads and tasks coincide here).
pub fn sys_tkill(k: &Kernel, tid: u32, sig: u32) -> isize {
    let inner = || -> KResult<usize> {
        if sig != 0 && sigmask(sig).is_none() {
            return Err(Errno::EINVAL);
        }
        k.kill_pid(tid, sig)?;
        Ok(0)
    };
    ret(inner())
}

pub fn sys_sigaction(k: &Kernel, sig: u32, act_ptr: usize, old_ptr: usize) -> isize {
    let inner = || -> KResult<usize> {
        let task = k.current();
        let mut signals = task.signals.lock();

        let old = signals.action(sig).ok_or(Errno::EINVAL)?;
        if act_ptr != 0 {
            let action: SigactionAbi = uaccess::read_user(act_ptr)?;
            signals.set_action(sig, action).ok_or(Errno::EINVAL)?;
        }
        drop(signals);
        if old_ptr != 0 {
            uaccess::write_user(old_ptr, &old)?;
        }
        Ok(0)
    };
    ret(inner())
}

pub fn sys_sigprocmask(k: &Kernel, how: u32, set_ptr: usize, old_ptr: usize) -> isize {
    let inner = || -> KResult<usize> {
        let task = k.current();
        let mut signals = task.signals.lock();
        let old = signals.blocked();

        if set_ptr != 0 {
            let set: u32 = uaccess::read_user(set_ptr)?;
            let new = match how {
                SIG_BLOCK => old | set,
                SIG_UNBLOCK => old & !set,
                SIG_SETMASK => set,
                _ => return Err(Errno::EINVAL),
            };
            signals.set_blocked(new);
        }
        drop(signals);
        if old_ptr != 0 {
            uaccess::write_user(old_ptr, &old)?;
        }
        Ok(0)
    };
    ret(inner())
}

/// `sigreturn`: restores the context saved at handler delivery.
///
/// The arch stub rebuilds the user frame from the returned context; a
/// call without a pending frame is a userspace bug answered with
/// `EINVAL`.
pub fn sys_sigreturn(k: &Kernel) -> isize {
    let task = k.current();
    let frame = task.signals.lock().pop_frame();
    match frame {
        Some(context) => {
            // SAFETY: the task is current; the scheduler is not looking
            // at the context while the task itself is executing.
            unsafe {
                *task.context.get() = context;
            }
            0
        }
        None => Errno::EINVAL.to_neg(),
    }
}

/// `pause`: sleep until any signal arrives. Always interrupted.
pub fn sys_pause(k: &Kernel) -> isize {
    let queue = WaitQueue::new();
    loop {
        match k.sched.sleep_on(&queue, true) {
            Err(_) => return Errno::ERESTARTNOHAND.to_neg(),
            Ok(()) => {
                // Spurious wake without a signal: sleep again — except
                // under the host harness, where the no-op switch would
                // spin; a pending-signal check keeps both honest.
                if k.current().signal_pending() {
                    return Errno::ERESTARTNOHAND.to_neg();
                }
                #[cfg(not(all(target_arch = "x86", target_os = "none")))]
                return Errno::ERESTARTNOHAND.to_neg();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use lepton_syscall::signal::{SIGKILL, SIGUSR1, SIGUSR2};

    fn kernel_with_task() -> Kernel {
        let k = Kernel::new_for_tests();
        let t = Task::new(k.sched.alloc_pid(), "sig");
        k.sched.register(t.clone());
        k.sched.set_current(t);
        k
    }

    #[test]
    fn kill_reaches_target() {
        let k = kernel_with_task();
        let other = Task::new(k.sched.alloc_pid(), "other");
        k.sched.register(other.clone());

        assert_eq!(sys_kill(&k, other.pid as i32, SIGUSR1), 0);
        assert!(other.signals.lock().is_pending(SIGUSR1));
    }

    #[test]
    fn kill_bad_signal_is_einval() {
        let k = kernel_with_task();
        assert_eq!(sys_kill(&k, 1, 99), Errno::EINVAL.to_neg());
    }

    #[test]
    fn sigaction_installs_and_reports_old() {
        let k = kernel_with_task();
        let action = SigactionAbi {
            sa_handler: 0x4000,
            sa_flags: 0,
            sa_restorer: 0,
            sa_mask: 0,
        };
        let mut old = SigactionAbi::default_action();
        let rc = sys_sigaction(
            &k,
            SIGUSR1,
            &action as *const SigactionAbi as usize,
            &mut old as *mut SigactionAbi as usize,
        );
        assert_eq!(rc, 0);
        assert_eq!(old.sa_handler, lepton_syscall::signal::SIG_DFL);

        let mut old2 = SigactionAbi::default_action();
        let rc = sys_sigaction(&k, SIGUSR1, 0, &mut old2 as *mut SigactionAbi as usize);
        assert_eq!(rc, 0);
        assert_eq!(old2.sa_handler, 0x4000);
    }

    #[test]
    fn sigaction_rejects_kill() {
        let k = kernel_with_task();
        let action = SigactionAbi {
            sa_handler: 0x4000,
            sa_flags: 0,
            sa_restorer: 0,
            sa_mask: 0,
        };
        assert_eq!(
            sys_sigaction(&k, SIGKILL, &action as *const SigactionAbi as usize, 0),
            Errno::EINVAL.to_neg()
        );
    }

    #[test]
    fn procmask_block_unblock_roundtrip() {
        let k = kernel_with_task();
        let set = sigmask(SIGUSR1).unwrap() | sigmask(SIGUSR2).unwrap();
        assert_eq!(
            sys_sigprocmask(&k, SIG_BLOCK, &set as *const u32 as usize, 0),
            0
        );
        assert_eq!(k.current().signals.lock().blocked(), set);

        let part = sigmask(SIGUSR1).unwrap();
        let mut old = 0u32;
        assert_eq!(
            sys_sigprocmask(
                &k,
                SIG_UNBLOCK,
                &part as *const u32 as usize,
                &mut old as *mut u32 as usize
            ),
            0
        );
        assert_eq!(old, set);
        assert_eq!(
            k.current().signals.lock().blocked(),
            sigmask(SIGUSR2).unwrap()
        );
    }

    #[test]
    fn sigreturn_without_frame_is_einval() {
        let k = kernel_with_task();
        assert_eq!(sys_sigreturn(&k), Errno::EINVAL.to_neg());
    }

    #[test]
    fn pause_reports_restartnohand() {
        let k = kernel_with_task();
        k.current().signals.lock().raise(SIGUSR1);
        assert_eq!(sys_pause(&k), Errno::ERESTARTNOHAND.to_neg());
    }
}
