//! Process-management syscalls.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use lepton_syscall::abi::{Rusage, Timeval};
use lepton_syscall::flags::WaitOptions;
use lepton_syscall::{Errno, KResult};

use crate::config::HZ;
use crate::kernel::Kernel;
use crate::task::{exec, exit, fork};

use super::{ret, uaccess};

pub fn sys_exit(k: &Kernel, code: usize) -> isize {
    exit::sys_exit(k, code as u8);
    // Unreached once the arch layer switches away; the value feeds the
    // host harness where execution continues.
    0
}

pub fn sys_fork(k: &Kernel) -> isize {
    ret(fork::do_fork(k).map(|pid| pid as usize))
}

/// `clone` accepts the flag word but honors only the plain-fork shape;
/// the child-stack argument is recorded by the arch layer.
pub fn sys_clone(k: &Kernel, _flags: usize, _child_stack: usize) -> isize {
    ret(fork::do_fork(k).map(|pid| pid as usize))
}

pub fn sys_execve(k: &Kernel, path_ptr: usize, argv_ptr: usize, envp_ptr: usize) -> isize {
    let inner = || -> KResult<usize> {
        let path = uaccess::read_user_cstr(path_ptr)?;
        let argv = read_string_table(argv_ptr)?;
        let envp = read_string_table(envp_ptr)?;
        let image = exec::do_exec(k, &path, &argv, &envp)?;
        Ok(image.entry)
    };
    ret(inner())
}

/// Reads a NULL-terminated `char *[]` table.
fn read_string_table(mut addr: usize) -> KResult<Vec<String>> {
    let mut strings = Vec::new();
    if addr == 0 {
        return Ok(strings);
    }
    loop {
        let ptr: usize = uaccess::read_user(addr)?;
        if ptr == 0 {
            return Ok(strings);
        }
        strings.push(uaccess::read_user_cstr(ptr)?);
        addr += core::mem::size_of::<usize>();
        if strings.len() > 1024 {
            return Err(Errno::ERANGE);
        }
    }
}

pub fn sys_wait4(k: &Kernel, pid: isize, status_ptr: usize, options: usize) -> isize {
    let inner = || -> KResult<usize> {
        let options = WaitOptions::from_bits_truncate(options as u32);
        let (child, status) = exit::do_wait(k, pid as i32, options)?;
        if status_ptr != 0 && child != 0 {
            uaccess::write_user(status_ptr, &status)?;
        }
        Ok(child as usize)
    };
    ret(inner())
}

pub fn sys_getpid(k: &Kernel) -> isize {
    k.current().pid as isize
}

pub fn sys_getppid(k: &Kernel) -> isize {
    k.current().ppid() as isize
}

pub fn sys_getuid(k: &Kernel) -> isize {
    k.current().creds.lock().uid as isize
}

pub fn sys_geteuid(k: &Kernel) -> isize {
    k.current().creds.lock().euid as isize
}

pub fn sys_getgid(k: &Kernel) -> isize {
    k.current().creds.lock().gid as isize
}

pub fn sys_getegid(k: &Kernel) -> isize {
    k.current().creds.lock().egid as isize
}

/// `setuid`: root may become anyone; others only their real uid.
pub fn sys_setuid(k: &Kernel, uid: u32) -> isize {
    let task = k.current();
    let mut creds = task.creds.lock();
    if creds.euid == 0 {
        creds.uid = uid;
        creds.euid = uid;
        0
    } else if uid == creds.uid {
        creds.euid = uid;
        0
    } else {
        Errno::EPERM.to_neg()
    }
}

pub fn sys_setgid(k: &Kernel, gid: u32) -> isize {
    let task = k.current();
    let mut creds = task.creds.lock();
    if creds.euid == 0 {
        creds.gid = gid;
        creds.egid = gid;
        0
    } else if gid == creds.gid {
        creds.egid = gid;
        0
    } else {
        Errno::EPERM.to_neg()
    }
}

/// `setsid`: a non-leader starts a new session and group.
pub fn sys_setsid(k: &Kernel) -> isize {
    let task = k.current();
    let mut job = task.job.lock();
    if job.pgrp == task.pid {
        return Errno::EPERM.to_neg();
    }
    job.pgrp = task.pid;
    job.session = task.pid;
    task.pid as isize
}

pub fn sys_setpgid(k: &Kernel, pid: u32, pgid: u32) -> isize {
    let inner = || -> KResult<usize> {
        let me = k.current();
        let target = if pid == 0 {
            me.clone()
        } else {
            k.sched.task(pid).ok_or(Errno::ESRCH)?
        };
        // Only self or a child may be moved.
        if target.pid != me.pid && target.ppid() != me.pid {
            return Err(Errno::ESRCH);
        }
        let pgid = if pgid == 0 { target.pid } else { pgid };
        let mut job = target.job.lock();
        // Session leaders cannot change group.
        if job.session == target.pid {
            return Err(Errno::EPERM);
        }
        job.pgrp = pgid;
        Ok(0)
    };
    ret(inner())
}

pub fn sys_getpgid(k: &Kernel, pid: u32) -> isize {
    let inner = || -> KResult<usize> {
        let task = if pid == 0 {
            k.current()
        } else {
            k.sched.task(pid).ok_or(Errno::ESRCH)?
        };
        Ok(task.pgrp() as usize)
    };
    ret(inner())
}

pub fn sys_getsid(k: &Kernel, pid: u32) -> isize {
    let inner = || -> KResult<usize> {
        let task = if pid == 0 {
            k.current()
        } else {
            k.sched.task(pid).ok_or(Errno::ESRCH)?
        };
        Ok(task.session() as usize)
    };
    ret(inner())
}

/// `getrusage` for self or children (tick-granular times).
pub fn sys_getrusage(k: &Kernel, who: i32, usage_ptr: usize) -> isize {
    const RUSAGE_SELF: i32 = 0;
    const RUSAGE_CHILDREN: i32 = -1;
    let inner = || -> KResult<usize> {
        let task = k.current();
        let (utime, stime) = match who {
            RUSAGE_SELF => (
                task.utime.load(Ordering::Relaxed),
                task.stime.load(Ordering::Relaxed),
            ),
            RUSAGE_CHILDREN => {
                let relations = task.relations.lock();
                relations.children.iter().fold((0, 0), |(u, s), c| {
                    (
                        u + c.utime.load(Ordering::Relaxed),
                        s + c.stime.load(Ordering::Relaxed),
                    )
                })
            }
            _ => return Err(Errno::EINVAL),
        };
        let usage = Rusage {
            ru_utime: jiffies_to_timeval(utime),
            ru_stime: jiffies_to_timeval(stime),
            ..Rusage::default()
        };
        uaccess::write_user(usage_ptr, &usage)?;
        Ok(0)
    };
    ret(inner())
}

fn jiffies_to_timeval(jiffies: u64) -> Timeval {
    Timeval {
        tv_sec: (jiffies / HZ) as i32,
        tv_usec: ((jiffies % HZ) * (1_000_000 / HZ)) as i32,
    }
}

pub fn sys_set_tid_address(k: &Kernel, addr: usize) -> isize {
    let task = k.current();
    task.clear_child_tid.store(addr as u32, Ordering::Release);
    task.pid as isize
}

/// Minimal TLS slots: the descriptor is stored verbatim.
pub fn sys_set_thread_area(k: &Kernel, desc_ptr: usize) -> isize {
    let inner = || -> KResult<usize> {
        let desc: [u32; 4] = uaccess::read_user(desc_ptr)?;
        let task = k.current();
        let mut tls = task.tls.lock();
        // Entry number -1 asks for allocation.
        let requested = desc[0] as i32;
        let slot = if requested == -1 {
            0
        } else {
            requested as usize
        };
        if slot >= tls.len() {
            return Err(Errno::EINVAL);
        }
        tls[slot] = desc_ptr;
        if requested == -1 {
            let mut fixed = desc;
            fixed[0] = slot as u32;
            uaccess::write_user(desc_ptr, &fixed)?;
        }
        Ok(0)
    };
    ret(inner())
}

pub fn sys_get_thread_area(k: &Kernel, desc_ptr: usize) -> isize {
    let inner = || -> KResult<usize> {
        let desc: [u32; 4] = uaccess::read_user(desc_ptr)?;
        let task = k.current();
        let tls = task.tls.lock();
        let slot = desc[0] as usize;
        if slot >= tls.len() || tls[slot] == 0 {
            return Err(Errno::EINVAL);
        }
        Ok(0)
    };
    ret(inner())
}
