//! System-call dispatch.
//!
//! The arch trap stub decodes the `int 0x80` frame into a number plus
//! six arguments and calls [`dispatch`]. Results follow the Unix
//! convention: non-negative success value or a negative errno. The
//! internal restart errnos never escape — [`complete`] folds them into
//! a transparent restart or `EINTR` depending on the pending signal's
//! `SA_RESTART` flag.

pub mod info;
pub mod ipc;
pub mod mm;
pub mod process;
pub mod signal;
pub mod time;
pub mod uaccess;
pub mod vfs;

use lepton_syscall::{errno::to_ret, nr, Errno};

use crate::kernel::Kernel;

/// What the trap stub should do after a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Write this value into the return register.
    Return(isize),
    /// Re-execute the same syscall (rewind the trap frame).
    Restart,
}

/// Routes one syscall. Unknown numbers return `-ENOSYS`.
pub fn dispatch(k: &Kernel, nr: usize, a: [usize; 6]) -> isize {
    let ret = match nr {
        // Process lifecycle.
        nr::EXIT => process::sys_exit(k, a[0]),
        nr::FORK => process::sys_fork(k),
        nr::CLONE => process::sys_clone(k, a[0], a[1]),
        nr::EXECVE => process::sys_execve(k, a[0], a[1], a[2]),
        nr::WAIT4 => process::sys_wait4(k, a[0] as isize, a[1], a[2]),
        nr::GETPID => process::sys_getpid(k),
        nr::GETPPID => process::sys_getppid(k),
        nr::GETUID => process::sys_getuid(k),
        nr::GETEUID => process::sys_geteuid(k),
        nr::GETGID => process::sys_getgid(k),
        nr::GETEGID => process::sys_getegid(k),
        nr::SETUID => process::sys_setuid(k, a[0] as u32),
        nr::SETGID => process::sys_setgid(k, a[0] as u32),
        nr::SETSID => process::sys_setsid(k),
        nr::SETPGID => process::sys_setpgid(k, a[0] as u32, a[1] as u32),
        nr::GETPGID => process::sys_getpgid(k, a[0] as u32),
        nr::GETPGRP => process::sys_getpgid(k, 0),
        nr::GETSID => process::sys_getsid(k, a[0] as u32),
        nr::GETRUSAGE => process::sys_getrusage(k, a[0] as i32, a[1]),
        nr::SET_TID_ADDRESS => process::sys_set_tid_address(k, a[0]),
        nr::SET_THREAD_AREA => process::sys_set_thread_area(k, a[0]),
        nr::GET_THREAD_AREA => process::sys_get_thread_area(k, a[0]),
        nr::PTRACE => Errno::ENOSYS.to_neg(),

        // Signals.
        nr::KILL => signal::sys_kill(k, a[0] as i32, a[1] as u32),
        nr::TKILL => signal::sys_tkill(k, a[0] as u32, a[1] as u32),
        nr::SIGACTION | nr::RT_SIGACTION => signal::sys_sigaction(k, a[0] as u32, a[1], a[2]),
        nr::SIGPROCMASK | nr::RT_SIGPROCMASK => {
            signal::sys_sigprocmask(k, a[0] as u32, a[1], a[2])
        }
        nr::SIGRETURN | nr::RT_SIGRETURN => signal::sys_sigreturn(k),
        nr::PAUSE => signal::sys_pause(k),

        // Time.
        nr::NANOSLEEP => time::sys_nanosleep(k, a[0], a[1]),
        nr::SLEEP => time::sys_sleep(k, a[0]),
        nr::CLOCK_GETTIME64 => time::sys_clock_gettime64(k, a[0] as u32, a[1]),

        // Files.
        nr::OPEN => vfs::sys_open(k, a[0], a[1] as u32, a[2] as u32),
        nr::OPENAT => vfs::sys_openat(k, a[0] as i32, a[1], a[2] as u32, a[3] as u32),
        nr::CREAT => vfs::sys_creat(k, a[0], a[1] as u32),
        nr::CLOSE => vfs::sys_close(k, a[0]),
        nr::READ => vfs::sys_read(k, a[0], a[1], a[2]),
        nr::WRITE => vfs::sys_write(k, a[0], a[1], a[2]),
        nr::READV => vfs::sys_readv(k, a[0], a[1], a[2]),
        nr::WRITEV => vfs::sys_writev(k, a[0], a[1], a[2]),
        nr::PREAD64 => vfs::sys_pread64(k, a[0], a[1], a[2], a[3] as i64),
        nr::LSEEK => vfs::sys_lseek(k, a[0], a[1] as isize, a[2] as u32),
        nr::LLSEEK => vfs::sys_llseek(k, a[0], a[1], a[2], a[3], a[4] as u32),
        nr::DUP => vfs::sys_dup(k, a[0]),
        nr::DUP2 => vfs::sys_dup2(k, a[0], a[1]),
        nr::DUP3 => vfs::sys_dup3(k, a[0], a[1], a[2] as u32),
        nr::FCNTL => vfs::sys_fcntl(k, a[0], a[1] as u32, a[2]),
        nr::IOCTL => vfs::sys_ioctl(k, a[0], a[1] as u32, a[2]),
        nr::STAT | nr::STAT64 => vfs::sys_stat64(k, a[0], a[1], true),
        nr::LSTAT | nr::LSTAT64 => vfs::sys_stat64(k, a[0], a[1], false),
        nr::FSTAT | nr::FSTAT64 => vfs::sys_fstat64(k, a[0], a[1]),
        nr::FSTATAT64 => vfs::sys_fstatat64(k, a[0] as i32, a[1], a[2], a[3] as u32),
        nr::STATX => vfs::sys_statx(k, a[0] as i32, a[1], a[2] as u32, a[3] as u32, a[4]),
        nr::STATFS | nr::STATFS64 => vfs::sys_statfs64(k, a[0], a[1]),
        nr::FSTATFS64 => vfs::sys_fstatfs64(k, a[0], a[1]),
        nr::ACCESS => vfs::sys_access(k, a[0], a[1] as u32),
        nr::FACCESSAT => vfs::sys_faccessat(k, a[0] as i32, a[1], a[2] as u32),
        nr::CHDIR => vfs::sys_chdir(k, a[0]),
        nr::FCHDIR => vfs::sys_fchdir(k, a[0]),
        nr::GETCWD => vfs::sys_getcwd(k, a[0], a[1]),
        nr::MKDIR => vfs::sys_mkdir(k, a[0], a[1] as u32),
        nr::MKDIRAT => vfs::sys_mkdirat(k, a[0] as i32, a[1], a[2] as u32),
        nr::RMDIR => vfs::sys_rmdir(k, a[0]),
        nr::UNLINK => vfs::sys_unlink(k, a[0]),
        nr::UNLINKAT => vfs::sys_unlinkat(k, a[0] as i32, a[1], a[2] as u32),
        nr::RENAME | nr::RENAMEAT => match nr {
            nr::RENAME => vfs::sys_rename(k, a[0], a[1]),
            _ => vfs::sys_renameat(k, a[0] as i32, a[1], a[2] as i32, a[3]),
        },
        nr::LINK => vfs::sys_link(k, a[0], a[1]),
        nr::LINKAT => vfs::sys_linkat(k, a[0] as i32, a[1], a[2] as i32, a[3]),
        nr::SYMLINK => vfs::sys_symlink(k, a[0], a[1]),
        nr::SYMLINKAT => vfs::sys_symlinkat(k, a[0], a[1] as i32, a[2]),
        nr::READLINK => vfs::sys_readlink(k, a[0], a[1], a[2]),
        nr::READLINKAT => vfs::sys_readlinkat(k, a[0] as i32, a[1], a[2], a[3]),
        nr::CHMOD => vfs::sys_chmod(k, a[0], a[1] as u32),
        nr::FCHMOD => vfs::sys_fchmod(k, a[0], a[1] as u32),
        nr::FCHMODAT => vfs::sys_fchmodat(k, a[0] as i32, a[1], a[2] as u32),
        nr::CHOWN => vfs::sys_chown(k, a[0], a[1] as u32, a[2] as u32),
        nr::FCHOWN => vfs::sys_fchown(k, a[0], a[1] as u32, a[2] as u32),
        nr::FCHOWNAT => vfs::sys_fchownat(k, a[0] as i32, a[1], a[2] as u32, a[3] as u32),
        nr::TRUNCATE | nr::TRUNCATE64 => vfs::sys_truncate64(k, a[0], a[1] as i64),
        nr::UTIMENSAT => vfs::sys_utimensat(k, a[0] as i32, a[1], a[2]),
        nr::MKNOD => vfs::sys_mknod(k, a[0], a[1] as u32, a[2] as u32),
        nr::MKNODAT => vfs::sys_mknodat(k, a[0] as i32, a[1], a[2] as u32, a[3] as u32),
        nr::GETDENTS64 => vfs::sys_getdents64(k, a[0], a[1], a[2]),
        nr::PIPE => vfs::sys_pipe(k, a[0], 0),
        nr::PIPE2 => vfs::sys_pipe(k, a[0], a[1] as u32),
        nr::POLL => vfs::sys_poll(k, a[0], a[1], a[2] as i32),
        nr::SELECT => vfs::sys_select(k, a[0], a[1], a[2], a[3], a[4]),
        nr::UMASK => vfs::sys_umask(k, a[0] as u32),

        // Memory.
        nr::BRK => mm::sys_brk(k, a[0]),
        nr::SBRK => mm::sys_sbrk(k, a[0] as isize),
        nr::MMAP | nr::MMAP2 => {
            mm::sys_mmap(k, a[0], a[1], a[2] as u32, a[3] as u32, a[4] as i32, a[5])
        }
        nr::MUNMAP => mm::sys_munmap(k, a[0], a[1]),
        nr::MREMAP => mm::sys_mremap(k, a[0], a[1], a[2]),

        // System V IPC multiplexer.
        nr::IPC => ipc::sys_ipc(k, a[0], a[1], a[2], a[3], a[4]),

        // Information.
        nr::UNAME => info::sys_uname(k, a[0]),
        nr::SYSINFO => info::sys_sysinfo(k, a[0]),
        nr::GETRANDOM => info::sys_getrandom(k, a[0], a[1], a[2] as u32),

        // Sockets: the core carries no network stack.
        nr::SOCKET => Errno::EAFNOSUPPORT.to_neg(),
        nr::BIND | nr::CONNECT | nr::SENDTO | nr::RECVFROM | nr::GETSOCKNAME
        | nr::GETSOCKOPT | nr::SETSOCKOPT => Errno::ENOSYS.to_neg(),

        _ => Errno::ENOSYS.to_neg(),
    };
    ret
}

/// Finalizes a syscall return at the user boundary.
///
/// `ERESTARTSYS` restarts when the interrupting signal's handler has
/// `SA_RESTART` (or no handler will run); `ERESTARTNOHAND` restarts
/// only when no handler will run. Everything else passes through.
pub fn complete(k: &Kernel, ret: isize) -> Outcome {
    let restartsys = Errno::ERESTARTSYS.to_neg();
    let restartnohand = Errno::ERESTARTNOHAND.to_neg();
    if ret != restartsys && ret != restartnohand {
        return Outcome::Return(ret);
    }

    let task = k.current();
    let pending = task.signals.lock().peek_deliverable();
    let handler_runs = pending.is_some_and(|(_, action)| {
        action.sa_handler != lepton_syscall::signal::SIG_DFL
            && action.sa_handler != lepton_syscall::signal::SIG_IGN
    });

    if !handler_runs {
        return Outcome::Restart;
    }
    if ret == restartsys {
        let sa_restart = pending
            .is_some_and(|(_, action)| action.sa_flags & lepton_syscall::signal::SA_RESTART != 0);
        if sa_restart {
            return Outcome::Restart;
        }
    }
    Outcome::Return(Errno::EINTR.to_neg())
}

/// Convenience wrapper used by handlers returning `KResult<usize>`.
#[inline]
pub(crate) fn ret(result: lepton_syscall::KResult<usize>) -> isize {
    to_ret(result)
}
