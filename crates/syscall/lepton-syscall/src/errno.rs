//! Kernel error numbers.
//!
//! Syscalls return a non-negative result on success or `-errno` on failure.
//! Inside the kernel, fallible operations return [`KResult`] and the
//! dispatch layer converts the error into the negative-return convention.

/// Error number, i386 values.
///
/// The two `ERESTART*` variants never escape to userspace: the syscall
/// return path rewrites them into either a transparent restart or
/// [`Errno::EINTR`], depending on the interrupted call and the handler's
/// `SA_RESTART` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted.
    EPERM = 1,
    /// No such file or directory.
    ENOENT = 2,
    /// No such process.
    ESRCH = 3,
    /// Interrupted system call.
    EINTR = 4,
    /// I/O error.
    EIO = 5,
    /// Bad file descriptor.
    EBADF = 9,
    /// No child processes.
    ECHILD = 10,
    /// Operation would block.
    EAGAIN = 11,
    /// Out of memory.
    ENOMEM = 12,
    /// Permission denied.
    EACCES = 13,
    /// Bad address.
    EFAULT = 14,
    /// File exists.
    EEXIST = 17,
    /// No such device.
    ENODEV = 19,
    /// Not a directory.
    ENOTDIR = 20,
    /// Is a directory.
    EISDIR = 21,
    /// Invalid argument.
    EINVAL = 22,
    /// Too many open files in the system.
    ENFILE = 23,
    /// Too many open files in this task.
    EMFILE = 24,
    /// Inappropriate ioctl for device.
    ENOTTY = 25,
    /// Illegal seek.
    ESPIPE = 29,
    /// Read-only filesystem.
    EROFS = 30,
    /// Too many links.
    EMLINK = 31,
    /// Broken pipe.
    EPIPE = 32,
    /// Result out of range.
    ERANGE = 34,
    /// Function not implemented.
    ENOSYS = 38,
    /// Directory not empty.
    ENOTEMPTY = 39,
    /// Too many levels of symbolic links.
    ELOOP = 40,
    /// Address family not supported.
    EAFNOSUPPORT = 97,
    /// Operation timed out.
    ETIMEDOUT = 110,
    /// Restart the syscall (internal, converted on return).
    ERESTARTSYS = 512,
    /// Restart unless a handler ran (internal, converted on return).
    ERESTARTNOHAND = 514,
}

impl Errno {
    /// Returns the value in the negative-return syscall convention.
    #[inline]
    pub const fn to_neg(self) -> isize {
        -(self as i32 as isize)
    }

    /// True for the internal restart variants that must never reach
    /// userspace unconverted.
    #[inline]
    pub const fn is_restart(self) -> bool {
        matches!(self, Self::ERESTARTSYS | Self::ERESTARTNOHAND)
    }
}

/// Result type used by fallible kernel operations.
pub type KResult<T> = Result<T, Errno>;

/// Folds a [`KResult`] into the signed syscall return convention.
#[inline]
pub fn to_ret(result: KResult<usize>) -> isize {
    match result {
        Ok(v) => v as isize,
        Err(e) => e.to_neg(),
    }
}
