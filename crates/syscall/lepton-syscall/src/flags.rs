//! Flag bits and small constants crossing the syscall boundary.

use bitflags::bitflags;

bitflags! {
    /// `open(2)` flags, i386 values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open write-only.
        const WRONLY    = 0o1;
        /// Open read-write.
        const RDWR      = 0o2;
        /// Create the file if it does not exist.
        const CREAT     = 0o100;
        /// With `CREAT`, fail if the file already exists.
        const EXCL      = 0o200;
        /// Do not make the device the controlling tty.
        const NOCTTY    = 0o400;
        /// Truncate to zero length on open.
        const TRUNC     = 0o1000;
        /// Every write appends at end-of-file.
        const APPEND    = 0o2000;
        /// Reads and writes fail with `EAGAIN` instead of blocking.
        const NONBLOCK  = 0o4000;
        /// Fail with `ENOTDIR` unless the path names a directory.
        const DIRECTORY = 0o200000;
        /// Do not follow a trailing symlink.
        const NOFOLLOW  = 0o400000;
        /// Close the descriptor across `execve`.
        const CLOEXEC   = 0o2000000;
    }
}

impl OpenFlags {
    /// `O_RDONLY` is the absence of `WRONLY`/`RDWR`, so it cannot be a
    /// bitflag; access-mode checks go through these helpers instead.
    #[inline]
    pub fn readable(self) -> bool {
        !self.contains(Self::WRONLY)
    }

    /// True when the access mode permits writing.
    #[inline]
    pub fn writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

bitflags! {
    /// `poll(2)` / `select(2)` event mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u16 {
        /// Data may be read without blocking.
        const IN   = 0x001;
        /// Urgent data available.
        const PRI  = 0x002;
        /// Data may be written without blocking.
        const OUT  = 0x004;
        /// Error condition.
        const ERR  = 0x008;
        /// Hang-up (write end of a pipe closed, carrier lost).
        const HUP  = 0x010;
        /// Invalid descriptor.
        const NVAL = 0x020;
    }
}

bitflags! {
    /// `waitpid(2)` options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        /// Return immediately if no child has changed state.
        const NOHANG    = 1;
        /// Also report stopped children.
        const UNTRACED  = 2;
    }
}

bitflags! {
    /// `mmap(2)` protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapProt: u32 {
        /// Pages may be read.
        const READ  = 1;
        /// Pages may be written.
        const WRITE = 2;
        /// Pages may be executed.
        const EXEC  = 4;
    }
}

bitflags! {
    /// `mmap(2)` mapping flags (subset the kernel honors).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapFlags: u32 {
        /// Changes are shared between mappings.
        const SHARED    = 0x01;
        /// Changes are private (copy-on-write).
        const PRIVATE   = 0x02;
        /// Place the mapping exactly at the given address.
        const FIXED     = 0x10;
        /// Not backed by a file.
        const ANONYMOUS = 0x20;
    }
}

/// `lseek(2)` whence values.
pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

/// `fcntl(2)` commands.
pub const F_DUPFD: u32 = 0;
pub const F_GETFD: u32 = 1;
pub const F_SETFD: u32 = 2;
pub const F_GETFL: u32 = 3;
pub const F_SETFL: u32 = 4;

/// `FD_CLOEXEC` descriptor flag.
pub const FD_CLOEXEC: u32 = 1;

/// `access(2)` mode bits.
pub const F_OK: u32 = 0;
pub const X_OK: u32 = 1;
pub const W_OK: u32 = 2;
pub const R_OK: u32 = 4;

/// `*at(2)` special descriptor: resolve relative to the cwd.
pub const AT_FDCWD: i32 = -100;
/// `*at(2)` flag: operate on a symlink itself.
pub const AT_SYMLINK_NOFOLLOW: u32 = 0x100;
/// `unlinkat(2)` flag: behave like `rmdir`.
pub const AT_REMOVEDIR: u32 = 0x200;

/// File type bits in `mode_t`.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// `sys_ipc` multiplexer subcalls (SHM family; the rest are unimplemented).
pub const IPC_SHMAT: usize = 21;
pub const IPC_SHMDT: usize = 22;
pub const IPC_SHMGET: usize = 23;
pub const IPC_SHMCTL: usize = 24;

/// `shmctl` command: mark a segment for removal at last detach.
pub const IPC_RMID: u32 = 0;
/// `shmget` flag: create the segment if absent.
pub const IPC_CREAT: u32 = 0o1000;
/// `shmget` flag: with `IPC_CREAT`, fail if it already exists.
pub const IPC_EXCL: u32 = 0o2000;
