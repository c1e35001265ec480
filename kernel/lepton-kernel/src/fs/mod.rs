//! Virtual filesystem layer.
//!
//! Filesystem drivers plug in through three capability sets: file-level
//! [`FileOps`], namespace-level [`InodeOps`] and per-mount [`SuperOps`],
//! registered under a [`FileSystemType`]. The VFS owns name resolution,
//! the dentry and inode caches, the mount table, descriptor tables and
//! the buffer cache; drivers own everything behind those vtables.

pub mod buffer;
pub mod chrdev;
pub mod dcache;
pub mod file;
pub mod inode;
pub mod mount;
pub mod namei;
pub mod poll;
pub mod read_write;
pub mod tmpfs;

use alloc::string::String;
use alloc::sync::Arc;

use lepton_syscall::abi::{DevT, Statfs64};
use lepton_syscall::flags::PollEvents;
use lepton_syscall::{Errno, KResult};

use crate::kernel::Kernel;

pub use dcache::Dentry;
pub use file::{FdTable, File};
pub use inode::{Inode, InodeMeta};
pub use mount::{Superblock, Vfs};
pub use poll::SelectTable;

/// One record returned by a directory read.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub dtype: u8,
}

/// File-level operations: everything reachable through an open file.
///
/// `pos` is passed in by the VFS; implementations never touch the file
/// position themselves (the dispatch layer advances it).
pub trait FileOps: Send + Sync {
    /// Type-specific open hook (e.g. a tty becoming a controlling
    /// terminal, a char driver claiming its minor).
    fn open(&self, _k: &Kernel, _file: &File) -> KResult<()> {
        Ok(())
    }

    /// Called when the last descriptor for the open file goes away.
    fn release(&self, _k: &Kernel, _file: &File) {}

    /// Reads up to `buf.len()` bytes at `pos`. May block.
    fn read(&self, _k: &Kernel, _file: &File, _buf: &mut [u8], _pos: i64) -> KResult<usize> {
        Err(Errno::EINVAL)
    }

    /// Writes `buf` at `pos`. May block.
    fn write(&self, _k: &Kernel, _file: &File, _buf: &[u8], _pos: i64) -> KResult<usize> {
        Err(Errno::EINVAL)
    }

    /// Validates a seek target; the dispatch layer computes it. Devices
    /// without positions reject with `ESPIPE`.
    fn lseek(&self, _k: &Kernel, _file: &File, new_pos: i64) -> KResult<i64> {
        Ok(new_pos)
    }

    /// Returns the directory entry at `index`, or `None` past the end.
    fn readdir(&self, _k: &Kernel, _file: &File, _index: usize) -> KResult<Option<DirEntry>> {
        Err(Errno::ENOTDIR)
    }

    /// Device-special control.
    fn ioctl(&self, _k: &Kernel, _file: &File, _cmd: u32, _arg: usize) -> KResult<usize> {
        Err(Errno::ENOTTY)
    }

    /// Reports readiness. When `table` is given, the implementation must
    /// also register the caller on the wait queues it would wake.
    fn poll(&self, _k: &Kernel, _file: &File, _table: Option<&mut SelectTable>) -> PollEvents {
        PollEvents::IN | PollEvents::OUT
    }

    /// Maps the file into the calling task's address space.
    fn mmap(&self, _k: &Kernel, _file: &File, _addr: usize, _len: usize) -> KResult<usize> {
        Err(Errno::ENODEV)
    }
}

/// Namespace-level operations on an inode (mostly directories).
pub trait InodeOps: Send + Sync {
    /// Resolves `name` in the directory `dir`.
    fn lookup(&self, _k: &Kernel, _dir: &Arc<Inode>, _name: &str) -> KResult<Arc<Inode>> {
        Err(Errno::ENOTDIR)
    }

    /// Creates a regular file.
    fn create(&self, _k: &Kernel, _dir: &Arc<Inode>, _name: &str, _mode: u32) -> KResult<Arc<Inode>> {
        Err(Errno::EPERM)
    }

    /// Creates a device node, fifo or socket.
    fn mknod(
        &self,
        _k: &Kernel,
        _dir: &Arc<Inode>,
        _name: &str,
        _mode: u32,
        _dev: DevT,
    ) -> KResult<Arc<Inode>> {
        Err(Errno::EPERM)
    }

    /// Creates a directory.
    fn mkdir(&self, _k: &Kernel, _dir: &Arc<Inode>, _name: &str, _mode: u32) -> KResult<Arc<Inode>> {
        Err(Errno::EPERM)
    }

    /// Removes an empty directory.
    fn rmdir(&self, _k: &Kernel, _dir: &Arc<Inode>, _name: &str) -> KResult<()> {
        Err(Errno::EPERM)
    }

    /// Removes a non-directory name.
    fn unlink(&self, _k: &Kernel, _dir: &Arc<Inode>, _name: &str) -> KResult<()> {
        Err(Errno::EPERM)
    }

    /// Adds a hard link to `src` under `dir`/`name`.
    fn link(&self, _k: &Kernel, _src: &Arc<Inode>, _dir: &Arc<Inode>, _name: &str) -> KResult<()> {
        Err(Errno::EPERM)
    }

    /// Creates a symlink containing `target`.
    fn symlink(&self, _k: &Kernel, _dir: &Arc<Inode>, _name: &str, _target: &str) -> KResult<()> {
        Err(Errno::EPERM)
    }

    /// Reads a symlink's target.
    fn readlink(&self, _k: &Kernel, _inode: &Arc<Inode>) -> KResult<String> {
        Err(Errno::EINVAL)
    }

    /// Moves `old_dir`/`old_name` to `new_dir`/`new_name`.
    fn rename(
        &self,
        _k: &Kernel,
        _old_dir: &Arc<Inode>,
        _old_name: &str,
        _new_dir: &Arc<Inode>,
        _new_name: &str,
    ) -> KResult<()> {
        Err(Errno::EPERM)
    }

    /// Sets the file length.
    fn truncate(&self, _k: &Kernel, _inode: &Arc<Inode>, _size: i64) -> KResult<()> {
        Err(Errno::EPERM)
    }
}

/// Per-mount operations a filesystem provides on its superblock.
pub trait SuperOps: Send + Sync {
    /// Materializes the inode numbered `ino`.
    fn read_inode(&self, k: &Kernel, sb: &Arc<Superblock>, ino: u64) -> KResult<Arc<Inode>>;

    /// Flushes a dirty inode to backing store.
    fn write_inode(&self, _k: &Kernel, _inode: &Inode) -> KResult<()> {
        Ok(())
    }

    /// Last-reference hook: the inode is leaving the cache.
    fn put_inode(&self, _k: &Kernel, _inode: &Inode) {}

    /// Filesystem statistics for `statfs`.
    fn statfs(&self, k: &Kernel, sb: &Superblock) -> KResult<Statfs64>;
}

/// A registered filesystem driver.
pub trait FileSystemType: Send + Sync {
    /// The name `mount` selects the driver by.
    fn name(&self) -> &'static str;

    /// Builds a superblock for an instance on `dev`.
    fn read_super(&self, k: &Kernel, dev: DevT) -> KResult<Arc<Superblock>>;
}
