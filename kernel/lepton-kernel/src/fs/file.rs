//! Open files and per-task descriptor tables.
//!
//! An open [`File`] is shared: `dup` and `fork` hand out more references
//! to the same object, so the position and status flags are common to
//! every descriptor that names it. The descriptor table maps dense small
//! integers to files plus the per-descriptor close-on-exec bit.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

use lepton_core::sync::SpinLock;
use lepton_syscall::flags::OpenFlags;
use lepton_syscall::{Errno, KResult};

use crate::config::NR_OPEN;

use super::{Dentry, FileOps, Inode};

/// An open file description.
pub struct File {
    pub inode: Arc<Inode>,
    /// The name it was opened under (pipes and the like have none).
    pub dentry: Option<Arc<Dentry>>,
    pub fops: Arc<dyn FileOps>,
    flags: SpinLock<OpenFlags>,
    pos: SpinLock<i64>,
    pub private: SpinLock<Option<Box<dyn Any + Send>>>,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File").finish()
    }
}

impl File {
    /// Opens `inode` with the inode's default file operations.
    pub fn new(inode: Arc<Inode>, dentry: Option<Arc<Dentry>>, flags: OpenFlags) -> Arc<Self> {
        let fops = inode.fops.clone();
        Arc::new(Self {
            inode,
            dentry,
            fops,
            flags: SpinLock::new(flags),
            pos: SpinLock::new(0),
            private: SpinLock::new(None),
        })
    }

    /// Opens `inode` with explicit file operations (pipes, devices).
    pub fn with_ops(
        inode: Arc<Inode>,
        fops: Arc<dyn FileOps>,
        flags: OpenFlags,
    ) -> Arc<Self> {
        Arc::new(Self {
            inode,
            dentry: None,
            fops,
            flags: SpinLock::new(flags),
            pos: SpinLock::new(0),
            private: SpinLock::new(None),
        })
    }

    /// Current status flags.
    pub fn flags(&self) -> OpenFlags {
        *self.flags.lock()
    }

    /// `F_SETFL`: only the status flags may change, not the access mode.
    pub fn set_status_flags(&self, new: OpenFlags) {
        const SETTABLE: OpenFlags = OpenFlags::APPEND.union(OpenFlags::NONBLOCK);
        let mut flags = self.flags.lock();
        *flags = (*flags - SETTABLE) | (new & SETTABLE);
    }

    /// Current file position.
    pub fn pos(&self) -> i64 {
        *self.pos.lock()
    }

    /// Moves the file position.
    pub fn set_pos(&self, pos: i64) {
        *self.pos.lock() = pos;
    }

    /// True when reads are permitted by the access mode.
    pub fn readable(&self) -> bool {
        self.flags().readable()
    }

    /// True when writes are permitted by the access mode.
    pub fn writable(&self) -> bool {
        self.flags().writable()
    }
}

/// One descriptor slot.
#[derive(Clone)]
struct FdEntry {
    file: Arc<File>,
    cloexec: bool,
}

/// Per-task file descriptor table.
pub struct FdTable {
    slots: Vec<Option<FdEntry>>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Allocates the lowest free descriptor at or above `min`.
    pub fn alloc_from(&mut self, min: usize, file: Arc<File>, cloexec: bool) -> KResult<usize> {
        let mut fd = min;
        loop {
            if fd >= NR_OPEN {
                return Err(Errno::EMFILE);
            }
            if fd >= self.slots.len() {
                self.slots.resize(fd + 1, None);
            }
            if self.slots[fd].is_none() {
                self.slots[fd] = Some(FdEntry { file, cloexec });
                return Ok(fd);
            }
            fd += 1;
        }
    }

    /// Allocates the lowest free descriptor.
    pub fn alloc(&mut self, file: Arc<File>, cloexec: bool) -> KResult<usize> {
        self.alloc_from(0, file, cloexec)
    }

    /// Installs `file` at exactly `fd` (dup2); any previous occupant is
    /// returned so the caller can run its release hook.
    pub fn install_at(
        &mut self,
        fd: usize,
        file: Arc<File>,
        cloexec: bool,
    ) -> KResult<Option<Arc<File>>> {
        if fd >= NR_OPEN {
            return Err(Errno::EBADF);
        }
        if fd >= self.slots.len() {
            self.slots.resize(fd + 1, None);
        }
        let old = self.slots[fd].take().map(|e| e.file);
        self.slots[fd] = Some(FdEntry { file, cloexec });
        Ok(old)
    }

    /// Resolves a descriptor.
    pub fn get(&self, fd: usize) -> KResult<Arc<File>> {
        self.slots
            .get(fd)
            .and_then(|s| s.as_ref())
            .map(|e| e.file.clone())
            .ok_or(Errno::EBADF)
    }

    /// Removes a descriptor, returning its file.
    pub fn close(&mut self, fd: usize) -> KResult<Arc<File>> {
        let entry = self
            .slots
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(Errno::EBADF)?;
        Ok(entry.file)
    }

    /// Reads the close-on-exec bit.
    pub fn cloexec(&self, fd: usize) -> KResult<bool> {
        self.slots
            .get(fd)
            .and_then(|s| s.as_ref())
            .map(|e| e.cloexec)
            .ok_or(Errno::EBADF)
    }

    /// Sets the close-on-exec bit.
    pub fn set_cloexec(&mut self, fd: usize, on: bool) -> KResult<()> {
        self.slots
            .get_mut(fd)
            .and_then(|s| s.as_mut())
            .map(|e| e.cloexec = on)
            .ok_or(Errno::EBADF)
    }

    /// Removes and returns every descriptor marked close-on-exec.
    pub fn take_cloexec(&mut self) -> Vec<Arc<File>> {
        let mut closed = Vec::new();
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|e| e.cloexec) {
                closed.push(slot.take().expect("checked above").file);
            }
        }
        closed
    }

    /// Removes and returns every open descriptor (exit teardown).
    pub fn take_all(&mut self) -> Vec<Arc<File>> {
        self.slots
            .iter_mut()
            .filter_map(Option::take)
            .map(|e| e.file)
            .collect()
    }

    /// Duplicate for `fork`: same files, same cloexec bits.
    pub fn clone_for_fork(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Descriptors currently open (ascending).
    pub fn open_fds(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, s)| s.as_ref().map(|_| fd))
            .collect()
    }
}
