//! Inodes and the inode cache.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::any::Any;

use lepton_core::sync::SpinLock;
use lepton_syscall::abi::DevT;
use lepton_syscall::flags::{S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG};

use super::{FileOps, InodeOps, Superblock};

/// Mutable inode metadata, guarded by the inode's lock.
#[derive(Debug, Clone)]
pub struct InodeMeta {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Device identity for device-special inodes.
    pub rdev: DevT,
}

impl InodeMeta {
    /// Metadata for a fresh inode of the given mode.
    pub fn new(mode: u32) -> Self {
        Self {
            mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            rdev: DevT::default(),
        }
    }
}

/// Filesystem-independent file metadata record.
///
/// The `private` slot carries the owning filesystem's per-inode state
/// (tmpfs keeps its data pages there). External references are counted
/// by the `Arc`; the cache holds weak references so an inode leaves
/// memory exactly when its last user lets go.
pub struct Inode {
    pub sb: Weak<Superblock>,
    pub ino: u64,
    pub meta: SpinLock<InodeMeta>,
    pub iops: Arc<dyn InodeOps>,
    pub fops: Arc<dyn FileOps>,
    pub private: SpinLock<Option<Box<dyn Any + Send>>>,
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inode").field("ino", &self.ino).finish()
    }
}

impl Inode {
    /// Builds an inode bound to `sb`.
    pub fn new(
        sb: &Arc<Superblock>,
        ino: u64,
        meta: InodeMeta,
        iops: Arc<dyn InodeOps>,
        fops: Arc<dyn FileOps>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sb: Arc::downgrade(sb),
            ino,
            meta: SpinLock::new(meta),
            iops,
            fops,
            private: SpinLock::new(None),
        })
    }

    /// Builds an inode belonging to no filesystem (anonymous pipes).
    pub fn anonymous(meta: InodeMeta, iops: Arc<dyn InodeOps>, fops: Arc<dyn FileOps>) -> Arc<Self> {
        Arc::new(Self {
            sb: Weak::new(),
            ino: 0,
            meta: SpinLock::new(meta),
            iops,
            fops,
            private: SpinLock::new(None),
        })
    }

    /// The containing filesystem's device identity.
    pub fn dev(&self) -> DevT {
        self.sb.upgrade().map(|sb| sb.dev).unwrap_or_default()
    }

    /// Current mode bits.
    pub fn mode(&self) -> u32 {
        self.meta.lock().mode
    }

    /// Current size in bytes.
    pub fn size(&self) -> i64 {
        self.meta.lock().size
    }

    pub fn is_dir(&self) -> bool {
        self.mode() & S_IFMT == S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.mode() & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode() & S_IFMT == S_IFLNK
    }

    pub fn is_chrdev(&self) -> bool {
        self.mode() & S_IFMT == S_IFCHR
    }

    pub fn is_fifo(&self) -> bool {
        self.mode() & S_IFMT == S_IFIFO
    }

    /// Checks `rwx`-style access for the given credentials. Root
    /// bypasses everything except execute on non-executable files.
    pub fn permission(&self, euid: u32, egid: u32, want: u32) -> bool {
        let meta = self.meta.lock();
        if euid == 0 {
            // Root needs at least one x bit to execute.
            if want & 0o1 != 0 {
                return meta.mode & 0o111 != 0 || meta.mode & S_IFMT == S_IFDIR;
            }
            return true;
        }
        let shift = if euid == meta.uid {
            6
        } else if egid == meta.gid {
            3
        } else {
            0
        };
        (meta.mode >> shift) & want & 0o7 == want & 0o7
    }
}

/// Cache of live inodes keyed by (filesystem device, inode number).
///
/// Holds weak references: hits revive the existing `Arc`, and dead
/// entries are pruned opportunistically on insert.
pub struct InodeCache {
    map: SpinLock<BTreeMap<(u32, u64), Weak<Inode>>>,
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeCache {
    pub const fn new() -> Self {
        Self {
            map: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Looks up a cached inode.
    pub fn get(&self, dev: DevT, ino: u64) -> Option<Arc<Inode>> {
        self.map.lock().get(&(dev.0, ino)).and_then(Weak::upgrade)
    }

    /// Inserts an inode, pruning dead entries as a side effect.
    pub fn insert(&self, inode: &Arc<Inode>) {
        let mut map = self.map.lock();
        map.retain(|_, w| w.strong_count() > 0);
        map.insert((inode.dev().0, inode.ino), Arc::downgrade(inode));
    }

    /// Drops a cache entry (the inode itself lives until its last user).
    pub fn remove(&self, dev: DevT, ino: u64) {
        self.map.lock().remove(&(dev.0, ino));
    }

    /// Number of live cached inodes.
    pub fn live(&self) -> usize {
        self.map
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}
