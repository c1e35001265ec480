//! Superblocks, the mount table and filesystem-type registry.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

use lepton_core::sync::SpinLock;
use lepton_syscall::abi::DevT;
use lepton_syscall::{Errno, KResult};

use crate::kernel::Kernel;

use super::inode::InodeCache;
use super::{Dentry, FileSystemType, SuperOps};

/// In-kernel handle for one mounted filesystem instance.
pub struct Superblock {
    pub dev: DevT,
    pub fstype: &'static str,
    pub blocksize: u32,
    pub ops: Arc<dyn SuperOps>,
    /// Inode number of the filesystem root.
    pub root_ino: u64,
    root: SpinLock<Option<Arc<Dentry>>>,
    /// The dentry this mount covers (None for the root filesystem).
    covered: SpinLock<Option<Arc<Dentry>>>,
    pub private: SpinLock<Option<Box<dyn Any + Send>>>,
}

impl Superblock {
    /// Creates a superblock; the root dentry is attached during mount.
    pub fn new(dev: DevT, fstype: &'static str, blocksize: u32, root_ino: u64, ops: Arc<dyn SuperOps>) -> Arc<Self> {
        Arc::new(Self {
            dev,
            fstype,
            blocksize,
            ops,
            root_ino,
            root: SpinLock::new(None),
            covered: SpinLock::new(None),
            private: SpinLock::new(None),
        })
    }

    /// The mount's root dentry.
    pub fn root(&self) -> Option<Arc<Dentry>> {
        self.root.lock().clone()
    }

    /// The dentry this mount sits on.
    pub fn covered(&self) -> Option<Arc<Dentry>> {
        self.covered.lock().clone()
    }

    pub(super) fn set_root(&self, d: Arc<Dentry>) {
        *self.root.lock() = Some(d);
    }

    pub(super) fn set_covered(&self, d: Option<Arc<Dentry>>) {
        *self.covered.lock() = d;
    }
}

/// The VFS proper: registered drivers, active mounts and the caches.
pub struct Vfs {
    fstypes: SpinLock<Vec<Arc<dyn FileSystemType>>>,
    mounts: SpinLock<Vec<Arc<Superblock>>>,
    root: SpinLock<Option<Arc<Dentry>>>,
    pub icache: InodeCache,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            fstypes: SpinLock::new(Vec::new()),
            mounts: SpinLock::new(Vec::new()),
            root: SpinLock::new(None),
            icache: InodeCache::new(),
        }
    }

    /// Registers a filesystem driver.
    pub fn register_filesystem(&self, fs: Arc<dyn FileSystemType>) {
        lepton_core::kinfo!("vfs: registered filesystem {}", fs.name());
        self.fstypes.lock().push(fs);
    }

    /// Finds a registered driver by name.
    pub fn find_filesystem(&self, name: &str) -> KResult<Arc<dyn FileSystemType>> {
        self.fstypes
            .lock()
            .iter()
            .find(|f| f.name() == name)
            .cloned()
            .ok_or(Errno::ENODEV)
    }

    /// The system root dentry.
    pub fn root(&self) -> KResult<Arc<Dentry>> {
        self.root.lock().clone().ok_or(Errno::ENOENT)
    }

    /// Mounts the root filesystem. Must happen before any path walk.
    pub fn mount_root(&self, k: &Kernel, fstype: &str, dev: DevT) -> KResult<Arc<Dentry>> {
        let fs = self.find_filesystem(fstype)?;
        let sb = fs.read_super(k, dev)?;
        let root_inode = sb.ops.read_inode(k, &sb, sb.root_ino)?;
        self.icache.insert(&root_inode);

        let root = Dentry::new("", Some(root_inode));
        sb.set_root(root.clone());
        *self.root.lock() = Some(root.clone());
        self.mounts.lock().push(sb);
        lepton_core::kinfo!("vfs: mounted {} as root", fstype);
        Ok(root)
    }

    /// Mounts a filesystem instance over `mountpoint`.
    ///
    /// The mount point must be a directory that is not already covered.
    pub fn mount(
        &self,
        k: &Kernel,
        fstype: &str,
        dev: DevT,
        mountpoint: &Arc<Dentry>,
    ) -> KResult<Arc<Superblock>> {
        let dir = mountpoint.inode().ok_or(Errno::ENOENT)?;
        if !dir.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if mountpoint.mounted().is_some() {
            return Err(Errno::EEXIST);
        }

        let fs = self.find_filesystem(fstype)?;
        let sb = fs.read_super(k, dev)?;
        let root_inode = sb.ops.read_inode(k, &sb, sb.root_ino)?;
        self.icache.insert(&root_inode);

        let root = Dentry::new("", Some(root_inode));
        sb.set_root(root.clone());
        sb.set_covered(Some(mountpoint.clone()));
        mountpoint.set_mounted(Some(sb.clone()));
        self.mounts.lock().push(sb.clone());
        lepton_core::kinfo!(
            "vfs: mounted {} on {}",
            fstype,
            mountpoint.full_path()
        );
        Ok(sb)
    }

    /// Unmounts the filesystem covering `mountpoint`.
    pub fn umount(&self, mountpoint: &Arc<Dentry>) -> KResult<()> {
        let sb = mountpoint.mounted().ok_or(Errno::EINVAL)?;
        mountpoint.set_mounted(None);
        sb.set_covered(None);
        self.mounts.lock().retain(|m| !Arc::ptr_eq(m, &sb));
        Ok(())
    }

    /// Gets an inode through the cache, falling back to the driver.
    pub fn iget(&self, k: &Kernel, sb: &Arc<Superblock>, ino: u64) -> KResult<Arc<super::Inode>> {
        if let Some(hit) = self.icache.get(sb.dev, ino) {
            return Ok(hit);
        }
        let inode = sb.ops.read_inode(k, sb, ino)?;
        self.icache.insert(&inode);
        Ok(inode)
    }

    /// Number of active mounts.
    pub fn mount_count(&self) -> usize {
        self.mounts.lock().len()
    }
}
