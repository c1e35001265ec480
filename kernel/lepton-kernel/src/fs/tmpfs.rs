//! tmpfs: the memory-backed filesystem.
//!
//! Regular files keep their bytes in a growable buffer, directories are
//! name-to-inode maps, symlinks store their target string — all hanging
//! off the inode's private slot. The mount carries an inode-number
//! counter in the superblock's private slot.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use lepton_core::sync::SpinLock;
use lepton_syscall::abi::{DevT, Statfs64, DT_CHR, DT_DIR, DT_FIFO, DT_LNK, DT_REG, DT_UNKNOWN};
use lepton_syscall::flags::{S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG};
use lepton_syscall::{Errno, KResult};

use crate::config::PAGE_SIZE;
use crate::kernel::Kernel;

use super::{DirEntry, File, FileOps, FileSystemType, Inode, InodeMeta, InodeOps, SuperOps, Superblock};

const TMPFS_MAGIC: u32 = 0x0102_1994;
const ROOT_INO: u64 = 1;

/// Per-mount state.
struct TmpfsSbState {
    root: SpinLock<Option<Arc<Inode>>>,
    next_ino: AtomicU64,
}

/// Directory payload.
struct TmpDir {
    entries: BTreeMap<String, Arc<Inode>>,
}

/// Regular-file payload.
struct TmpFile {
    data: Vec<u8>,
}

/// Symlink payload.
struct TmpLink {
    target: String,
}

/// The registerable filesystem type.
pub struct Tmpfs;

impl FileSystemType for Tmpfs {
    fn name(&self) -> &'static str {
        "tmpfs"
    }

    fn read_super(&self, _k: &Kernel, dev: DevT) -> KResult<Arc<Superblock>> {
        let sb = Superblock::new(dev, "tmpfs", PAGE_SIZE as u32, ROOT_INO, Arc::new(TmpfsSuper));
        let state = TmpfsSbState {
            root: SpinLock::new(None),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        };
        *sb.private.lock() = Some(Box::new(state));

        let root = new_inode(&sb, ROOT_INO, S_IFDIR | 0o755);
        {
            let mut meta = root.meta.lock();
            meta.nlink = 2;
        }
        *root.private.lock() = Some(Box::new(TmpDir {
            entries: BTreeMap::new(),
        }));
        with_state(&sb, |s| *s.root.lock() = Some(root));
        Ok(sb)
    }
}

struct TmpfsSuper;

impl SuperOps for TmpfsSuper {
    fn read_inode(&self, _k: &Kernel, sb: &Arc<Superblock>, ino: u64) -> KResult<Arc<Inode>> {
        // Live inodes travel through `lookup`; only the root is ever
        // materialized by number.
        if ino == ROOT_INO {
            with_state(sb, |s| s.root.lock().clone()).ok_or(Errno::ENOENT)
        } else {
            Err(Errno::ENOENT)
        }
    }

    fn statfs(&self, _k: &Kernel, _sb: &Superblock) -> KResult<Statfs64> {
        Ok(Statfs64 {
            f_type: TMPFS_MAGIC,
            f_bsize: PAGE_SIZE as u32,
            f_namelen: 255,
            f_frsize: PAGE_SIZE as u32,
            ..Statfs64::default()
        })
    }
}

fn with_state<R>(sb: &Superblock, f: impl FnOnce(&TmpfsSbState) -> R) -> R {
    let private = sb.private.lock();
    let state = private
        .as_ref()
        .and_then(|b| b.downcast_ref::<TmpfsSbState>())
        .expect("tmpfs superblock state");
    f(state)
}

/// Builds a bare inode with the vtables matching its type.
fn new_inode(sb: &Arc<Superblock>, ino: u64, mode: u32) -> Arc<Inode> {
    let (iops, fops): (Arc<dyn InodeOps>, Arc<dyn FileOps>) = match mode & S_IFMT {
        S_IFDIR => (Arc::new(TmpfsDirIops), Arc::new(TmpfsDirFops)),
        S_IFLNK => (Arc::new(TmpfsLinkIops), Arc::new(TmpfsNoFops)),
        S_IFREG => (Arc::new(TmpfsFileIops), Arc::new(TmpfsFileFops)),
        // Device nodes and fifos get their real ops at open time.
        _ => (Arc::new(TmpfsFileIops), Arc::new(TmpfsNoFops)),
    };
    Inode::new(sb, ino, InodeMeta::new(mode), iops, fops)
}

fn alloc_inode(dir: &Arc<Inode>, mode: u32) -> KResult<Arc<Inode>> {
    let sb = dir.sb.upgrade().ok_or(Errno::EIO)?;
    let ino = with_state(&sb, |s| s.next_ino.fetch_add(1, Ordering::Relaxed));
    Ok(new_inode(&sb, ino, mode))
}

fn with_dir<R>(inode: &Inode, f: impl FnOnce(&mut TmpDir) -> R) -> KResult<R> {
    let mut private = inode.private.lock();
    let dir = private
        .as_mut()
        .and_then(|b| b.downcast_mut::<TmpDir>())
        .ok_or(Errno::ENOTDIR)?;
    Ok(f(dir))
}

// ---------------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------------

struct TmpfsDirIops;

impl InodeOps for TmpfsDirIops {
    fn lookup(&self, _k: &Kernel, dir: &Arc<Inode>, name: &str) -> KResult<Arc<Inode>> {
        with_dir(dir, |d| d.entries.get(name).cloned())?.ok_or(Errno::ENOENT)
    }

    fn create(&self, _k: &Kernel, dir: &Arc<Inode>, name: &str, mode: u32) -> KResult<Arc<Inode>> {
        if with_dir(dir, |d| d.entries.contains_key(name))? {
            return Err(Errno::EEXIST);
        }
        let inode = alloc_inode(dir, (mode & !S_IFMT) | S_IFREG)?;
        *inode.private.lock() = Some(Box::new(TmpFile { data: Vec::new() }));
        with_dir(dir, |d| d.entries.insert(name.to_string(), inode.clone()))?;
        Ok(inode)
    }

    fn mknod(
        &self,
        _k: &Kernel,
        dir: &Arc<Inode>,
        name: &str,
        mode: u32,
        dev: DevT,
    ) -> KResult<Arc<Inode>> {
        if with_dir(dir, |d| d.entries.contains_key(name))? {
            return Err(Errno::EEXIST);
        }
        let inode = alloc_inode(dir, mode)?;
        match mode & S_IFMT {
            S_IFCHR => inode.meta.lock().rdev = dev,
            S_IFREG => {
                *inode.private.lock() = Some(Box::new(TmpFile { data: Vec::new() }));
            }
            S_IFIFO => {}
            _ => return Err(Errno::EINVAL),
        }
        with_dir(dir, |d| d.entries.insert(name.to_string(), inode.clone()))?;
        Ok(inode)
    }

    fn mkdir(&self, _k: &Kernel, dir: &Arc<Inode>, name: &str, mode: u32) -> KResult<Arc<Inode>> {
        if with_dir(dir, |d| d.entries.contains_key(name))? {
            return Err(Errno::EEXIST);
        }
        let inode = alloc_inode(dir, (mode & !S_IFMT) | S_IFDIR)?;
        inode.meta.lock().nlink = 2;
        *inode.private.lock() = Some(Box::new(TmpDir {
            entries: BTreeMap::new(),
        }));
        with_dir(dir, |d| d.entries.insert(name.to_string(), inode.clone()))?;
        dir.meta.lock().nlink += 1;
        Ok(inode)
    }

    fn rmdir(&self, k: &Kernel, dir: &Arc<Inode>, name: &str) -> KResult<()> {
        let victim = self.lookup(k, dir, name)?;
        if !victim.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        let empty = with_dir(&victim, |d| d.entries.is_empty())?;
        if !empty {
            return Err(Errno::ENOTEMPTY);
        }
        with_dir(dir, |d| d.entries.remove(name))?;
        victim.meta.lock().nlink = 0;
        dir.meta.lock().nlink -= 1;
        Ok(())
    }

    fn unlink(&self, k: &Kernel, dir: &Arc<Inode>, name: &str) -> KResult<()> {
        let victim = self.lookup(k, dir, name)?;
        if victim.is_dir() {
            return Err(Errno::EPERM);
        }
        with_dir(dir, |d| d.entries.remove(name))?;
        victim.meta.lock().nlink -= 1;
        Ok(())
    }

    fn link(&self, _k: &Kernel, src: &Arc<Inode>, dir: &Arc<Inode>, name: &str) -> KResult<()> {
        if with_dir(dir, |d| d.entries.contains_key(name))? {
            return Err(Errno::EEXIST);
        }
        with_dir(dir, |d| d.entries.insert(name.to_string(), src.clone()))?;
        src.meta.lock().nlink += 1;
        Ok(())
    }

    fn symlink(&self, _k: &Kernel, dir: &Arc<Inode>, name: &str, target: &str) -> KResult<()> {
        if with_dir(dir, |d| d.entries.contains_key(name))? {
            return Err(Errno::EEXIST);
        }
        let inode = alloc_inode(dir, S_IFLNK | 0o777)?;
        *inode.private.lock() = Some(Box::new(TmpLink {
            target: target.to_string(),
        }));
        inode.meta.lock().size = target.len() as i64;
        with_dir(dir, |d| d.entries.insert(name.to_string(), inode))?;
        Ok(())
    }

    fn rename(
        &self,
        k: &Kernel,
        old_dir: &Arc<Inode>,
        old_name: &str,
        new_dir: &Arc<Inode>,
        new_name: &str,
    ) -> KResult<()> {
        let moving = self.lookup(k, old_dir, old_name)?;

        // A target may be silently replaced, directories only by empty
        // directories.
        if let Ok(existing) = self.lookup(k, new_dir, new_name) {
            if existing.is_dir() {
                let empty = with_dir(&existing, |d| d.entries.is_empty())?;
                if !empty {
                    return Err(Errno::ENOTEMPTY);
                }
                new_dir.meta.lock().nlink -= 1;
            }
            let mut meta = existing.meta.lock();
            meta.nlink = meta.nlink.saturating_sub(1);
        }

        with_dir(old_dir, |d| d.entries.remove(old_name))?;
        with_dir(new_dir, |d| {
            d.entries.insert(new_name.to_string(), moving.clone())
        })?;
        if moving.is_dir() && !Arc::ptr_eq(old_dir, new_dir) {
            old_dir.meta.lock().nlink -= 1;
            new_dir.meta.lock().nlink += 1;
        }
        Ok(())
    }
}

struct TmpfsDirFops;

impl FileOps for TmpfsDirFops {
    fn readdir(&self, _k: &Kernel, file: &File, index: usize) -> KResult<Option<DirEntry>> {
        let inode = &file.inode;
        if index == 0 {
            return Ok(Some(DirEntry {
                ino: inode.ino,
                name: ".".to_string(),
                dtype: DT_DIR,
            }));
        }
        if index == 1 {
            return Ok(Some(DirEntry {
                ino: inode.ino,
                name: "..".to_string(),
                dtype: DT_DIR,
            }));
        }
        with_dir(inode, |d| {
            d.entries.iter().nth(index - 2).map(|(name, child)| DirEntry {
                ino: child.ino,
                name: name.clone(),
                dtype: dtype_of(child.mode()),
            })
        })
    }
}

fn dtype_of(mode: u32) -> u8 {
    match mode & S_IFMT {
        S_IFDIR => DT_DIR,
        S_IFREG => DT_REG,
        S_IFLNK => DT_LNK,
        S_IFCHR => DT_CHR,
        S_IFIFO => DT_FIFO,
        _ => DT_UNKNOWN,
    }
}

// ---------------------------------------------------------------------------
// Regular files
// ---------------------------------------------------------------------------

struct TmpfsFileIops;

impl InodeOps for TmpfsFileIops {
    fn truncate(&self, _k: &Kernel, inode: &Arc<Inode>, size: i64) -> KResult<()> {
        if size < 0 {
            return Err(Errno::EINVAL);
        }
        let mut private = inode.private.lock();
        let file = private
            .as_mut()
            .and_then(|b| b.downcast_mut::<TmpFile>())
            .ok_or(Errno::EINVAL)?;
        file.data.resize(size as usize, 0);
        drop(private);
        inode.meta.lock().size = size;
        Ok(())
    }
}

struct TmpfsFileFops;

impl FileOps for TmpfsFileFops {
    fn read(&self, _k: &Kernel, file: &File, buf: &mut [u8], pos: i64) -> KResult<usize> {
        let private = file.inode.private.lock();
        let data = private
            .as_ref()
            .and_then(|b| b.downcast_ref::<TmpFile>())
            .ok_or(Errno::EIO)?;
        let pos = pos.max(0) as usize;
        if pos >= data.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.data.len() - pos);
        buf[..n].copy_from_slice(&data.data[pos..pos + n]);
        Ok(n)
    }

    fn write(&self, _k: &Kernel, file: &File, buf: &[u8], pos: i64) -> KResult<usize> {
        let pos = pos.max(0) as usize;
        let mut private = file.inode.private.lock();
        let data = private
            .as_mut()
            .and_then(|b| b.downcast_mut::<TmpFile>())
            .ok_or(Errno::EIO)?;
        let end = pos + buf.len();
        if data.data.len() < end {
            data.data.resize(end, 0);
        }
        data.data[pos..end].copy_from_slice(buf);
        let new_len = data.data.len() as i64;
        drop(private);
        let mut meta = file.inode.meta.lock();
        meta.size = new_len;
        Ok(buf.len())
    }
}

// ---------------------------------------------------------------------------
// Symlinks and op-less nodes
// ---------------------------------------------------------------------------

struct TmpfsLinkIops;

impl InodeOps for TmpfsLinkIops {
    fn readlink(&self, _k: &Kernel, inode: &Arc<Inode>) -> KResult<String> {
        let private = inode.private.lock();
        private
            .as_ref()
            .and_then(|b| b.downcast_ref::<TmpLink>())
            .map(|l| l.target.clone())
            .ok_or(Errno::EINVAL)
    }
}

/// Placeholder for inodes whose real ops arrive at open time.
struct TmpfsNoFops;

impl FileOps for TmpfsNoFops {}
