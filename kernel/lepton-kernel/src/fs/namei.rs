//! Path resolution.
//!
//! Walks a slash-separated path component by component against the
//! dentry cache, asking the filesystem's `lookup` only on cache misses.
//! Misses are cached as negative dentries. Crossing into a mounted
//! directory swaps in the mounted root; `..` at a mount root crosses
//! back to the covered dentry first. Symlinks substitute their target
//! and restart from the proper base, bounded by a recursion allowance.

use alloc::string::String;
use alloc::sync::Arc;

use lepton_syscall::{Errno, KResult};

use crate::config::MAX_SYMLINK_DEPTH;
use crate::kernel::Kernel;

use super::{Dentry, Inode};

/// Effective uid/gid performing the walk.
#[derive(Debug, Clone, Copy)]
pub struct WalkCreds {
    pub euid: u32,
    pub egid: u32,
}

impl WalkCreds {
    /// Root credentials (boot-time walks, tests).
    pub const ROOT: WalkCreds = WalkCreds { euid: 0, egid: 0 };
}

/// Resolves `path` to a dentry.
///
/// The result may be *negative* only when it is the final component —
/// callers that create (`open(O_CREAT)`, `mkdir`, …) bind it; everyone
/// else treats a negative result as `ENOENT`. A missing intermediate
/// component always fails with `ENOENT`.
pub fn path_walk(
    k: &Kernel,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    path: &str,
    follow_last: bool,
    creds: WalkCreds,
) -> KResult<Arc<Dentry>> {
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }
    walk(k, base.clone(), root, path, follow_last, creds, 0)
}

/// Resolves everything but the last component, returning the parent
/// directory dentry and the final name.
pub fn path_walk_parent(
    k: &Kernel,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    path: &str,
    creds: WalkCreds,
) -> KResult<(Arc<Dentry>, String)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Errno::EINVAL);
    }
    let (dir_part, name) = match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..=idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };
    if name.is_empty() || name == "." || name == ".." {
        return Err(Errno::EINVAL);
    }
    let parent = if dir_part.is_empty() {
        base.clone()
    } else {
        let d = walk(k, base.clone(), root, dir_part, true, creds, 0)?;
        if d.is_negative() {
            return Err(Errno::ENOENT);
        }
        d
    };
    if !parent.inode().is_some_and(|i| i.is_dir()) {
        return Err(Errno::ENOTDIR);
    }
    Ok((parent, String::from(name)))
}

/// Like [`path_walk`] but a negative result is an error — for callers
/// that require the name to exist.
pub fn lookup(
    k: &Kernel,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    path: &str,
    follow_last: bool,
    creds: WalkCreds,
) -> KResult<Arc<Dentry>> {
    let dentry = path_walk(k, base, root, path, follow_last, creds)?;
    if dentry.is_negative() {
        return Err(Errno::ENOENT);
    }
    Ok(dentry)
}

fn walk(
    k: &Kernel,
    base: Arc<Dentry>,
    root: &Arc<Dentry>,
    path: &str,
    follow_last: bool,
    creds: WalkCreds,
    depth: usize,
) -> KResult<Arc<Dentry>> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(Errno::ELOOP);
    }

    let mut cur = if path.starts_with('/') {
        root.clone()
    } else {
        base
    };

    let components: alloc::vec::Vec<&str> = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();

    for (idx, name) in components.iter().enumerate() {
        let is_last = idx == components.len() - 1;

        let dir_inode = cur.inode().ok_or(Errno::ENOENT)?;
        if !dir_inode.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if !dir_inode.permission(creds.euid, creds.egid, 0o1) {
            return Err(Errno::EACCES);
        }

        if *name == ".." {
            cur = dotdot(&cur, root);
            continue;
        }

        let mut child = lookup_child(k, &cur, name)?;

        if child.is_negative() {
            if is_last {
                return Ok(child);
            }
            return Err(Errno::ENOENT);
        }

        // Descend into whatever is mounted here.
        while let Some(sb) = child.mounted() {
            child = sb.root().ok_or(Errno::ENOENT)?;
        }

        let inode = child.inode().ok_or(Errno::ENOENT)?;
        if inode.is_symlink() && (!is_last || follow_last) {
            let target = inode.iops.readlink(k, &inode)?;
            let link_base = if target.starts_with('/') {
                root.clone()
            } else {
                cur.clone()
            };
            let resolved = walk(k, link_base, root, &target, true, creds, depth + 1)?;
            if resolved.is_negative() {
                if is_last {
                    return Ok(resolved);
                }
                return Err(Errno::ENOENT);
            }
            cur = resolved;
            continue;
        }

        cur = child;
    }

    Ok(cur)
}

/// Handles `..`: at a mount root cross back to the covered dentry, and
/// never climb above the walk root.
fn dotdot(cur: &Arc<Dentry>, root: &Arc<Dentry>) -> Arc<Dentry> {
    if Arc::ptr_eq(cur, root) {
        return root.clone();
    }
    let mut d = cur.clone();
    // A mount root has no parent; step down onto the dentry it covers.
    while d.parent().is_none() {
        let Some(covered) = d
            .inode()
            .and_then(|i| i.sb.upgrade())
            .and_then(|sb| sb.covered())
        else {
            return d;
        };
        d = covered;
    }
    d.parent().unwrap_or(d)
}

/// Cached child lookup, falling back to the filesystem's `lookup` and
/// caching the outcome — including the negative one.
fn lookup_child(k: &Kernel, dir: &Arc<Dentry>, name: &str) -> KResult<Arc<Dentry>> {
    if let Some(hit) = dir.find_child(name) {
        return Ok(hit);
    }
    let dir_inode = dir.inode().ok_or(Errno::ENOENT)?;
    let child = match dir_inode.iops.lookup(k, &dir_inode, name) {
        Ok(inode) => {
            k.vfs.icache.insert(&inode);
            Dentry::new(name, Some(inode))
        }
        Err(Errno::ENOENT) => Dentry::new(name, None),
        Err(e) => return Err(e),
    };
    Dentry::attach(dir, &child);
    Ok(child)
}

// ---------------------------------------------------------------------------
// Namespace operations
// ---------------------------------------------------------------------------

use alloc::sync::Weak;
use lepton_syscall::abi::DevT;
use lepton_syscall::flags::{OpenFlags, S_IFDIR, S_IFMT, S_IFREG};

use super::File;

/// Resolves a path for `open(2)`, creating the file when asked to.
///
/// `mode` must already have the caller's umask applied.
pub fn open_namei(
    k: &Kernel,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    path: &str,
    flags: OpenFlags,
    mode: u32,
    creds: WalkCreds,
) -> KResult<Arc<File>> {
    let follow = !flags.contains(OpenFlags::NOFOLLOW);
    let dentry = path_walk(k, base, root, path, follow, creds)?;

    if dentry.is_negative() {
        if !flags.contains(OpenFlags::CREAT) {
            return Err(Errno::ENOENT);
        }
        let parent = dentry.parent().ok_or(Errno::ENOENT)?;
        let parent_inode = parent.inode().ok_or(Errno::ENOENT)?;
        if !parent_inode.permission(creds.euid, creds.egid, 0o2) {
            return Err(Errno::EACCES);
        }
        let mode = (mode & !S_IFMT) | S_IFREG;
        let inode = parent_inode
            .iops
            .create(k, &parent_inode, &dentry.name, mode)?;
        k.vfs.icache.insert(&inode);
        dentry.bind(inode);
    } else if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
        return Err(Errno::EEXIST);
    }

    let inode = dentry.inode().ok_or(Errno::ENOENT)?;
    if inode.is_symlink() {
        // Only reachable with O_NOFOLLOW on a symlink.
        return Err(Errno::ELOOP);
    }
    if flags.contains(OpenFlags::DIRECTORY) && !inode.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    if inode.is_dir() && flags.writable() {
        return Err(Errno::EISDIR);
    }
    let mut want = 0;
    if flags.readable() {
        want |= 0o4;
    }
    if flags.writable() {
        want |= 0o2;
    }
    if !inode.permission(creds.euid, creds.egid, want) {
        return Err(Errno::EACCES);
    }

    if flags.contains(OpenFlags::TRUNC) && flags.writable() && inode.is_reg() {
        inode.iops.truncate(k, &inode, 0)?;
    }

    let file = if inode.is_chrdev() {
        let major = inode.meta.lock().rdev.major();
        File::with_ops(inode.clone(), k.chrdevs.get(major)?, flags)
    } else if inode.is_fifo() {
        crate::ipc::pipe::fifo_file(inode.clone(), flags)
    } else {
        File::new(inode.clone(), Some(dentry.clone()), flags)
    };
    file.fops.open(k, &file)?;
    Ok(file)
}

/// `mkdir(2)`. `mode` has the umask applied already.
pub fn vfs_mkdir(
    k: &Kernel,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    path: &str,
    mode: u32,
    creds: WalkCreds,
) -> KResult<()> {
    let (parent, name) = path_walk_parent(k, base, root, path, creds)?;
    let parent_inode = parent.inode().ok_or(Errno::ENOENT)?;
    if !parent_inode.permission(creds.euid, creds.egid, 0o2) {
        return Err(Errno::EACCES);
    }
    let child = lookup_child(k, &parent, &name)?;
    if !child.is_negative() {
        return Err(Errno::EEXIST);
    }
    let mode = (mode & !S_IFMT) | S_IFDIR;
    let inode = parent_inode.iops.mkdir(k, &parent_inode, &name, mode)?;
    k.vfs.icache.insert(&inode);
    child.bind(inode);
    Ok(())
}

/// `rmdir(2)`.
pub fn vfs_rmdir(
    k: &Kernel,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    path: &str,
    creds: WalkCreds,
) -> KResult<()> {
    let (parent, name) = path_walk_parent(k, base, root, path, creds)?;
    let parent_inode = parent.inode().ok_or(Errno::ENOENT)?;
    if !parent_inode.permission(creds.euid, creds.egid, 0o2) {
        return Err(Errno::EACCES);
    }
    let victim = lookup_child(k, &parent, &name)?;
    if victim.mounted().is_some() {
        return Err(Errno::EEXIST);
    }
    parent_inode.iops.rmdir(k, &parent_inode, &name)?;
    // The dentry lingers as a negative entry caching the absence.
    victim.unbind();
    Ok(())
}

/// `unlink(2)`.
pub fn vfs_unlink(
    k: &Kernel,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    path: &str,
    creds: WalkCreds,
) -> KResult<()> {
    let (parent, name) = path_walk_parent(k, base, root, path, creds)?;
    let parent_inode = parent.inode().ok_or(Errno::ENOENT)?;
    if !parent_inode.permission(creds.euid, creds.egid, 0o2) {
        return Err(Errno::EACCES);
    }
    parent_inode.iops.unlink(k, &parent_inode, &name)?;
    if let Some(victim) = parent.find_child(&name) {
        if let Some(inode) = victim.inode() {
            // The last name is gone; evict the cache entry so the
            // inode can die with its last holder.
            if inode.meta.lock().nlink == 0 {
                k.vfs.icache.remove(inode.dev(), inode.ino);
            }
        }
        victim.unbind();
    }
    Ok(())
}

/// `link(2)`: hard-links `old_path` at `new_path`.
pub fn vfs_link(
    k: &Kernel,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    old_path: &str,
    new_path: &str,
    creds: WalkCreds,
) -> KResult<()> {
    let src = lookup(k, base, root, old_path, false, creds)?;
    let src_inode = src.inode().ok_or(Errno::ENOENT)?;
    if src_inode.is_dir() {
        return Err(Errno::EPERM);
    }
    let (parent, name) = path_walk_parent(k, base, root, new_path, creds)?;
    let parent_inode = parent.inode().ok_or(Errno::ENOENT)?;
    if !parent_inode.permission(creds.euid, creds.egid, 0o2) {
        return Err(Errno::EACCES);
    }
    if !same_filesystem(&src_inode, &parent_inode) {
        return Err(Errno::EINVAL);
    }
    let target = lookup_child(k, &parent, &name)?;
    if !target.is_negative() {
        return Err(Errno::EEXIST);
    }
    parent_inode
        .iops
        .link(k, &src_inode, &parent_inode, &name)?;
    target.bind(src_inode);
    Ok(())
}

/// `symlink(2)`: creates `link_path` containing `target`.
pub fn vfs_symlink(
    k: &Kernel,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    target: &str,
    link_path: &str,
    creds: WalkCreds,
) -> KResult<()> {
    let (parent, name) = path_walk_parent(k, base, root, link_path, creds)?;
    let parent_inode = parent.inode().ok_or(Errno::ENOENT)?;
    if !parent_inode.permission(creds.euid, creds.egid, 0o2) {
        return Err(Errno::EACCES);
    }
    let child = lookup_child(k, &parent, &name)?;
    if !child.is_negative() {
        return Err(Errno::EEXIST);
    }
    parent_inode.iops.symlink(k, &parent_inode, &name, target)?;
    // Invalidate the negative entry so the next walk sees the link.
    parent.forget_child(&name);
    Ok(())
}

/// `mknod(2)`. `mode` carries the file type bits.
pub fn vfs_mknod(
    k: &Kernel,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    path: &str,
    mode: u32,
    dev: DevT,
    creds: WalkCreds,
) -> KResult<()> {
    let (parent, name) = path_walk_parent(k, base, root, path, creds)?;
    let parent_inode = parent.inode().ok_or(Errno::ENOENT)?;
    if !parent_inode.permission(creds.euid, creds.egid, 0o2) {
        return Err(Errno::EACCES);
    }
    let child = lookup_child(k, &parent, &name)?;
    if !child.is_negative() {
        return Err(Errno::EEXIST);
    }
    let inode = parent_inode.iops.mknod(k, &parent_inode, &name, mode, dev)?;
    k.vfs.icache.insert(&inode);
    child.bind(inode);
    Ok(())
}

/// `rename(2)` within one filesystem.
pub fn vfs_rename(
    k: &Kernel,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    old_path: &str,
    new_path: &str,
    creds: WalkCreds,
) -> KResult<()> {
    let (old_parent, old_name) = path_walk_parent(k, base, root, old_path, creds)?;
    let (new_parent, new_name) = path_walk_parent(k, base, root, new_path, creds)?;
    let old_dir = old_parent.inode().ok_or(Errno::ENOENT)?;
    let new_dir = new_parent.inode().ok_or(Errno::ENOENT)?;
    for dir in [&old_dir, &new_dir] {
        if !dir.permission(creds.euid, creds.egid, 0o2) {
            return Err(Errno::EACCES);
        }
    }
    if !same_filesystem(&old_dir, &new_dir) {
        return Err(Errno::EINVAL);
    }
    old_dir
        .iops
        .rename(k, &old_dir, &old_name, &new_dir, &new_name)?;
    // Both cached names are stale now.
    old_parent.forget_child(&old_name);
    new_parent.forget_child(&new_name);
    Ok(())
}

fn same_filesystem(a: &Arc<Inode>, b: &Arc<Inode>) -> bool {
    Weak::ptr_eq(&a.sb, &b.sb)
}
