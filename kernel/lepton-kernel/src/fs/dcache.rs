//! Dentry cache: the name-to-inode bindings the path walker works on.
//!
//! A dentry may be *negative* — bound to no inode — which caches the
//! fact that a name does not exist and spares the filesystem a repeat
//! lookup. Parents own their children; children keep weak back links,
//! so tearing down a subtree cannot leak cycles.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use lepton_core::sync::SpinLock;

use super::{Inode, Superblock};

/// A cached name binding.
pub struct Dentry {
    pub name: String,
    parent: SpinLock<Weak<Dentry>>,
    children: SpinLock<BTreeMap<String, Arc<Dentry>>>,
    inode: SpinLock<Option<Arc<Inode>>>,
    /// Superblock mounted on top of this dentry, if any.
    mounted: SpinLock<Option<Arc<Superblock>>>,
}

impl core::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dentry").field("name", &self.name).finish()
    }
}

impl Dentry {
    /// Creates a detached dentry; negative when `inode` is `None`.
    pub fn new(name: &str, inode: Option<Arc<Inode>>) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            parent: SpinLock::new(Weak::new()),
            children: SpinLock::new(BTreeMap::new()),
            inode: SpinLock::new(inode),
            mounted: SpinLock::new(None),
        })
    }

    /// The parent dentry, if still cached.
    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.lock().upgrade()
    }

    /// The bound inode, or `None` for a negative dentry.
    pub fn inode(&self) -> Option<Arc<Inode>> {
        self.inode.lock().clone()
    }

    /// True when no inode is bound.
    pub fn is_negative(&self) -> bool {
        self.inode.lock().is_none()
    }

    /// Binds an inode (a negative entry turning positive on create).
    pub fn bind(&self, inode: Arc<Inode>) {
        *self.inode.lock() = Some(inode);
    }

    /// Drops the inode binding; the dentry turns negative and now
    /// caches the name's absence.
    pub fn unbind(&self) {
        *self.inode.lock() = None;
    }

    /// Links `child` under `parent` and caches it by name.
    pub fn attach(parent: &Arc<Dentry>, child: &Arc<Dentry>) {
        *child.parent.lock() = Arc::downgrade(parent);
        parent
            .children
            .lock()
            .insert(child.name.clone(), child.clone());
    }

    /// Cached child lookup (positive or negative).
    pub fn find_child(&self, name: &str) -> Option<Arc<Dentry>> {
        self.children.lock().get(name).cloned()
    }

    /// Forgets a cached child entirely (rename, rmdir).
    pub fn forget_child(&self, name: &str) -> Option<Arc<Dentry>> {
        self.children.lock().remove(name)
    }

    /// The filesystem mounted on this dentry.
    pub fn mounted(&self) -> Option<Arc<Superblock>> {
        self.mounted.lock().clone()
    }

    /// Covers this dentry with a mounted filesystem.
    pub fn set_mounted(&self, sb: Option<Arc<Superblock>>) {
        *self.mounted.lock() = sb;
    }

    /// Number of cached children (diagnostic aid).
    pub fn cached_children(&self) -> usize {
        self.children.lock().len()
    }

    /// Evicts unused cache entries below this dentry: negative children
    /// and positive ones nobody else references. Returns how many
    /// entries were dropped.
    pub fn prune(self: &Arc<Self>) -> usize {
        let mut dropped = 0;
        let mut stack: Vec<Arc<Dentry>> = Vec::new();
        stack.push(self.clone());
        while let Some(d) = stack.pop() {
            let mut children = d.children.lock();
            let names: Vec<String> = children.keys().cloned().collect();
            for name in names {
                let child = children.get(&name).cloned().expect("key just listed");
                let busy = Arc::strong_count(&child) > 2 // map + local
                    || child.mounted.lock().is_some()
                    || !child.children.lock().is_empty();
                if busy {
                    stack.push(child);
                } else {
                    children.remove(&name);
                    dropped += 1;
                }
            }
        }
        dropped
    }

    /// Builds the absolute path of this dentry by walking parents,
    /// crossing mount roots back to the dentry they cover.
    pub fn full_path(self: &Arc<Self>) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut cur = self.clone();
        loop {
            // Cross from a mounted root to the mount point.
            while let Some(sb) = cur.inode().and_then(|i| i.sb.upgrade()) {
                let is_root = sb.root().is_some_and(|r| Arc::ptr_eq(&r, &cur));
                match (is_root, sb.covered()) {
                    (true, Some(covered)) => cur = covered,
                    _ => break,
                }
            }
            match cur.parent() {
                Some(parent) => {
                    parts.push(cur.name.clone());
                    cur = parent;
                }
                None => break,
            }
        }
        if parts.is_empty() {
            return String::from("/");
        }
        let mut path = String::new();
        for part in parts.iter().rev() {
            path.push('/');
            path.push_str(part);
        }
        path
    }
}
