//! Character device switch table.
//!
//! Opening an `S_IFCHR` inode swaps the file's operations for the ones
//! registered under the device's major number; the driver sees the
//! minor through the inode's `rdev`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use lepton_core::sync::SpinLock;
use lepton_syscall::{Errno, KResult};

use super::FileOps;

/// Registered character drivers, keyed by major.
pub struct ChrdevTable {
    map: SpinLock<BTreeMap<u32, Arc<dyn FileOps>>>,
}

impl Default for ChrdevTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChrdevTable {
    pub const fn new() -> Self {
        Self {
            map: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Registers (or replaces) the driver for `major`.
    pub fn register(&self, major: u32, ops: Arc<dyn FileOps>) {
        lepton_core::kinfo!("chrdev: major {} registered", major);
        self.map.lock().insert(major, ops);
    }

    /// The driver for `major`, or `ENODEV`.
    pub fn get(&self, major: u32) -> KResult<Arc<dyn FileOps>> {
        self.map.lock().get(&major).cloned().ok_or(Errno::ENODEV)
    }
}
