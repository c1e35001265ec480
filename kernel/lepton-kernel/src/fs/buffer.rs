//! Block buffer cache.
//!
//! Maps (device, block number) to an in-memory copy of the block. Hits
//! return the cached buffer; misses read synchronously through the
//! registered block driver. Writers set the dirty bit and the data goes
//! back to the device when a sync is requested. When the cache outgrows
//! its bound, clean unused buffers are evicted in approximate LRU order.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use lepton_core::sync::SpinLock;
use lepton_syscall::abi::DevT;
use lepton_syscall::{Errno, KResult};

use crate::config::NR_BUFFERS;

/// The block-device driver contract.
pub trait BlockDriver: Send + Sync {
    /// Block size in bytes for this device.
    fn block_size(&self, minor: u32) -> usize;
    /// Reads one block into `buf` (exactly `block_size` bytes).
    fn read_block(&self, minor: u32, block: u64, buf: &mut [u8]) -> KResult<()>;
    /// Writes one block from `buf`.
    fn write_block(&self, minor: u32, block: u64, buf: &[u8]) -> KResult<()>;
}

/// One cached block.
pub struct BufferHead {
    pub dev: DevT,
    pub block: u64,
    pub data: SpinLock<Vec<u8>>,
    dirty: AtomicBool,
}

impl core::fmt::Debug for BufferHead {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferHead")
            .field("dev", &self.dev)
            .field("block", &self.block)
            .finish()
    }
}

impl BufferHead {
    /// Marks the buffer modified; a later sync writes it back.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// True if the buffer has unwritten modifications.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

type Key = (u32, u64);

struct CacheInner {
    map: BTreeMap<Key, Arc<BufferHead>>,
    /// Keys in least-recently-used-first order.
    lru: VecDeque<Key>,
}

/// The buffer cache plus the block-driver registry.
pub struct BufferCache {
    capacity: usize,
    inner: SpinLock<CacheInner>,
    drivers: SpinLock<BTreeMap<u32, Arc<dyn BlockDriver>>>,
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new(NR_BUFFERS)
    }
}

impl BufferCache {
    /// A cache bounded at `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: SpinLock::new(CacheInner {
                map: BTreeMap::new(),
                lru: VecDeque::new(),
            }),
            drivers: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Registers the driver for a block major.
    pub fn register_driver(&self, major: u32, driver: Arc<dyn BlockDriver>) {
        self.drivers.lock().insert(major, driver);
    }

    fn driver(&self, dev: DevT) -> KResult<Arc<dyn BlockDriver>> {
        self.drivers
            .lock()
            .get(&dev.major())
            .cloned()
            .ok_or(Errno::ENODEV)
    }

    /// Reads block `block` of `dev`, from cache or device.
    pub fn bread(&self, dev: DevT, block: u64) -> KResult<Arc<BufferHead>> {
        let key = (dev.0, block);
        {
            let mut inner = self.inner.lock();
            if let Some(bh) = inner.map.get(&key).cloned() {
                Self::touch(&mut inner, key);
                return Ok(bh);
            }
        }

        // Miss: synchronous fill outside the cache lock (the driver
        // may sleep on I/O).
        let driver = self.driver(dev)?;
        let mut data = vec![0u8; driver.block_size(dev.minor())];
        driver.read_block(dev.minor(), block, &mut data)?;

        let bh = Arc::new(BufferHead {
            dev,
            block,
            data: SpinLock::new(data),
            dirty: AtomicBool::new(false),
        });

        let mut inner = self.inner.lock();
        // Somebody may have filled it while we read; keep theirs.
        if let Some(existing) = inner.map.get(&key).cloned() {
            Self::touch(&mut inner, key);
            return Ok(existing);
        }
        inner.map.insert(key, bh.clone());
        inner.lru.push_back(key);
        self.evict_locked(&mut inner)?;
        Ok(bh)
    }

    /// Writes every dirty buffer of `dev` back through its driver.
    pub fn sync_dev(&self, dev: DevT) -> KResult<()> {
        let victims: Vec<Arc<BufferHead>> = {
            let inner = self.inner.lock();
            inner
                .map
                .values()
                .filter(|b| b.dev == dev && b.is_dirty())
                .cloned()
                .collect()
        };
        let driver = self.driver(dev)?;
        for bh in victims {
            let data = bh.data.lock();
            driver.write_block(dev.minor(), bh.block, &data)?;
            bh.dirty.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Number of cached blocks.
    pub fn cached(&self) -> usize {
        self.inner.lock().map.len()
    }

    fn touch(inner: &mut CacheInner, key: Key) {
        inner.lru.retain(|k| *k != key);
        inner.lru.push_back(key);
    }

    /// Evicts clean, unreferenced buffers LRU-first until within bounds.
    fn evict_locked(&self, inner: &mut CacheInner) -> KResult<()> {
        while inner.map.len() > self.capacity {
            let Some(pos) = inner.lru.iter().position(|k| {
                inner
                    .map
                    .get(k)
                    .is_some_and(|b| Arc::strong_count(b) == 1 && !b.is_dirty())
            }) else {
                // Everything is busy or dirty; let the cache run over.
                return Ok(());
            };
            let key = inner.lru.remove(pos).expect("position valid");
            inner.map.remove(&key);
        }
        Ok(())
    }
}
