//! System V shared memory.
//!
//! A segment is a run of physical frames with a key and an identifier.
//! `shmget` finds or creates, `shmat` maps the frames into the caller's
//! address space, `shmdt` unmaps. Removal (`IPC_RMID`) only marks the
//! segment; the frames are handed back when the last attach goes away.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lepton_core::addr::PhysAddr;
use lepton_core::sync::SpinLock;
use lepton_syscall::flags::{IPC_CREAT, IPC_EXCL};
use lepton_syscall::{Errno, KResult};

use crate::config::PAGE_SIZE;
use crate::kernel::Kernel;
use crate::task::Pid;

/// One shared segment.
pub struct ShmSegment {
    pub id: i32,
    pub key: u32,
    pub size: usize,
    frames: Vec<PhysAddr>,
    attaches: AtomicUsize,
    removed: AtomicBool,
}

impl ShmSegment {
    /// Number of current attachments.
    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::Acquire)
    }

    /// True once `IPC_RMID` was issued.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

/// The segment table plus the per-task attachment registry.
pub struct ShmTable {
    segs: SpinLock<BTreeMap<i32, Arc<ShmSegment>>>,
    /// (pid, mapped address) -> segment id.
    attachments: SpinLock<Vec<(Pid, usize, i32)>>,
    next_id: SpinLock<i32>,
}

impl Default for ShmTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShmTable {
    pub const fn new() -> Self {
        Self {
            segs: SpinLock::new(BTreeMap::new()),
            attachments: SpinLock::new(Vec::new()),
            next_id: SpinLock::new(1),
        }
    }

    /// `shmget`: find a segment by key or create one.
    pub fn shmget(&self, k: &Kernel, key: u32, size: usize, flags: u32) -> KResult<i32> {
        if size == 0 {
            return Err(Errno::EINVAL);
        }
        if key != 0 {
            let segs = self.segs.lock();
            if let Some(seg) = segs.values().find(|s| s.key == key && !s.is_removed()) {
                if flags & IPC_CREAT != 0 && flags & IPC_EXCL != 0 {
                    return Err(Errno::EEXIST);
                }
                if size > seg.size {
                    return Err(Errno::EINVAL);
                }
                return Ok(seg.id);
            }
        }
        if key != 0 && flags & IPC_CREAT == 0 {
            return Err(Errno::ENOENT);
        }

        let pages = size.div_ceil(PAGE_SIZE);
        let mut frames = Vec::with_capacity(pages);
        for _ in 0..pages {
            match k.frames.alloc_zeroed(&k.phys) {
                Some(f) => frames.push(f),
                None => {
                    for f in frames {
                        k.frames.put(f);
                    }
                    return Err(Errno::ENOMEM);
                }
            }
        }

        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        self.segs.lock().insert(
            id,
            Arc::new(ShmSegment {
                id,
                key,
                size: pages * PAGE_SIZE,
                frames,
                attaches: AtomicUsize::new(0),
                removed: AtomicBool::new(false),
            }),
        );
        Ok(id)
    }

    /// `shmat`: maps the segment into the current task at `addr_hint`
    /// (0 picks a free range). Returns the mapped address.
    pub fn shmat(&self, k: &Kernel, id: i32, addr_hint: usize) -> KResult<usize> {
        let seg = self.segment(id)?;
        let task = k.sched.current();
        let mut mm = task.mm.lock();
        let space = mm.as_mut().ok_or(Errno::EINVAL)?;
        let addr = space.map_shared(&k.frames, &k.phys, addr_hint, &seg.frames, true)?;
        seg.attaches.fetch_add(1, Ordering::AcqRel);
        self.attachments.lock().push((task.pid, addr, id));
        Ok(addr)
    }

    /// `shmdt`: unmaps the attachment at `addr` for the current task.
    pub fn shmdt(&self, k: &Kernel, addr: usize) -> KResult<()> {
        let task = k.sched.current();
        let mut mm = task.mm.lock();
        self.detach(k, task.pid, addr, &mut mm)
    }

    /// Detaches one mapping; used by `shmdt` and by exit teardown.
    pub fn detach(
        &self,
        k: &Kernel,
        pid: Pid,
        addr: usize,
        mm: &mut Option<crate::mm::AddressSpace>,
    ) -> KResult<()> {
        let id = {
            let mut attachments = self.attachments.lock();
            let idx = attachments
                .iter()
                .position(|&(p, a, _)| p == pid && a == addr)
                .ok_or(Errno::EINVAL)?;
            attachments.swap_remove(idx).2
        };
        let seg = self.segment(id)?;
        if let Some(space) = mm.as_mut() {
            space.unmap_shared(&k.frames, &k.phys, addr)?;
        }
        if seg.attaches.fetch_sub(1, Ordering::AcqRel) == 1 && seg.is_removed() {
            self.destroy(k, id);
        }
        Ok(())
    }

    /// Drops every attachment of an exiting task.
    pub fn detach_all(&self, k: &Kernel, pid: Pid, mm: &mut Option<crate::mm::AddressSpace>) {
        let mine: Vec<usize> = self
            .attachments
            .lock()
            .iter()
            .filter(|&&(p, _, _)| p == pid)
            .map(|&(_, a, _)| a)
            .collect();
        for addr in mine {
            let _ = self.detach(k, pid, addr, mm);
        }
    }

    /// `shmctl(IPC_RMID)`: marks the segment; frees now if unattached.
    pub fn remove(&self, k: &Kernel, id: i32) -> KResult<()> {
        let seg = self.segment(id)?;
        seg.removed.store(true, Ordering::Release);
        if seg.attach_count() == 0 {
            self.destroy(k, id);
        }
        Ok(())
    }

    /// Looks up a live segment.
    pub fn segment(&self, id: i32) -> KResult<Arc<ShmSegment>> {
        self.segs.lock().get(&id).cloned().ok_or(Errno::EINVAL)
    }

    /// Number of live segments.
    pub fn count(&self) -> usize {
        self.segs.lock().len()
    }

    fn destroy(&self, k: &Kernel, id: i32) {
        if let Some(seg) = self.segs.lock().remove(&id) {
            for &frame in &seg.frames {
                k.frames.put(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::AddressSpace;
    use crate::task::Task;

    fn kernel_with_task() -> Kernel {
        let k = Kernel::new_for_tests();
        let t = Task::new(k.sched.alloc_pid(), "shm-test");
        *t.mm.lock() = Some(AddressSpace::new(&k.frames, &k.phys, None).unwrap());
        k.sched.register(t.clone());
        k.sched.set_current(t);
        k
    }

    #[test]
    fn get_creates_and_finds_by_key() {
        let k = kernel_with_task();
        let id = k.shm.shmget(&k, 42, PAGE_SIZE, IPC_CREAT).unwrap();
        let again = k.shm.shmget(&k, 42, PAGE_SIZE, 0).unwrap();
        assert_eq!(id, again);
        assert_eq!(
            k.shm.shmget(&k, 42, PAGE_SIZE, IPC_CREAT | IPC_EXCL),
            Err(Errno::EEXIST)
        );
    }

    #[test]
    fn missing_key_without_creat_is_enoent() {
        let k = kernel_with_task();
        assert_eq!(k.shm.shmget(&k, 7, PAGE_SIZE, 0), Err(Errno::ENOENT));
    }

    #[test]
    fn attach_detach_roundtrip() {
        let k = kernel_with_task();
        let free_before = k.frames.free_frames();
        let id = k.shm.shmget(&k, 1, 2 * PAGE_SIZE, IPC_CREAT).unwrap();
        let addr = k.shm.shmat(&k, id, 0).unwrap();
        assert_eq!(k.shm.segment(id).unwrap().attach_count(), 1);

        k.shm.shmdt(&k, addr).unwrap();
        assert_eq!(k.shm.segment(id).unwrap().attach_count(), 0);
        // Segment still exists: not removed.
        assert_eq!(k.shm.count(), 1);

        k.shm.remove(&k, id).unwrap();
        assert_eq!(k.shm.count(), 0);
        assert_eq!(k.frames.free_frames(), free_before);
    }

    #[test]
    fn removal_defers_until_last_detach() {
        let k = kernel_with_task();
        let id = k.shm.shmget(&k, 9, PAGE_SIZE, IPC_CREAT).unwrap();
        let addr = k.shm.shmat(&k, id, 0).unwrap();

        k.shm.remove(&k, id).unwrap();
        // Marked but alive while attached.
        assert_eq!(k.shm.count(), 1);
        assert!(k.shm.segment(id).unwrap().is_removed());

        k.shm.shmdt(&k, addr).unwrap();
        assert_eq!(k.shm.count(), 0, "freed at last detach");
    }

    #[test]
    fn exit_detaches_everything() {
        let k = kernel_with_task();
        let id = k.shm.shmget(&k, 5, PAGE_SIZE, IPC_CREAT).unwrap();
        let _addr = k.shm.shmat(&k, id, 0).unwrap();

        let task = k.sched.current();
        k.shm.detach_all(&k, task.pid, &mut task.mm.lock());
        assert_eq!(k.shm.segment(id).unwrap().attach_count(), 0);
    }
}
