//! Per-task user address spaces.
//!
//! An [`AddressSpace`] couples a page directory with the bookkeeping the
//! syscall layer needs: the program break and the list of mapped
//! regions. Anonymous mappings are populated eagerly with zeroed frames;
//! sharing happens at `fork` via the directory's COW clone.

use alloc::vec::Vec;

use lepton_core::addr::{align_up, PhysAddr};
use lepton_syscall::flags::{MmapFlags, MmapProt};
use lepton_syscall::{Errno, KResult};

use super::{FrameAllocator, PageDirectory, PageFlags, PhysMapper};
use crate::config::{PAGE_SIZE, USER_MIN_ADDR, USER_MMAP_BASE};

/// Highest user-mappable address (exclusive).
const USER_TOP: usize = crate::config::KERNEL_PAGE_OFFSET;

/// A contiguous mapped region of user memory.
#[derive(Debug, Clone, Copy)]
pub struct VmArea {
    pub start: usize,
    pub end: usize,
    pub prot: MmapProt,
    pub flags: MmapFlags,
}

/// A task's user-half memory image.
pub struct AddressSpace {
    pub pd: PageDirectory,
    /// Bottom of the heap segment, set by exec.
    pub brk_start: usize,
    /// Current program break.
    pub brk: usize,
    /// Mapped regions, sorted by start address.
    vmas: Vec<VmArea>,
}

impl AddressSpace {
    /// Creates an empty address space whose kernel half mirrors
    /// `kernel_template`.
    pub fn new(
        fa: &FrameAllocator,
        phys: &PhysMapper,
        kernel_template: Option<&PageDirectory>,
    ) -> KResult<Self> {
        Ok(Self {
            pd: PageDirectory::new(fa, phys, kernel_template)?,
            brk_start: 0,
            brk: 0,
            vmas: Vec::new(),
        })
    }

    /// Duplicates the space for `fork`: COW-cloned directory, copied
    /// bookkeeping.
    pub fn clone_for_fork(&self, fa: &FrameAllocator, phys: &PhysMapper) -> KResult<Self> {
        Ok(Self {
            pd: self.pd.clone_user(fa, phys)?,
            brk_start: self.brk_start,
            brk: self.brk,
            vmas: self.vmas.clone(),
        })
    }

    /// Maps `len` bytes of zeroed anonymous memory at `start` (page
    /// aligned, eagerly populated).
    fn populate(
        &self,
        fa: &FrameAllocator,
        phys: &PhysMapper,
        start: usize,
        len: usize,
        prot: MmapProt,
    ) -> KResult<()> {
        let mut flags = PageFlags::USER;
        if prot.contains(MmapProt::WRITE) {
            flags |= PageFlags::WRITABLE;
        }
        let mut addr = start;
        while addr < start + len {
            let frame = fa.alloc_zeroed(phys).ok_or(Errno::ENOMEM)?;
            self.pd.map(fa, phys, addr, frame, flags)?;
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Unmaps every present page in `[start, start + len)`, dropping
    /// frame references.
    fn depopulate(&self, fa: &FrameAllocator, phys: &PhysMapper, start: usize, len: usize) {
        let mut addr = start;
        while addr < start + len {
            if let Some(frame) = self.pd.unmap(phys, addr) {
                fa.put(frame);
            }
            addr += PAGE_SIZE;
        }
    }

    /// Sets the initial break, mapping nothing yet.
    pub fn init_brk(&mut self, base: usize) {
        self.brk_start = base;
        self.brk = base;
    }

    /// Adjusts the break by `incr` bytes, returning the old break.
    pub fn sbrk(
        &mut self,
        fa: &FrameAllocator,
        phys: &PhysMapper,
        incr: isize,
    ) -> KResult<usize> {
        let old = self.brk;
        let new = old
            .checked_add_signed(incr)
            .filter(|&b| b >= self.brk_start && b < USER_MMAP_BASE)
            .ok_or(Errno::ENOMEM)?;

        let old_top = align_up(old, PAGE_SIZE);
        let new_top = align_up(new, PAGE_SIZE);
        if new_top > old_top {
            self.populate(
                fa,
                phys,
                old_top,
                new_top - old_top,
                MmapProt::READ | MmapProt::WRITE,
            )?;
        } else if new_top < old_top {
            self.depopulate(fa, phys, new_top, old_top - new_top);
        }
        self.brk = new;
        Ok(old)
    }

    /// `brk(2)`: moves the break to an absolute address, returning the
    /// resulting break (the old one if the request was out of range).
    pub fn set_brk(&mut self, fa: &FrameAllocator, phys: &PhysMapper, addr: usize) -> usize {
        if addr >= self.brk_start && addr < USER_MMAP_BASE {
            let incr = addr as isize - self.brk as isize;
            let _ = self.sbrk(fa, phys, incr);
        }
        self.brk
    }

    /// Finds a free `len`-byte gap in the mmap arena.
    fn find_gap(&self, len: usize) -> Option<usize> {
        let mut candidate = USER_MMAP_BASE;
        for vma in &self.vmas {
            if vma.end <= candidate {
                continue;
            }
            if vma.start >= candidate + len {
                break;
            }
            candidate = vma.end;
        }
        (candidate + len <= USER_TOP).then_some(candidate)
    }

    /// True if `[start, start+len)` overlaps no existing area.
    fn range_free(&self, start: usize, len: usize) -> bool {
        self.vmas
            .iter()
            .all(|v| v.end <= start || v.start >= start + len)
    }

    /// `mmap(2)` for anonymous memory. Returns the mapped address.
    pub fn mmap(
        &mut self,
        fa: &FrameAllocator,
        phys: &PhysMapper,
        addr: usize,
        len: usize,
        prot: MmapProt,
        flags: MmapFlags,
    ) -> KResult<usize> {
        if len == 0 || len > USER_TOP {
            return Err(Errno::EINVAL);
        }
        let len = align_up(len, PAGE_SIZE);

        let start = if flags.contains(MmapFlags::FIXED) {
            if addr % PAGE_SIZE != 0 || addr < USER_MIN_ADDR || !self.range_free(addr, len) {
                return Err(Errno::EINVAL);
            }
            addr
        } else {
            self.find_gap(len).ok_or(Errno::ENOMEM)?
        };

        self.populate(fa, phys, start, len, prot)?;
        self.insert_vma(VmArea {
            start,
            end: start + len,
            prot,
            flags,
        });
        Ok(start)
    }

    /// `munmap(2)`. Partial unmaps split the containing area.
    pub fn munmap(
        &mut self,
        fa: &FrameAllocator,
        phys: &PhysMapper,
        addr: usize,
        len: usize,
    ) -> KResult<()> {
        if addr % PAGE_SIZE != 0 || len == 0 {
            return Err(Errno::EINVAL);
        }
        let len = align_up(len, PAGE_SIZE);
        let end = addr + len;

        self.depopulate(fa, phys, addr, len);

        let mut split: Option<VmArea> = None;
        for vma in &mut self.vmas {
            if vma.end <= addr || vma.start >= end {
                continue;
            }
            if vma.start < addr && vma.end > end {
                // Hole in the middle: keep the head, split off the tail.
                split = Some(VmArea {
                    start: end,
                    end: vma.end,
                    prot: vma.prot,
                    flags: vma.flags,
                });
                vma.end = addr;
            } else if vma.start < addr {
                vma.end = addr;
            } else if vma.end > end {
                vma.start = end;
            } else {
                // Fully covered; mark for removal below.
                vma.end = vma.start;
            }
        }
        self.vmas.retain(|v| v.start < v.end);
        if let Some(tail) = split {
            self.insert_vma(tail);
        }
        Ok(())
    }

    /// `mremap(2)`: grows a mapping in place when the space behind it is
    /// free; moving mappings is not supported.
    pub fn mremap(
        &mut self,
        fa: &FrameAllocator,
        phys: &PhysMapper,
        old_addr: usize,
        old_len: usize,
        new_len: usize,
    ) -> KResult<usize> {
        let old_len = align_up(old_len, PAGE_SIZE);
        let new_len = align_up(new_len, PAGE_SIZE);
        let idx = self
            .vmas
            .iter()
            .position(|v| v.start == old_addr && v.end == old_addr + old_len)
            .ok_or(Errno::EINVAL)?;

        if new_len <= old_len {
            if new_len < old_len {
                self.munmap(fa, phys, old_addr + new_len, old_len - new_len)?;
            }
            return Ok(old_addr);
        }

        let grow = new_len - old_len;
        if !self.range_free(old_addr + old_len, grow) || old_addr + new_len > USER_TOP {
            return Err(Errno::ENOMEM);
        }
        let prot = self.vmas[idx].prot;
        self.populate(fa, phys, old_addr + old_len, grow, prot)?;
        self.vmas[idx].end = old_addr + new_len;
        Ok(old_addr)
    }

    /// Maps pre-existing frames (a shared memory segment) at a free
    /// arena address, bumping each frame's reference count.
    pub fn map_shared(
        &mut self,
        fa: &FrameAllocator,
        phys: &PhysMapper,
        addr_hint: usize,
        frames: &[PhysAddr],
        writable: bool,
    ) -> KResult<usize> {
        let len = frames.len() * PAGE_SIZE;
        let start = if addr_hint != 0 {
            if addr_hint % PAGE_SIZE != 0 || !self.range_free(addr_hint, len) {
                return Err(Errno::EINVAL);
            }
            addr_hint
        } else {
            self.find_gap(len).ok_or(Errno::ENOMEM)?
        };

        let mut flags = PageFlags::USER;
        if writable {
            flags |= PageFlags::WRITABLE;
        }
        for (i, &frame) in frames.iter().enumerate() {
            fa.get(frame);
            self.pd.map(fa, phys, start + i * PAGE_SIZE, frame, flags)?;
        }
        self.insert_vma(VmArea {
            start,
            end: start + len,
            prot: MmapProt::READ | MmapProt::WRITE,
            flags: MmapFlags::SHARED,
        });
        Ok(start)
    }

    /// Removes a shared-memory mapping installed by
    /// [`map_shared`](Self::map_shared). Returns the region length.
    pub fn unmap_shared(
        &mut self,
        fa: &FrameAllocator,
        phys: &PhysMapper,
        addr: usize,
    ) -> KResult<usize> {
        let vma = self
            .vmas
            .iter()
            .find(|v| v.start == addr && v.flags.contains(MmapFlags::SHARED))
            .copied()
            .ok_or(Errno::EINVAL)?;
        let len = vma.end - vma.start;
        self.munmap(fa, phys, addr, len)?;
        Ok(len)
    }

    /// Drops every user mapping (exec teardown, exit).
    pub fn clear(&mut self, fa: &FrameAllocator, phys: &PhysMapper) {
        self.pd.clear_user(fa, phys);
        self.vmas.clear();
        self.brk_start = 0;
        self.brk = 0;
    }

    /// Full teardown including the directory itself.
    pub fn destroy(mut self, fa: &FrameAllocator, phys: &PhysMapper) {
        self.vmas.clear();
        self.pd.destroy(fa, phys);
    }

    /// The mapped regions, sorted by address.
    pub fn vmas(&self) -> &[VmArea] {
        &self.vmas
    }

    fn insert_vma(&mut self, vma: VmArea) {
        let pos = self
            .vmas
            .iter()
            .position(|v| v.start > vma.start)
            .unwrap_or(self.vmas.len());
        self.vmas.insert(pos, vma);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    const FRAMES: usize = 128;

    struct TestMem {
        buf: *mut u8,
        layout: Layout,
        fa: FrameAllocator,
        phys: PhysMapper,
    }

    impl TestMem {
        fn new() -> Self {
            let layout = Layout::from_size_align(FRAMES * PAGE_SIZE, PAGE_SIZE).unwrap();
            let buf = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!buf.is_null());
            Self {
                buf,
                layout,
                fa: FrameAllocator::new(PhysAddr::new(0), FRAMES),
                phys: PhysMapper::new(buf as usize),
            }
        }
    }

    impl Drop for TestMem {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.buf, self.layout) };
        }
    }

    #[test]
    fn sbrk_maps_and_unmaps() {
        let m = TestMem::new();
        let mut space = AddressSpace::new(&m.fa, &m.phys, None).unwrap();
        space.init_brk(0x0800_0000);

        let old = space.sbrk(&m.fa, &m.phys, 3 * PAGE_SIZE as isize).unwrap();
        assert_eq!(old, 0x0800_0000);
        assert_eq!(space.pd.user_pages(&m.phys), 3);

        space.sbrk(&m.fa, &m.phys, -(2 * PAGE_SIZE as isize)).unwrap();
        assert_eq!(space.pd.user_pages(&m.phys), 1);

        space.destroy(&m.fa, &m.phys);
        assert_eq!(m.fa.free_frames(), FRAMES);
    }

    #[test]
    fn sbrk_below_base_rejected() {
        let m = TestMem::new();
        let mut space = AddressSpace::new(&m.fa, &m.phys, None).unwrap();
        space.init_brk(0x0800_0000);
        assert_eq!(
            space.sbrk(&m.fa, &m.phys, -(PAGE_SIZE as isize)),
            Err(Errno::ENOMEM)
        );
        space.destroy(&m.fa, &m.phys);
    }

    #[test]
    fn mmap_finds_gaps_and_munmap_splits() {
        let m = TestMem::new();
        let mut space = AddressSpace::new(&m.fa, &m.phys, None).unwrap();

        let a = space
            .mmap(
                &m.fa,
                &m.phys,
                0,
                3 * PAGE_SIZE,
                MmapProt::READ | MmapProt::WRITE,
                MmapFlags::PRIVATE | MmapFlags::ANONYMOUS,
            )
            .unwrap();
        assert_eq!(a, USER_MMAP_BASE);
        assert_eq!(space.pd.user_pages(&m.phys), 3);

        // Punch a hole in the middle page.
        space
            .munmap(&m.fa, &m.phys, a + PAGE_SIZE, PAGE_SIZE)
            .unwrap();
        assert_eq!(space.pd.user_pages(&m.phys), 2);
        assert_eq!(space.vmas().len(), 2);

        // The hole is reusable.
        let b = space
            .mmap(
                &m.fa,
                &m.phys,
                a + PAGE_SIZE,
                PAGE_SIZE,
                MmapProt::READ,
                MmapFlags::PRIVATE | MmapFlags::ANONYMOUS | MmapFlags::FIXED,
            )
            .unwrap();
        assert_eq!(b, a + PAGE_SIZE);

        space.destroy(&m.fa, &m.phys);
        assert_eq!(m.fa.free_frames(), FRAMES);
    }

    #[test]
    fn mmap_zero_len_rejected() {
        let m = TestMem::new();
        let mut space = AddressSpace::new(&m.fa, &m.phys, None).unwrap();
        assert_eq!(
            space.mmap(
                &m.fa,
                &m.phys,
                0,
                0,
                MmapProt::READ,
                MmapFlags::PRIVATE | MmapFlags::ANONYMOUS
            ),
            Err(Errno::EINVAL)
        );
        space.destroy(&m.fa, &m.phys);
    }

    #[test]
    fn mremap_grows_in_place_or_fails() {
        let m = TestMem::new();
        let mut space = AddressSpace::new(&m.fa, &m.phys, None).unwrap();
        let prot = MmapProt::READ | MmapProt::WRITE;
        let mf = MmapFlags::PRIVATE | MmapFlags::ANONYMOUS;

        let a = space.mmap(&m.fa, &m.phys, 0, PAGE_SIZE, prot, mf).unwrap();
        let grown = space
            .mremap(&m.fa, &m.phys, a, PAGE_SIZE, 3 * PAGE_SIZE)
            .unwrap();
        assert_eq!(grown, a);
        assert_eq!(space.pd.user_pages(&m.phys), 3);

        // Block the tail and try again.
        let blocker = space
            .mmap(
                &m.fa,
                &m.phys,
                a + 3 * PAGE_SIZE,
                PAGE_SIZE,
                prot,
                mf | MmapFlags::FIXED,
            )
            .unwrap();
        assert_eq!(blocker, a + 3 * PAGE_SIZE);
        assert_eq!(
            space.mremap(&m.fa, &m.phys, a, 3 * PAGE_SIZE, 8 * PAGE_SIZE),
            Err(Errno::ENOMEM)
        );

        space.destroy(&m.fa, &m.phys);
        assert_eq!(m.fa.free_frames(), FRAMES);
    }

    #[test]
    fn shared_frames_survive_one_unmap() {
        let m = TestMem::new();
        let mut a = AddressSpace::new(&m.fa, &m.phys, None).unwrap();
        let mut b = AddressSpace::new(&m.fa, &m.phys, None).unwrap();

        let frames: Vec<PhysAddr> = (0..2).map(|_| m.fa.alloc().unwrap()).collect();
        let va = a.map_shared(&m.fa, &m.phys, 0, &frames, true).unwrap();
        let vb = b.map_shared(&m.fa, &m.phys, 0, &frames, true).unwrap();
        assert_eq!(m.fa.refcount(frames[0]), 3);

        a.unmap_shared(&m.fa, &m.phys, va).unwrap();
        assert_eq!(m.fa.refcount(frames[0]), 2);
        // Still mapped for b.
        assert!(b.pd.translate(&m.phys, vb).is_some());

        b.unmap_shared(&m.fa, &m.phys, vb).unwrap();
        for f in frames {
            m.fa.put(f);
        }
        a.destroy(&m.fa, &m.phys);
        b.destroy(&m.fa, &m.phys);
        assert_eq!(m.fa.free_frames(), FRAMES);
    }

    #[test]
    fn fork_clone_preserves_brk_and_vmas() {
        let m = TestMem::new();
        let mut parent = AddressSpace::new(&m.fa, &m.phys, None).unwrap();
        parent.init_brk(0x0800_0000);
        parent.sbrk(&m.fa, &m.phys, PAGE_SIZE as isize).unwrap();

        let child = parent.clone_for_fork(&m.fa, &m.phys).unwrap();
        assert_eq!(child.brk, parent.brk);
        assert_eq!(child.vmas().len(), parent.vmas().len());
        assert_eq!(child.pd.user_pages(&m.phys), 1);

        child.destroy(&m.fa, &m.phys);
        parent.destroy(&m.fa, &m.phys);
        assert_eq!(m.fa.free_frames(), FRAMES);
    }
}
