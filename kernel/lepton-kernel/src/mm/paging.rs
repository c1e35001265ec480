//! Two-level i386 page tables.
//!
//! A page directory holds 1024 entries, each naming a page table of 1024
//! 4 KiB mappings. The top quarter of every directory (entries 768 and
//! up, `0xC000_0000` onward) is the kernel half, copied by reference
//! from the boot directory so kernel mappings are identical everywhere.
//!
//! Table memory is reached through a [`PhysMapper`] — the fixed
//! phys-to-virt offset of the kernel map on hardware, or the base of a
//! fake physical buffer under the test harness.

use bitflags::bitflags;
use lepton_core::addr::PhysAddr;
use lepton_syscall::{Errno, KResult};

use super::FrameAllocator;
use crate::config::{KERNEL_PAGE_OFFSET, PAGE_SIZE};

bitflags! {
    /// Page table entry flags. Bits 0-6 are hardware-defined; bit 9 is
    /// software-available and marks copy-on-write mappings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
        /// Write-protected pending a private copy.
        const COW      = 1 << 9;
    }
}

/// Directory index of the first kernel-half entry.
const KERNEL_PDE: usize = KERNEL_PAGE_OFFSET >> 22;

const ENTRIES: usize = 1024;
const ADDR_MASK: u32 = 0xFFFF_F000;

/// One page of 32-bit entries — a directory or a table.
#[repr(C, align(4096))]
struct EntryPage([u32; ENTRIES]);

/// Translates physical addresses to kernel-accessible pointers by a
/// fixed offset.
#[derive(Clone, Copy)]
pub struct PhysMapper {
    offset: usize,
}

impl PhysMapper {
    /// An offset-`offset` mapper: virt = phys + offset.
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// Pointer to the byte backing physical address `p`.
    pub fn ptr(&self, p: PhysAddr) -> *mut u8 {
        p.as_usize().wrapping_add(self.offset) as *mut u8
    }

    /// Mutable view of the entry page in frame `p`.
    ///
    /// # Safety
    ///
    /// `p` must be a frame holding a live directory or table, not
    /// concurrently aliased as an `EntryPage`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn page(&self, p: PhysAddr) -> &mut EntryPage {
        // SAFETY: per contract; alignment follows from frame alignment.
        unsafe { &mut *(self.ptr(p) as *mut EntryPage) }
    }
}

/// A per-task page directory.
pub struct PageDirectory {
    root: PhysAddr,
}

impl PageDirectory {
    /// Allocates an empty directory, copying the kernel half from
    /// `kernel_template` when given.
    pub fn new(
        fa: &FrameAllocator,
        phys: &PhysMapper,
        kernel_template: Option<&PageDirectory>,
    ) -> KResult<Self> {
        let root = fa.alloc_zeroed(phys).ok_or(Errno::ENOMEM)?;
        if let Some(tpl) = kernel_template {
            // SAFETY: both frames are live directories.
            let (dst, src) = unsafe { (phys.page(root), phys.page(tpl.root)) };
            dst.0[KERNEL_PDE..].copy_from_slice(&src.0[KERNEL_PDE..]);
        }
        Ok(Self { root })
    }

    /// Physical address of the directory frame (the CR3 value).
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Installs a mapping for the page containing `vaddr`.
    ///
    /// Allocates the intermediate page table on demand.
    ///
    /// # Panics
    ///
    /// Panics if the page is already mapped — double mapping is a
    /// corrupted invariant, not a recoverable error.
    pub fn map(
        &self,
        fa: &FrameAllocator,
        phys: &PhysMapper,
        vaddr: usize,
        frame: PhysAddr,
        flags: PageFlags,
    ) -> KResult<()> {
        let pde = vaddr >> 22;
        let pte = (vaddr >> 12) & (ENTRIES - 1);

        // SAFETY: root is a live directory frame.
        let dir = unsafe { phys.page(self.root) };
        if dir.0[pde] & PageFlags::PRESENT.bits() == 0 {
            let table = fa.alloc_zeroed(phys).ok_or(Errno::ENOMEM)?;
            let table_flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
            dir.0[pde] = table.as_usize() as u32 | table_flags.bits();
        }
        let table_frame = PhysAddr::new((dir.0[pde] & ADDR_MASK) as usize);
        // SAFETY: the entry points at a table frame we own.
        let table = unsafe { phys.page(table_frame) };
        assert_eq!(
            table.0[pte] & PageFlags::PRESENT.bits(),
            0,
            "double map at {vaddr:#x}"
        );
        table.0[pte] = frame.as_usize() as u32 | (flags | PageFlags::PRESENT).bits();
        Ok(())
    }

    /// Removes the mapping for the page containing `vaddr`, returning
    /// the frame it pointed at. The frame's reference is NOT dropped;
    /// that is the caller's job.
    pub fn unmap(&self, phys: &PhysMapper, vaddr: usize) -> Option<PhysAddr> {
        let pde = vaddr >> 22;
        let pte = (vaddr >> 12) & (ENTRIES - 1);

        // SAFETY: root is a live directory frame.
        let dir = unsafe { phys.page(self.root) };
        if dir.0[pde] & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        let table_frame = PhysAddr::new((dir.0[pde] & ADDR_MASK) as usize);
        // SAFETY: the entry points at a table frame we own.
        let table = unsafe { phys.page(table_frame) };
        let entry = table.0[pte];
        if entry & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        table.0[pte] = 0;
        Some(PhysAddr::new((entry & ADDR_MASK) as usize))
    }

    /// Looks up the frame and flags mapped at `vaddr`.
    pub fn translate(&self, phys: &PhysMapper, vaddr: usize) -> Option<(PhysAddr, PageFlags)> {
        let pde = vaddr >> 22;
        let pte = (vaddr >> 12) & (ENTRIES - 1);

        // SAFETY: root is a live directory frame.
        let dir = unsafe { phys.page(self.root) };
        if dir.0[pde] & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        let table_frame = PhysAddr::new((dir.0[pde] & ADDR_MASK) as usize);
        // SAFETY: the entry points at a table frame we own.
        let table = unsafe { phys.page(table_frame) };
        let entry = table.0[pte];
        if entry & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((
            PhysAddr::new((entry & ADDR_MASK) as usize),
            PageFlags::from_bits_truncate(entry),
        ))
    }

    /// Duplicates the user half for `fork`.
    ///
    /// Page tables are copied; data frames are shared copy-on-write:
    /// every writable mapping loses its write bit in *both* directories
    /// and gains the COW mark, and the frame's reference count grows by
    /// one. The kernel half is carried over by reference.
    pub fn clone_user(&self, fa: &FrameAllocator, phys: &PhysMapper) -> KResult<PageDirectory> {
        let child = PageDirectory::new(fa, phys, Some(self))?;

        for pde in 0..KERNEL_PDE {
            // SAFETY: root frames are live directories.
            let src_entry = unsafe { phys.page(self.root) }.0[pde];
            if src_entry & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let src_table_frame = PhysAddr::new((src_entry & ADDR_MASK) as usize);
            let new_table = fa.alloc_zeroed(phys).ok_or(Errno::ENOMEM)?;

            for pte in 0..ENTRIES {
                // SAFETY: both table frames are live.
                let entry = unsafe { phys.page(src_table_frame) }.0[pte];
                if entry & PageFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let frame = PhysAddr::new((entry & ADDR_MASK) as usize);
                fa.get(frame);

                let mut shared = entry;
                if shared & PageFlags::WRITABLE.bits() != 0 {
                    shared &= !PageFlags::WRITABLE.bits();
                    shared |= PageFlags::COW.bits();
                }
                // SAFETY: both table frames are live.
                unsafe {
                    phys.page(src_table_frame).0[pte] = shared;
                    phys.page(new_table).0[pte] = shared;
                }
            }
            let table_flags = src_entry & !ADDR_MASK;
            // SAFETY: child's root is a live directory.
            unsafe { phys.page(child.root) }.0[pde] = new_table.as_usize() as u32 | table_flags;
        }
        Ok(child)
    }

    /// Resolves a write fault on a COW page.
    ///
    /// Copies the frame when it is still shared, or simply restores the
    /// write bit when this mapping holds the last reference. Returns
    /// `false` if the fault was not a COW page at all (a genuine
    /// protection violation the caller turns into `SIGSEGV`).
    pub fn handle_cow_fault(
        &self,
        fa: &FrameAllocator,
        phys: &PhysMapper,
        vaddr: usize,
    ) -> KResult<bool> {
        let pde = vaddr >> 22;
        let pte = (vaddr >> 12) & (ENTRIES - 1);

        // SAFETY: root is a live directory frame.
        let dir = unsafe { phys.page(self.root) };
        if dir.0[pde] & PageFlags::PRESENT.bits() == 0 {
            return Ok(false);
        }
        let table_frame = PhysAddr::new((dir.0[pde] & ADDR_MASK) as usize);
        // SAFETY: the entry points at a table frame we own.
        let table = unsafe { phys.page(table_frame) };
        let entry = table.0[pte];
        if entry & PageFlags::PRESENT.bits() == 0 || entry & PageFlags::COW.bits() == 0 {
            return Ok(false);
        }

        let frame = PhysAddr::new((entry & ADDR_MASK) as usize);
        let unshared = (entry | PageFlags::WRITABLE.bits()) & !PageFlags::COW.bits();

        if fa.refcount(frame) > 1 {
            let copy = fa.alloc().ok_or(Errno::ENOMEM)?;
            // SAFETY: both frames are live and PAGE_SIZE long; the new
            // copy is exclusively ours.
            unsafe {
                core::ptr::copy_nonoverlapping(phys.ptr(frame), phys.ptr(copy), PAGE_SIZE);
            }
            fa.put(frame);
            table.0[pte] = copy.as_usize() as u32 | (unshared & !ADDR_MASK);
        } else {
            table.0[pte] = unshared;
        }
        Ok(true)
    }

    /// Tears down the user half: drops every mapped frame's reference
    /// and frees the page tables. Kernel-half entries are left alone
    /// (they are shared).
    pub fn clear_user(&self, fa: &FrameAllocator, phys: &PhysMapper) {
        for pde in 0..KERNEL_PDE {
            // SAFETY: root is a live directory frame.
            let dir = unsafe { phys.page(self.root) };
            let entry = dir.0[pde];
            if entry & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let table_frame = PhysAddr::new((entry & ADDR_MASK) as usize);
            for pte in 0..ENTRIES {
                // SAFETY: the entry points at a table frame we own.
                let e = unsafe { phys.page(table_frame) }.0[pte];
                if e & PageFlags::PRESENT.bits() != 0 {
                    fa.put(PhysAddr::new((e & ADDR_MASK) as usize));
                }
            }
            fa.put(table_frame);
            dir.0[pde] = 0;
        }
    }

    /// Destroys the directory: user teardown plus the root frame.
    pub fn destroy(self, fa: &FrameAllocator, phys: &PhysMapper) {
        self.clear_user(fa, phys);
        fa.put(self.root);
    }

    /// Counts present user-half mappings (diagnostic aid).
    pub fn user_pages(&self, phys: &PhysMapper) -> usize {
        let mut n = 0;
        for pde in 0..KERNEL_PDE {
            // SAFETY: root is a live directory frame.
            let entry = unsafe { phys.page(self.root) }.0[pde];
            if entry & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let table_frame = PhysAddr::new((entry & ADDR_MASK) as usize);
            for pte in 0..ENTRIES {
                // SAFETY: the entry points at a table frame we own.
                let e = unsafe { phys.page(table_frame) }.0[pte];
                if e & PageFlags::PRESENT.bits() != 0 {
                    n += 1;
                }
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    const FRAMES: usize = 64;

    /// Fake physical memory: frame addresses start at zero, and the
    /// mapper offset is the base of a page-aligned host buffer.
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

    const UFLAGS: PageFlags = PageFlags::WRITABLE.union(PageFlags::USER);

    #[test]
    fn map_translate_unmap() {
        let m = TestMem::new();
        let pd = PageDirectory::new(&m.fa, &m.phys, None).unwrap();
        let frame = m.fa.alloc().unwrap();

        pd.map(&m.fa, &m.phys, 0x40_0000, frame, UFLAGS).unwrap();
        let (f, flags) = pd.translate(&m.phys, 0x40_0123).unwrap();
        assert_eq!(f, frame);
        assert!(flags.contains(PageFlags::PRESENT | PageFlags::USER));

        assert_eq!(pd.unmap(&m.phys, 0x40_0000), Some(frame));
        assert!(pd.translate(&m.phys, 0x40_0000).is_none());

        m.fa.put(frame);
        pd.destroy(&m.fa, &m.phys);
    }

    #[test]
    fn refcount_matches_present_mappings() {
        let m = TestMem::new();
        let pd = PageDirectory::new(&m.fa, &m.phys, None).unwrap();
        let frame = m.fa.alloc().unwrap();
        pd.map(&m.fa, &m.phys, 0x1000, frame, UFLAGS).unwrap();
        assert_eq!(m.fa.refcount(frame), 1);

        let clone = pd.clone_user(&m.fa, &m.phys).unwrap();
        assert_eq!(m.fa.refcount(frame), 2, "clone shares the frame");

        clone.destroy(&m.fa, &m.phys);
        assert_eq!(m.fa.refcount(frame), 1);
        pd.destroy(&m.fa, &m.phys);
        assert_eq!(m.fa.free_frames(), FRAMES);
    }

    #[test]
    fn clone_write_protects_both_sides() {
        let m = TestMem::new();
        let pd = PageDirectory::new(&m.fa, &m.phys, None).unwrap();
        let frame = m.fa.alloc().unwrap();
        pd.map(&m.fa, &m.phys, 0x2000, frame, UFLAGS).unwrap();

        let clone = pd.clone_user(&m.fa, &m.phys).unwrap();
        for d in [&pd, &clone] {
            let (_, flags) = d.translate(&m.phys, 0x2000).unwrap();
            assert!(!flags.contains(PageFlags::WRITABLE));
            assert!(flags.contains(PageFlags::COW));
        }

        clone.destroy(&m.fa, &m.phys);
        pd.destroy(&m.fa, &m.phys);
    }

    #[test]
    fn cow_fault_copies_shared_frame() {
        let m = TestMem::new();
        let pd = PageDirectory::new(&m.fa, &m.phys, None).unwrap();
        let frame = m.fa.alloc().unwrap();
        // Write a marker byte through the fake phys mapping.
        unsafe { *m.phys.ptr(frame) = 0xAB };
        pd.map(&m.fa, &m.phys, 0x3000, frame, UFLAGS).unwrap();

        let clone = pd.clone_user(&m.fa, &m.phys).unwrap();
        assert!(pd.handle_cow_fault(&m.fa, &m.phys, 0x3000).unwrap());

        let (parent_frame, parent_flags) = pd.translate(&m.phys, 0x3000).unwrap();
        let (child_frame, _) = clone.translate(&m.phys, 0x3000).unwrap();
        assert_ne!(parent_frame, child_frame, "fault must unshare");
        assert!(parent_flags.contains(PageFlags::WRITABLE));
        // Content was carried into the private copy.
        assert_eq!(unsafe { *m.phys.ptr(parent_frame) }, 0xAB);

        // Child still shares the original, now as the sole holder; its
        // fault just restores the write bit.
        assert!(clone.handle_cow_fault(&m.fa, &m.phys, 0x3000).unwrap());
        let (child_frame2, child_flags) = clone.translate(&m.phys, 0x3000).unwrap();
        assert_eq!(child_frame, child_frame2);
        assert!(child_flags.contains(PageFlags::WRITABLE));

        clone.destroy(&m.fa, &m.phys);
        pd.destroy(&m.fa, &m.phys);
        assert_eq!(m.fa.free_frames(), FRAMES);
    }

    #[test]
    fn cow_fault_rejects_plain_pages() {
        let m = TestMem::new();
        let pd = PageDirectory::new(&m.fa, &m.phys, None).unwrap();
        let frame = m.fa.alloc().unwrap();
        pd.map(&m.fa, &m.phys, 0x5000, frame, PageFlags::USER)
            .unwrap();
        // Read-only but not COW: a real protection violation.
        assert!(!pd.handle_cow_fault(&m.fa, &m.phys, 0x5000).unwrap());
        pd.destroy(&m.fa, &m.phys);
    }

    #[test]
    fn kernel_half_is_shared_not_cloned() {
        let m = TestMem::new();
        let kpd = PageDirectory::new(&m.fa, &m.phys, None).unwrap();
        let kframe = m.fa.alloc().unwrap();
        kpd.map(&m.fa, &m.phys, KERNEL_PAGE_OFFSET + 0x1000, kframe, PageFlags::WRITABLE)
            .unwrap();

        let task_pd = PageDirectory::new(&m.fa, &m.phys, Some(&kpd)).unwrap();
        let (f, _) = task_pd
            .translate(&m.phys, KERNEL_PAGE_OFFSET + 0x1000)
            .unwrap();
        assert_eq!(f, kframe);

        // Destroying the task directory must not touch kernel mappings.
        task_pd.destroy(&m.fa, &m.phys);
        assert!(kpd.translate(&m.phys, KERNEL_PAGE_OFFSET + 0x1000).is_some());
    }
}
