//! Memory-management syscalls.

use lepton_syscall::flags::{MmapFlags, MmapProt};
use lepton_syscall::{Errno, KResult};

use crate::kernel::Kernel;

use super::ret;

/// `brk(2)`: returns the resulting break (queries with addr 0).
pub fn sys_brk(k: &Kernel, addr: usize) -> isize {
    let task = k.current();
    let mut mm = task.mm.lock();
    let Some(space) = mm.as_mut() else {
        return Errno::ENOMEM.to_neg();
    };
    if addr == 0 {
        return space.brk as isize;
    }
    space.set_brk(&k.frames, &k.phys, addr) as isize
}

/// `sbrk`: adjusts the break, returning its previous value.
pub fn sys_sbrk(k: &Kernel, incr: isize) -> isize {
    let inner = || -> KResult<usize> {
        let task = k.current();
        let mut mm = task.mm.lock();
        let space = mm.as_mut().ok_or(Errno::ENOMEM)?;
        space.sbrk(&k.frames, &k.phys, incr)
    };
    ret(inner())
}

/// `mmap`/`mmap2`: anonymous mappings only — the core has no file
/// mapping support, so `MAP_ANONYMOUS` is mandatory.
pub fn sys_mmap(
    k: &Kernel,
    addr: usize,
    len: usize,
    prot: u32,
    flags: u32,
    fd: i32,
    _pgoff: usize,
) -> isize {
    let inner = || -> KResult<usize> {
        let prot = MmapProt::from_bits_truncate(prot);
        let flags = MmapFlags::from_bits_truncate(flags);
        if !flags.contains(MmapFlags::ANONYMOUS) || fd != -1 {
            return Err(Errno::ENOSYS);
        }
        let task = k.current();
        let mut mm = task.mm.lock();
        let space = mm.as_mut().ok_or(Errno::ENOMEM)?;
        space.mmap(&k.frames, &k.phys, addr, len, prot, flags)
    };
    ret(inner())
}

pub fn sys_munmap(k: &Kernel, addr: usize, len: usize) -> isize {
    let inner = || -> KResult<usize> {
        let task = k.current();
        let mut mm = task.mm.lock();
        let space = mm.as_mut().ok_or(Errno::ENOMEM)?;
        space.munmap(&k.frames, &k.phys, addr, len)?;
        Ok(0)
    };
    ret(inner())
}

pub fn sys_mremap(k: &Kernel, old_addr: usize, old_len: usize, new_len: usize) -> isize {
    let inner = || -> KResult<usize> {
        let task = k.current();
        let mut mm = task.mm.lock();
        let space = mm.as_mut().ok_or(Errno::ENOMEM)?;
        space.mremap(&k.frames, &k.phys, old_addr, old_len, new_len)
    };
    ret(inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::mm::AddressSpace;
    use crate::task::Task;

    fn kernel_with_mm() -> Kernel {
        let k = Kernel::new_for_tests();
        let t = Task::new(k.sched.alloc_pid(), "mm");
        let mut space = AddressSpace::new(&k.frames, &k.phys, None).unwrap();
        space.init_brk(0x0800_0000);
        *t.mm.lock() = Some(space);
        k.sched.register(t.clone());
        k.sched.set_current(t);
        k
    }

    #[test]
    fn brk_query_and_move() {
        let k = kernel_with_mm();
        assert_eq!(sys_brk(&k, 0), 0x0800_0000);
        let new = sys_brk(&k, 0x0800_0000 + PAGE_SIZE);
        assert_eq!(new, (0x0800_0000 + PAGE_SIZE) as isize);
        // Out-of-range requests leave the break alone.
        assert_eq!(sys_brk(&k, 0x100), new);
    }

    #[test]
    fn sbrk_returns_old_break() {
        let k = kernel_with_mm();
        assert_eq!(sys_sbrk(&k, PAGE_SIZE as isize), 0x0800_0000);
        assert_eq!(sys_brk(&k, 0), (0x0800_0000 + PAGE_SIZE) as isize);
    }

    #[test]
    fn mmap_requires_anonymous() {
        let k = kernel_with_mm();
        let rc = sys_mmap(&k, 0, PAGE_SIZE, 3, MmapFlags::PRIVATE.bits(), 3, 0);
        assert_eq!(rc, Errno::ENOSYS.to_neg());
    }

    #[test]
    fn mmap_munmap_roundtrip() {
        let k = kernel_with_mm();
        let flags = (MmapFlags::PRIVATE | MmapFlags::ANONYMOUS).bits();
        let addr = sys_mmap(&k, 0, 2 * PAGE_SIZE, 3, flags, -1, 0);
        assert!(addr > 0);
        assert_eq!(sys_munmap(&k, addr as usize, 2 * PAGE_SIZE), 0);
    }
}
