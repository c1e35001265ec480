//! System-information syscalls.

use lepton_syscall::abi::{Sysinfo, Utsname};
use lepton_syscall::KResult;

use crate::config::{HZ, PAGE_SIZE, RELEASE};
use crate::kernel::Kernel;

use super::{ret, uaccess};

pub fn sys_uname(k: &Kernel, buf: usize) -> isize {
    let inner = || -> KResult<usize> {
        let nodename = k.nodename.lock().clone();
        let uts = Utsname::new("Lepton", &nodename, RELEASE, "lepton kernel", "i586");
        uaccess::write_user(buf, &uts)?;
        Ok(0)
    };
    ret(inner())
}

pub fn sys_sysinfo(k: &Kernel, buf: usize) -> isize {
    let inner = || -> KResult<usize> {
        let info = Sysinfo {
            uptime: (k.timers.jiffies() / HZ) as i32,
            totalram: (k.frames.total_frames() * PAGE_SIZE) as u32,
            freeram: (k.frames.free_frames() * PAGE_SIZE) as u32,
            bufferram: (k.buffers.cached() * PAGE_SIZE) as u32,
            procs: k.sched.task_count() as u16,
            mem_unit: 1,
            ..Sysinfo::default()
        };
        uaccess::write_user(buf, &info)?;
        Ok(0)
    };
    ret(inner())
}

pub fn sys_getrandom(k: &Kernel, buf: usize, len: usize, _flags: u32) -> isize {
    let inner = || -> KResult<usize> {
        // SAFETY: the range is validated by user_slice_mut; the fill
        // happens without blocking.
        let slice = unsafe { uaccess::user_slice_mut(buf, len)? };
        k.fill_random(slice);
        Ok(len)
    };
    ret(inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn kernel_with_task() -> Kernel {
        let k = Kernel::new_for_tests();
        let t = Task::new(k.sched.alloc_pid(), "info");
        k.sched.register(t.clone());
        k.sched.set_current(t);
        k
    }

    #[test]
    fn uname_reports_sysname() {
        let k = kernel_with_task();
        let mut uts = Utsname::new("", "", "", "", "");
        assert_eq!(sys_uname(&k, &mut uts as *mut Utsname as usize), 0);
        assert_eq!(&uts.sysname[..6], b"Lepton");
        assert_eq!(&uts.machine[..4], b"i586");
    }

    #[test]
    fn sysinfo_accounts_memory_and_tasks() {
        let k = kernel_with_task();
        let mut info = Sysinfo::default();
        assert_eq!(sys_sysinfo(&k, &mut info as *mut Sysinfo as usize), 0);
        assert_eq!(info.procs, 1);
        assert!(info.totalram >= info.freeram);
        assert_eq!(info.mem_unit, 1);
    }

    #[test]
    fn getrandom_fills_buffer() {
        let k = kernel_with_task();
        let mut buf = [0u8; 32];
        let n = sys_getrandom(&k, buf.as_mut_ptr() as usize, buf.len(), 0);
        assert_eq!(n, 32);
        assert_ne!(buf, [0u8; 32]);
    }
}
