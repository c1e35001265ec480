//! Time-related syscalls.

use lepton_syscall::abi::Timespec64;
use lepton_syscall::{Errno, KResult};

use crate::config::HZ;
use crate::kernel::Kernel;
use crate::time::TimerWheel;

use super::{ret, uaccess};

/// `nanosleep` argument layout (legacy 32-bit timespec).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct OldTimespec {
    pub tv_sec: i32,
    pub tv_nsec: i32,
}

pub fn sys_nanosleep(k: &Kernel, req_ptr: usize, rem_ptr: usize) -> isize {
    let inner = || -> KResult<usize> {
        let req: OldTimespec = uaccess::read_user(req_ptr)?;
        if req.tv_sec < 0 || req.tv_nsec < 0 || req.tv_nsec >= 1_000_000_000 {
            return Err(Errno::EINVAL);
        }
        let ms = req.tv_sec as u64 * 1000 + (req.tv_nsec as u64).div_ceil(1_000_000);
        let deadline = k.timers.jiffies() + TimerWheel::msecs_to_jiffies(ms);

        match k.sleep_until(deadline) {
            Ok(()) => Ok(0),
            Err(e) => {
                // Interrupted: report what is left.
                if rem_ptr != 0 {
                    let left = deadline.saturating_sub(k.timers.jiffies());
                    let rem = OldTimespec {
                        tv_sec: (left / HZ) as i32,
                        tv_nsec: ((left % HZ) * (1_000_000_000 / HZ)) as i32,
                    };
                    uaccess::write_user(rem_ptr, &rem)?;
                }
                Err(e)
            }
        }
    };
    ret(inner())
}

/// Whole-second sleep; the remainder on interruption is discarded.
pub fn sys_sleep(k: &Kernel, seconds: usize) -> isize {
    match k.msleep(seconds as u64 * 1000) {
        Ok(()) | Err(_) => 0,
    }
}

pub fn sys_clock_gettime64(k: &Kernel, clock_id: u32, tp: usize) -> isize {
    const CLOCK_REALTIME: u32 = 0;
    const CLOCK_MONOTONIC: u32 = 1;
    let inner = || -> KResult<usize> {
        let jiffies = k.timers.jiffies();
        let (sec, extra_ns) = (jiffies / HZ, (jiffies % HZ) * (1_000_000_000 / HZ));
        let ts = match clock_id {
            CLOCK_REALTIME => Timespec64 {
                tv_sec: (k.boot_epoch + sec) as i64,
                tv_nsec: extra_ns as i64,
            },
            CLOCK_MONOTONIC => Timespec64 {
                tv_sec: sec as i64,
                tv_nsec: extra_ns as i64,
            },
            _ => return Err(Errno::EINVAL),
        };
        uaccess::write_user(tp, &ts)?;
        Ok(0)
    };
    ret(inner())
}
