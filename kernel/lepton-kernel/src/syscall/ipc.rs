//! The `sys_ipc` multiplexer.
//!
//! Only the shared-memory family is wired up; the other System V
//! families report `ENOSYS`.

use lepton_syscall::flags::{IPC_RMID, IPC_SHMAT, IPC_SHMCTL, IPC_SHMDT, IPC_SHMGET};
use lepton_syscall::{Errno, KResult};

use crate::kernel::Kernel;

use super::{ret, uaccess};

pub fn sys_ipc(
    k: &Kernel,
    call: usize,
    first: usize,
    second: usize,
    third: usize,
    ptr: usize,
) -> isize {
    match call {
        IPC_SHMGET => ret(k
            .shm
            .shmget(k, first as u32, second, third as u32)
            .map(|id| id as usize)),
        IPC_SHMAT => {
            let inner = || -> KResult<usize> {
                let addr = k.shm.shmat(k, first as i32, ptr)?;
                // The mapped address also lands at *third.
                if third != 0 {
                    uaccess::write_user(third, &addr)?;
                }
                Ok(addr)
            };
            ret(inner())
        }
        IPC_SHMDT => ret(k.shm.shmdt(k, ptr).map(|_| 0)),
        IPC_SHMCTL => {
            let inner = || -> KResult<usize> {
                match second as u32 {
                    IPC_RMID => {
                        k.shm.remove(k, first as i32)?;
                        Ok(0)
                    }
                    _ => Err(Errno::ENOSYS),
                }
            };
            ret(inner())
        }
        _ => Errno::ENOSYS.to_neg(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::mm::AddressSpace;
    use crate::task::Task;
    use lepton_syscall::flags::IPC_CREAT;

    fn kernel_with_mm() -> Kernel {
        let k = Kernel::new_for_tests();
        let t = Task::new(k.sched.alloc_pid(), "ipc");
        *t.mm.lock() = Some(AddressSpace::new(&k.frames, &k.phys, None).unwrap());
        k.sched.register(t.clone());
        k.sched.set_current(t);
        k
    }

    #[test]
    fn shm_family_through_the_multiplexer() {
        let k = kernel_with_mm();
        let id = sys_ipc(&k, IPC_SHMGET, 77, PAGE_SIZE, IPC_CREAT as usize, 0);
        assert!(id > 0);

        let mut raddr = 0usize;
        let addr = sys_ipc(
            &k,
            IPC_SHMAT,
            id as usize,
            0,
            &mut raddr as *mut usize as usize,
            0,
        );
        assert!(addr > 0);
        assert_eq!(raddr, addr as usize);

        assert_eq!(sys_ipc(&k, IPC_SHMDT, 0, 0, 0, addr as usize), 0);
        assert_eq!(
            sys_ipc(&k, IPC_SHMCTL, id as usize, IPC_RMID as usize, 0, 0),
            0
        );
        assert_eq!(k.shm.count(), 0);
    }

    #[test]
    fn other_families_are_enosys() {
        let k = kernel_with_mm();
        // Semaphore family subcall (semop = 1).
        assert_eq!(sys_ipc(&k, 1, 0, 0, 0, 0), Errno::ENOSYS.to_neg());
        // Message queues (msgsnd = 11).
        assert_eq!(sys_ipc(&k, 11, 0, 0, 0, 0), Errno::ENOSYS.to_neg());
    }
}
