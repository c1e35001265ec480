//! `execve` — replacing the user image.
//!
//! Binary formats are pluggable: loaders register in the
//! [`BinfmtRegistry`], `execve` walks the list until one claims the
//! image, then tears down the old user half, lets the loader install
//! the new one, resets caught signal handlers and closes close-on-exec
//! descriptors.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use lepton_core::sync::SpinLock;
use lepton_syscall::flags::OpenFlags;
use lepton_syscall::{Errno, KResult};

use crate::fs::namei::open_namei;
use crate::fs::read_write;
use crate::kernel::Kernel;

/// What a loader produces: the new image's entry state.
#[derive(Debug, Clone, Copy)]
pub struct ExecImage {
    /// Userspace entry point.
    pub entry: usize,
    /// Initial user stack pointer (argv/envp already written).
    pub stack_top: usize,
    /// Bottom of the heap segment (`brk` starts here).
    pub brk: usize,
}

/// A binary-format loader.
pub trait Binfmt: Send + Sync {
    /// Loader name for diagnostics.
    fn name(&self) -> &'static str;

    /// Cheap magic check: does this loader understand the image?
    fn claims(&self, image: &[u8]) -> bool;

    /// Maps the image into the *current* task's (already emptied)
    /// address space and builds the initial stack.
    fn load(
        &self,
        k: &Kernel,
        image: &[u8],
        argv: &[String],
        envp: &[String],
    ) -> KResult<ExecImage>;
}

/// The registered loader list, walked in registration order.
pub struct BinfmtRegistry {
    list: SpinLock<Vec<Arc<dyn Binfmt>>>,
}

impl Default for BinfmtRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BinfmtRegistry {
    pub const fn new() -> Self {
        Self {
            list: SpinLock::new(Vec::new()),
        }
    }

    /// Registers a loader.
    pub fn register(&self, fmt: Arc<dyn Binfmt>) {
        lepton_core::kinfo!("binfmt: registered {}", fmt.name());
        self.list.lock().push(fmt);
    }

    /// Finds the loader claiming `image`.
    pub fn find(&self, image: &[u8]) -> Option<Arc<dyn Binfmt>> {
        self.list.lock().iter().find(|f| f.claims(image)).cloned()
    }
}

/// Replaces the current task's image with the program at `path`.
///
/// On success returns the new [`ExecImage`]; the arch layer rebuilds
/// the user trap frame from it. On any failure before the teardown
/// point the old image is untouched.
pub fn do_exec(k: &Kernel, path: &str, argv: &[String], envp: &[String]) -> KResult<ExecImage> {
    let task = k.current();
    let creds = k.walk_creds();
    let (cwd, root) = k.walk_bases()?;

    let file = open_namei(k, &cwd, &root, path, OpenFlags::empty(), 0, creds)?;
    if !file.inode.permission(creds.euid, creds.egid, 0o1) {
        return Err(Errno::EACCES);
    }

    // Pull the whole image in before touching the old address space.
    let size = file.inode.size().max(0) as usize;
    let mut image = vec![0u8; size];
    let mut off = 0;
    while off < size {
        let n = read_write::pread(k, &file, &mut image[off..], off as i64)?;
        if n == 0 {
            break;
        }
        off += n;
    }
    image.truncate(off);

    let loader = k.binfmts.find(&image).ok_or(Errno::EINVAL)?;

    // Point of no return: drop the old user half.
    {
        let mut mm = task.mm.lock();
        if let Some(space) = mm.as_mut() {
            space.clear(&k.frames, &k.phys);
        }
    }

    let exec = loader.load(k, &image, argv, envp)?;

    {
        let mut mm = task.mm.lock();
        if let Some(space) = mm.as_mut() {
            space.init_brk(exec.brk);
        }
    }

    // Caught handlers revert to default; ignored ones survive.
    task.signals.lock().reset_for_exec();

    // Close-on-exec descriptors go away, with their release hooks.
    let closed = task.fds.lock().take_cloexec();
    for file in closed {
        k.close_file(file);
    }

    // The command name follows the program.
    let name = path.rsplit('/').next().unwrap_or(path);
    *task.comm.lock() = String::from(name);

    Ok(exec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tmpfs::Tmpfs;
    use crate::mm::AddressSpace;
    use crate::task::Task;
    use lepton_syscall::abi::DevT;
    use lepton_syscall::signal::{SigactionAbi, SIGUSR1, SIG_DFL, SIG_IGN};

    /// Test loader: a two-byte magic, fixed entry.
    struct FlatBin;

    impl Binfmt for FlatBin {
        fn name(&self) -> &'static str {
            "flat"
        }

        fn claims(&self, image: &[u8]) -> bool {
            image.starts_with(b"#F")
        }

        fn load(
            &self,
            _k: &Kernel,
            _image: &[u8],
            _argv: &[String],
            _envp: &[String],
        ) -> KResult<ExecImage> {
            Ok(ExecImage {
                entry: 0x1000,
                stack_top: 0x0900_0000,
                brk: 0x0800_0000,
            })
        }
    }

    fn exec_kernel() -> Kernel {
        let k = Kernel::new_for_tests();
        k.vfs.register_filesystem(Arc::new(Tmpfs));
        k.vfs.mount_root(&k, "tmpfs", DevT::new(0, 1)).unwrap();
        k.binfmts.register(Arc::new(FlatBin));

        let t = Task::new(k.sched.alloc_pid(), "sh");
        *t.mm.lock() = Some(AddressSpace::new(&k.frames, &k.phys, None).unwrap());
        k.sched.register(t.clone());
        k.sched.set_current(t);
        k
    }

    fn write_program(k: &Kernel, path: &str, content: &[u8], mode: u32) {
        let (cwd, root) = k.walk_bases().unwrap();
        let file = open_namei(
            k,
            &cwd,
            &root,
            path,
            OpenFlags::CREAT | OpenFlags::WRONLY,
            mode,
            crate::fs::namei::WalkCreds::ROOT,
        )
        .unwrap();
        read_write::write(k, &file, content).unwrap();
    }

    #[test]
    fn exec_replaces_image_and_comm() {
        let k = exec_kernel();
        write_program(&k, "/prog", b"#F payload", 0o755);

        let exec = do_exec(&k, "/prog", &[], &[]).unwrap();
        assert_eq!(exec.entry, 0x1000);
        let task = k.current();
        assert_eq!(&*task.comm.lock(), "prog");
        assert_eq!(task.mm.lock().as_ref().unwrap().brk, 0x0800_0000);
    }

    #[test]
    fn unknown_format_rejected_before_teardown() {
        let k = exec_kernel();
        write_program(&k, "/junk", b"not a binary", 0o755);

        // Give the task a mapped page to prove the image survived.
        {
            let task = k.current();
            let mut mm = task.mm.lock();
            let space = mm.as_mut().unwrap();
            space.init_brk(0x0800_0000);
            space
                .sbrk(&k.frames, &k.phys, crate::config::PAGE_SIZE as isize)
                .unwrap();
        }

        assert_eq!(do_exec(&k, "/junk", &[], &[]).unwrap_err(), Errno::EINVAL);
        let task = k.current();
        assert_eq!(task.mm.lock().as_ref().unwrap().pd.user_pages(&k.phys), 1);
    }

    #[test]
    fn exec_needs_execute_permission() {
        let k = exec_kernel();
        write_program(&k, "/noexec", b"#F x", 0o644);
        assert_eq!(
            do_exec(&k, "/noexec", &[], &[]).unwrap_err(),
            Errno::EACCES
        );
    }

    #[test]
    fn exec_resets_handlers_and_closes_cloexec() {
        let k = exec_kernel();
        write_program(&k, "/prog", b"#F", 0o755);

        let task = k.current();
        task.signals.lock().set_action(
            SIGUSR1,
            SigactionAbi {
                sa_handler: 0xBEEF,
                sa_flags: 0,
                sa_restorer: 0,
                sa_mask: 0,
            },
        );
        task.signals.lock().set_action(
            lepton_syscall::signal::SIGINT,
            SigactionAbi {
                sa_handler: SIG_IGN,
                sa_flags: 0,
                sa_restorer: 0,
                sa_mask: 0,
            },
        );

        let (keep, gone) = {
            let (cwd, root) = k.walk_bases().unwrap();
            let creds = crate::fs::namei::WalkCreds::ROOT;
            let keep = open_namei(&k, &cwd, &root, "/prog", OpenFlags::empty(), 0, creds).unwrap();
            let gone = open_namei(&k, &cwd, &root, "/prog", OpenFlags::empty(), 0, creds).unwrap();
            let mut fds = task.fds.lock();
            (fds.alloc(keep, false).unwrap(), fds.alloc(gone, true).unwrap())
        };

        do_exec(&k, "/prog", &[], &[]).unwrap();

        let sig = task.signals.lock();
        assert_eq!(sig.action(SIGUSR1).unwrap().sa_handler, SIG_DFL);
        assert_eq!(
            sig.action(lepton_syscall::signal::SIGINT).unwrap().sa_handler,
            SIG_IGN
        );
        drop(sig);

        let fds = task.fds.lock();
        assert!(fds.get(keep).is_ok());
        assert_eq!(fds.get(gone).unwrap_err(), Errno::EBADF);
    }
}
