//! End-to-end scenarios driven through the syscall surface.

use std::sync::Arc;

use lepton_kernel::fs::tmpfs::Tmpfs;
use lepton_kernel::fs::namei::WalkCreds;
use lepton_kernel::kernel::Kernel;
use lepton_kernel::mm::AddressSpace;
use lepton_kernel::syscall::{self, dispatch};
use lepton_kernel::task::exec::{Binfmt, ExecImage};
use lepton_kernel::task::{Task, TaskState};
use lepton_syscall::abi::DevT;
use lepton_syscall::flags::{OpenFlags, SEEK_CUR, SEEK_SET, WaitOptions};
use lepton_syscall::signal::{SigactionAbi, SIGUSR1};
use lepton_syscall::{nr, Errno, KResult};

/// Minimal test binary format: `#!L` magic, fixed entry addresses.
struct FlatBin;

impl Binfmt for FlatBin {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn claims(&self, image: &[u8]) -> bool {
        image.starts_with(b"#!L")
    }

    fn load(
        &self,
        _k: &Kernel,
        _image: &[u8],
        _argv: &[String],
        _envp: &[String],
    ) -> KResult<ExecImage> {
        Ok(ExecImage {
            entry: 0x0804_8000,
            stack_top: 0x0900_0000,
            brk: 0x0810_0000,
        })
    }
}

/// Boots a kernel with a tmpfs root, a flat-binary loader and an init
/// task installed as current.
fn boot() -> Kernel {
    let k = Kernel::new_for_tests();
    k.vfs.register_filesystem(Arc::new(Tmpfs));
    k.vfs.mount_root(&k, "tmpfs", DevT::new(0, 1)).unwrap();
    k.binfmts.register(Arc::new(FlatBin));

    let init = Task::new(k.sched.alloc_pid(), "init");
    assert_eq!(init.pid, 1);
    *init.mm.lock() = Some(AddressSpace::new(&k.frames, &k.phys, None).unwrap());
    k.sched.register(init.clone());
    k.sched.set_current(init);
    k
}

fn sys(k: &Kernel, nr: usize, args: [usize; 6]) -> isize {
    dispatch(k, nr, args)
}

fn open(k: &Kernel, path: &str, flags: OpenFlags, mode: u32) -> isize {
    let cpath = std::ffi::CString::new(path).unwrap();
    sys(
        k,
        nr::OPEN,
        [cpath.as_ptr() as usize, flags.bits() as usize, mode as usize, 0, 0, 0],
    )
}

fn write_file(k: &Kernel, path: &str, data: &[u8], mode: u32) {
    let fd = open(k, path, OpenFlags::CREAT | OpenFlags::WRONLY, mode);
    assert!(fd >= 0, "open failed: {fd}");
    let n = sys(
        k,
        nr::WRITE,
        [fd as usize, data.as_ptr() as usize, data.len(), 0, 0, 0],
    );
    assert_eq!(n, data.len() as isize);
    assert_eq!(sys(k, nr::CLOSE, [fd as usize, 0, 0, 0, 0, 0]), 0);
}

#[test]
fn fork_exec_wait_roundtrip() {
    let k = boot();
    write_file(&k, "/bin_echo", b"#!L echo image", 0o755);

    // Parent forks.
    let child_pid = sys(&k, nr::FORK, [0; 6]);
    assert!(child_pid > 0);
    let child = k.sched.task(child_pid as u32).unwrap();

    // The child execs the program and exits cleanly.
    k.sched.set_current(child.clone());
    let path = std::ffi::CString::new("/bin_echo").unwrap();
    let entry = sys(&k, nr::EXECVE, [path.as_ptr() as usize, 0, 0, 0, 0, 0]);
    assert_eq!(entry, 0x0804_8000);
    assert_eq!(&*child.comm.lock(), "bin_echo");
    sys(&k, nr::EXIT, [0; 6]);
    assert_eq!(child.state(), TaskState::Zombie);

    // Parent reaps: pid matches, exit status is 0, no zombie remains.
    let parent = k.sched.task(1).unwrap();
    k.sched.set_current(parent);
    let mut status: u32 = 0xFFFF_FFFF;
    let got = sys(
        &k,
        nr::WAIT4,
        [usize::MAX, &mut status as *mut u32 as usize, 0, 0, 0, 0],
    );
    assert_eq!(got, child_pid);
    assert_eq!(status >> 8, 0, "WIFEXITED with status 0");
    assert!(k.sched.task(child_pid as u32).is_none(), "no zombie");
}

#[test]
fn pipe_ping() {
    let k = boot();
    let mut fds = [0i32; 2];
    assert_eq!(
        sys(&k, nr::PIPE, [fds.as_mut_ptr() as usize, 0, 0, 0, 0, 0]),
        0
    );

    // "Child" writes one byte into the pipe.
    let payload = b"x";
    assert_eq!(
        sys(
            &k,
            nr::WRITE,
            [fds[1] as usize, payload.as_ptr() as usize, 1, 0, 0, 0]
        ),
        1
    );

    // "Parent" reads it back.
    let mut buf = [0u8; 4];
    let n = sys(
        &k,
        nr::READ,
        [fds[0] as usize, buf.as_mut_ptr() as usize, buf.len(), 0, 0, 0],
    );
    assert_eq!(n, 1);
    assert_eq!(buf[0], b'x');
}

#[test]
fn signal_delivery_and_sigreturn() {
    let k = boot();

    // Task A installs a SIGUSR1 handler.
    let action = SigactionAbi {
        sa_handler: 0x0990_0000,
        sa_flags: 0,
        sa_restorer: 0,
        sa_mask: 0,
    };
    assert_eq!(
        sys(
            &k,
            nr::SIGACTION,
            [SIGUSR1 as usize, &action as *const SigactionAbi as usize, 0, 0, 0, 0]
        ),
        0
    );

    // Task B (a fork) signals A.
    let b_pid = sys(&k, nr::FORK, [0; 6]);
    let b = k.sched.task(b_pid as u32).unwrap();
    k.sched.set_current(b);
    assert_eq!(sys(&k, nr::KILL, [1, SIGUSR1 as usize, 0, 0, 0, 0]), 0);

    // Delivery happens in A's context at its next boundary.
    let a = k.sched.task(1).unwrap();
    k.sched.set_current(a.clone());

    // Give A's saved context recognizable bits first.
    let before = lepton_kernel::arch::TaskContext {
        edi: 0x11,
        esi: 0x22,
        ebx: 0x33,
        ebp: 0x44,
        esp: 0x55,
        eip: 0x66,
    };
    unsafe { *a.context.get() = before };

    let delivered = k.return_to_user().expect("handler scheduled");
    assert_eq!(delivered.0, SIGUSR1);
    assert_eq!(delivered.1.sa_handler, 0x0990_0000);

    // The handler returns through sigreturn; the context comes back
    // bit-identical.
    unsafe { *a.context.get() = lepton_kernel::arch::TaskContext::default() };
    assert_eq!(sys(&k, nr::SIGRETURN, [0; 6]), 0);
    let after = unsafe { *a.context.get() };
    assert_eq!(after.eip, 0x66);
    assert_eq!(after.esp, 0x55);
    assert_eq!(after.edi, 0x11);
}

#[test]
fn nanosleep_completes_after_ticks() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let k = Arc::new(boot());
    let done = Arc::new(AtomicBool::new(false));

    // A ticker thread stands in for the timer interrupt, running until
    // the sleeper returns.
    let ticker = {
        let k = k.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                k.timer_tick(false);
                std::thread::yield_now();
            }
        })
    };

    // nanosleep(0.5s) — 50 jiffies at HZ=100.
    let req = syscall::time::OldTimespec {
        tv_sec: 0,
        tv_nsec: 500_000_000,
    };
    let start = k.timers.jiffies();
    let rc = sys(
        &k,
        nr::NANOSLEEP,
        [&req as *const _ as usize, 0, 0, 0, 0, 0],
    );
    done.store(true, Ordering::Release);
    ticker.join().unwrap();

    assert_eq!(rc, 0);
    assert!(k.timers.jiffies() - start >= 50, "slept at least 50 jiffies");
    assert_eq!(k.current().state(), TaskState::Running);
}

#[test]
fn path_walk_crosses_mount() {
    let k = boot();

    // Build /mnt on the root filesystem and note its inode.
    let mnt_path = std::ffi::CString::new("/mnt").unwrap();
    assert_eq!(
        sys(&k, nr::MKDIR, [mnt_path.as_ptr() as usize, 0o755, 0, 0, 0, 0]),
        0
    );
    let (cwd, root) = k.walk_bases().unwrap();
    let mnt = lepton_kernel::fs::namei::lookup(&k, &cwd, &root, "/mnt", true, WalkCreds::ROOT)
        .unwrap();
    let covered_ino = mnt.inode().unwrap().ino;
    let covered_dev = mnt.inode().unwrap().dev();

    // Mount a second tmpfs instance on /mnt and create a file inside.
    k.vfs.mount(&k, "tmpfs", DevT::new(0, 2), &mnt).unwrap();
    write_file(&k, "/mnt/foo", b"over here", 0o644);

    // Resolving /mnt/foo must land on filesystem B, not the covered
    // directory of A.
    let foo = lepton_kernel::fs::namei::lookup(&k, &cwd, &root, "/mnt/foo", true, WalkCreds::ROOT)
        .unwrap();
    let foo_inode = foo.inode().unwrap();
    assert_eq!(foo_inode.dev(), DevT::new(0, 2));
    assert_ne!((foo_inode.dev(), foo_inode.ino), (covered_dev, covered_ino));

    // `..` from the mounted root crosses back to the original parent.
    let dotdot =
        lepton_kernel::fs::namei::lookup(&k, &cwd, &root, "/mnt/..", true, WalkCreds::ROOT)
            .unwrap();
    assert!(Arc::ptr_eq(&dotdot, &root));
}

#[test]
fn symlink_loop_is_eloop() {
    let k = boot();
    let a = std::ffi::CString::new("/a").unwrap();
    let b = std::ffi::CString::new("/b").unwrap();
    // a -> b, b -> a.
    assert_eq!(
        sys(&k, nr::SYMLINK, [b.as_ptr() as usize, a.as_ptr() as usize, 0, 0, 0, 0]),
        0
    );
    assert_eq!(
        sys(&k, nr::SYMLINK, [a.as_ptr() as usize, b.as_ptr() as usize, 0, 0, 0, 0]),
        0
    );
    let fd = open(&k, "/a", OpenFlags::empty(), 0);
    assert_eq!(fd, Errno::ELOOP.to_neg());
}

#[test]
fn write_seek_read_roundtrip() {
    let k = boot();
    let fd = open(&k, "/data", OpenFlags::CREAT | OpenFlags::RDWR, 0o644);
    assert!(fd >= 0);

    let out = b"kernel bytes";
    assert_eq!(
        sys(
            &k,
            nr::WRITE,
            [fd as usize, out.as_ptr() as usize, out.len(), 0, 0, 0]
        ),
        out.len() as isize
    );

    // Seek back over what was written and read it again.
    let back = -(out.len() as isize);
    let pos = sys(&k, nr::LSEEK, [fd as usize, back as usize, SEEK_CUR as usize, 0, 0, 0]);
    assert_eq!(pos, 0);

    let mut buf = [0u8; 32];
    let n = sys(
        &k,
        nr::READ,
        [fd as usize, buf.as_mut_ptr() as usize, buf.len(), 0, 0, 0],
    );
    assert_eq!(n, out.len() as isize);
    assert_eq!(&buf[..n as usize], out);

    // Negative absolute positions are rejected.
    let bad = sys(&k, nr::LSEEK, [fd as usize, (-5isize) as usize, SEEK_SET as usize, 0, 0, 0]);
    assert_eq!(bad, Errno::EINVAL.to_neg());
}

#[test]
fn open_close_leaves_refcounts_alone() {
    let k = boot();
    write_file(&k, "/probe", b"x", 0o644);

    let (cwd, root) = k.walk_bases().unwrap();
    let dentry =
        lepton_kernel::fs::namei::lookup(&k, &cwd, &root, "/probe", true, WalkCreds::ROOT)
            .unwrap();
    let inode = dentry.inode().unwrap();
    let inode_refs = Arc::strong_count(&inode);
    let dentry_refs = Arc::strong_count(&dentry);

    let fd = open(&k, "/probe", OpenFlags::empty(), 0);
    assert!(fd >= 0);
    assert!(Arc::strong_count(&inode) > inode_refs, "open holds the inode");
    assert_eq!(sys(&k, nr::CLOSE, [fd as usize, 0, 0, 0, 0, 0]), 0);

    assert_eq!(Arc::strong_count(&inode), inode_refs);
    assert_eq!(Arc::strong_count(&dentry), dentry_refs);
}

#[test]
fn dup_shares_and_close_releases() {
    let k = boot();
    let fd = open(&k, "/dupfile", OpenFlags::CREAT | OpenFlags::RDWR, 0o644);
    assert!(fd >= 0);

    let file = k.current().fds.lock().get(fd as usize).unwrap();
    let before = Arc::strong_count(&file);

    let newfd = sys(&k, nr::DUP, [fd as usize, 0, 0, 0, 0, 0]);
    assert!(newfd > fd);
    assert_eq!(Arc::strong_count(&file), before + 1);

    assert_eq!(sys(&k, nr::CLOSE, [newfd as usize, 0, 0, 0, 0, 0]), 0);
    assert_eq!(Arc::strong_count(&file), before);
}

#[test]
fn mkdir_rmdir_restores_parent_links() {
    let k = boot();
    let (cwd, root) = k.walk_bases().unwrap();
    let root_inode = root.inode().unwrap();
    let links_before = root_inode.meta.lock().nlink;

    let p = std::ffi::CString::new("/newdir").unwrap();
    assert_eq!(sys(&k, nr::MKDIR, [p.as_ptr() as usize, 0o755, 0, 0, 0, 0]), 0);
    assert_eq!(root_inode.meta.lock().nlink, links_before + 1);

    assert_eq!(sys(&k, nr::RMDIR, [p.as_ptr() as usize, 0, 0, 0, 0, 0]), 0);
    assert_eq!(root_inode.meta.lock().nlink, links_before);

    // The name is gone.
    let again = lepton_kernel::fs::namei::lookup(&k, &cwd, &root, "/newdir", true, WalkCreds::ROOT);
    assert_eq!(again.unwrap_err(), Errno::ENOENT);
}

#[test]
fn chdir_getcwd_roundtrip() {
    let k = boot();
    let p = std::ffi::CString::new("/work/inner").unwrap();
    let wp = std::ffi::CString::new("/work").unwrap();
    assert_eq!(sys(&k, nr::MKDIR, [wp.as_ptr() as usize, 0o755, 0, 0, 0, 0]), 0);
    assert_eq!(sys(&k, nr::MKDIR, [p.as_ptr() as usize, 0o755, 0, 0, 0, 0]), 0);
    assert_eq!(sys(&k, nr::CHDIR, [p.as_ptr() as usize, 0, 0, 0, 0, 0]), 0);

    let mut buf = [0u8; 64];
    let n = sys(&k, nr::GETCWD, [buf.as_mut_ptr() as usize, buf.len(), 0, 0, 0, 0]);
    assert_eq!(n, "/work/inner".len() as isize + 1);
    assert_eq!(&buf[..n as usize - 1], b"/work/inner");

    // Relative resolution now starts at the new cwd.
    write_file(&k, "rel", b"relative", 0o644);
    let fd = open(&k, "/work/inner/rel", OpenFlags::empty(), 0);
    assert!(fd >= 0);
}

#[test]
fn append_mode_pins_writes_to_eof() {
    let k = boot();
    write_file(&k, "/log", b"first|", 0o644);

    let fd = open(&k, "/log", OpenFlags::WRONLY | OpenFlags::APPEND, 0);
    assert!(fd >= 0);
    // Rewind explicitly; append must ignore the position anyway.
    sys(&k, nr::LSEEK, [fd as usize, 0, SEEK_SET as usize, 0, 0, 0]);
    let tail = b"second";
    assert_eq!(
        sys(
            &k,
            nr::WRITE,
            [fd as usize, tail.as_ptr() as usize, tail.len(), 0, 0, 0]
        ),
        tail.len() as isize
    );

    let rfd = open(&k, "/log", OpenFlags::empty(), 0);
    let mut buf = [0u8; 32];
    let n = sys(
        &k,
        nr::READ,
        [rfd as usize, buf.as_mut_ptr() as usize, buf.len(), 0, 0, 0],
    );
    assert_eq!(&buf[..n as usize], b"first|second");
}

#[test]
fn zero_length_read_touches_nothing() {
    let k = boot();
    let fd = open(&k, "/empty-read", OpenFlags::CREAT | OpenFlags::RDWR, 0o644);
    let rc = sys(&k, nr::READ, [fd as usize, 0, 0, 0, 0, 0]);
    assert_eq!(rc, 0, "count 0 reads 0 even with a null buffer");
}

#[test]
fn getdents_lists_directory() {
    let k = boot();
    write_file(&k, "/one", b"1", 0o644);
    write_file(&k, "/two", b"2", 0o644);

    let fd = open(&k, "/", OpenFlags::DIRECTORY, 0);
    assert!(fd >= 0);

    let mut buf = [0u8; 512];
    let n = sys(
        &k,
        nr::GETDENTS64,
        [fd as usize, buf.as_mut_ptr() as usize, buf.len(), 0, 0, 0],
    );
    assert!(n > 0);

    // Walk the records, collecting names.
    let mut names = Vec::new();
    let mut off = 0usize;
    while off < n as usize {
        let reclen = u16::from_le_bytes([buf[off + 16], buf[off + 17]]) as usize;
        let name_start = off + 19;
        let name_end = buf[name_start..off + reclen]
            .iter()
            .position(|&b| b == 0)
            .map(|p| name_start + p)
            .unwrap();
        names.push(String::from_utf8(buf[name_start..name_end].to_vec()).unwrap());
        off += reclen;
    }
    assert_eq!(names, [".", "..", "one", "two"]);

    // The directory is exhausted now.
    let again = sys(
        &k,
        nr::GETDENTS64,
        [fd as usize, buf.as_mut_ptr() as usize, buf.len(), 0, 0, 0],
    );
    assert_eq!(again, 0);
}

#[test]
fn unlink_evicts_dead_inode_from_cache() {
    let k = boot();
    write_file(&k, "/shortlived", b"x", 0o644);

    let (cwd, root) = k.walk_bases().unwrap();
    let dentry =
        lepton_kernel::fs::namei::lookup(&k, &cwd, &root, "/shortlived", true, WalkCreds::ROOT)
            .unwrap();
    let live_before = k.vfs.icache.live();
    assert!(live_before >= 1);
    drop(dentry);

    let p = std::ffi::CString::new("/shortlived").unwrap();
    assert_eq!(sys(&k, nr::UNLINK, [p.as_ptr() as usize, 0, 0, 0, 0, 0]), 0);
    assert!(k.vfs.icache.live() < live_before, "dead inode left the cache");

    let gone = open(&k, "/shortlived", OpenFlags::empty(), 0);
    assert_eq!(gone, Errno::ENOENT.to_neg());
}

#[test]
fn poll_and_select_see_pipe_readiness() {
    use lepton_syscall::abi::PollFd;
    use lepton_syscall::flags::PollEvents;

    let k = boot();
    let mut fds = [0i32; 2];
    assert_eq!(
        sys(&k, nr::PIPE, [fds.as_mut_ptr() as usize, 0, 0, 0, 0, 0]),
        0
    );

    // Nothing to read yet: poll with a zero timeout reports no events.
    let mut pfd = [PollFd {
        fd: fds[0],
        events: PollEvents::IN.bits(),
        revents: 0,
    }];
    let n = sys(&k, nr::POLL, [pfd.as_mut_ptr() as usize, 1, 0, 0, 0, 0]);
    assert_eq!(n, 0);

    // After a write the read end turns ready.
    sys(&k, nr::WRITE, [fds[1] as usize, b"!".as_ptr() as usize, 1, 0, 0, 0]);
    let n = sys(&k, nr::POLL, [pfd.as_mut_ptr() as usize, 1, 0, 0, 0, 0]);
    assert_eq!(n, 1);
    assert!(PollEvents::from_bits_truncate(pfd[0].revents).contains(PollEvents::IN));

    // select() over the same descriptor agrees.
    #[repr(C)]
    struct OldTimeval {
        tv_sec: i32,
        tv_usec: i32,
    }
    let tv = OldTimeval { tv_sec: 0, tv_usec: 0 };
    let mut readset = [0u32; 8];
    readset[(fds[0] as usize) / 32] |= 1 << (fds[0] as usize % 32);
    let n = sys(
        &k,
        nr::SELECT,
        [
            (fds[0] + 1) as usize,
            readset.as_mut_ptr() as usize,
            0,
            0,
            &tv as *const OldTimeval as usize,
            0,
        ],
    );
    assert_eq!(n, 1);
    assert_ne!(readset[(fds[0] as usize) / 32] & (1 << (fds[0] as usize % 32)), 0);
}

#[test]
fn tty_through_device_node() {
    use lepton_kernel::tty::TtyOps;
    use lepton_syscall::abi::MAJOR_TTY;

    let k = boot();
    k.chrdevs.register(MAJOR_TTY, Arc::new(TtyOps));

    // mknod /tty1 c 4:1, then open it like any file.
    let p = std::ffi::CString::new("/tty1").unwrap();
    let dev = lepton_syscall::abi::DevT::new(MAJOR_TTY, 1);
    assert_eq!(
        sys(
            &k,
            nr::MKNOD,
            [
                p.as_ptr() as usize,
                (lepton_syscall::flags::S_IFCHR | 0o620) as usize,
                dev.0 as usize,
                0,
                0,
                0
            ]
        ),
        0
    );
    let fd = open(&k, "/tty1", OpenFlags::RDWR, 0);
    assert!(fd >= 0, "open failed: {fd}");

    // A line typed on the terminal comes back from read(2).
    let tty = k.ttys.get(0).unwrap();
    tty.receive_input(&k, b"hello\n");
    let mut buf = [0u8; 16];
    let n = sys(
        &k,
        nr::READ,
        [fd as usize, buf.as_mut_ptr() as usize, buf.len(), 0, 0, 0],
    );
    assert_eq!(n, 6);
    assert_eq!(&buf[..6], b"hello\n");

    // Seeking a terminal is an ESPIPE affair.
    let rc = sys(&k, nr::LSEEK, [fd as usize, 0, SEEK_SET as usize, 0, 0, 0]);
    assert_eq!(rc, Errno::ESPIPE.to_neg());
}

#[test]
fn wait_nohang_and_echild() {
    let k = boot();
    assert_eq!(
        sys(&k, nr::WAIT4, [usize::MAX, 0, 0, 0, 0, 0]),
        Errno::ECHILD.to_neg()
    );

    let pid = sys(&k, nr::FORK, [0; 6]);
    assert!(pid > 0);
    let rc = sys(
        &k,
        nr::WAIT4,
        [usize::MAX, 0, WaitOptions::NOHANG.bits() as usize, 0, 0, 0],
    );
    assert_eq!(rc, 0, "live child with WNOHANG");
}
