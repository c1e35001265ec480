//! Pipes.
//!
//! A pipe is one page of buffer driven as a ring: read and write
//! cursors advance modulo `PAGE_SIZE`, the ring is empty when they
//! coincide and full one byte earlier, so capacity is `PAGE_SIZE - 1`.
//! Readers sleep while it is empty, writers while it is full, and each
//! side wakes the other. Closing the last write end gives readers EOF;
//! writing with no readers raises `SIGPIPE` and fails with `EPIPE`.
//!
//! Named fifos share the machinery: the shared ring hangs off the fifo
//! inode and each open counts its ends by access mode.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use lepton_core::sync::SpinLock;
use lepton_syscall::flags::{OpenFlags, PollEvents, S_IFIFO};
use lepton_syscall::ioctl::FIONREAD;
use lepton_syscall::signal::SIGPIPE;
use lepton_syscall::{Errno, KResult};

use crate::config::PAGE_SIZE;
use crate::fs::{File, FileOps, Inode, InodeMeta, InodeOps, SelectTable};
use crate::kernel::Kernel;
use crate::sched::WaitQueue;

/// The byte ring. Cursors run modulo the page size.
struct PipeRing {
    data: Vec<u8>,
    rpos: usize,
    wpos: usize,
}

impl PipeRing {
    fn new() -> Self {
        Self {
            data: vec![0; PAGE_SIZE],
            rpos: 0,
            wpos: 0,
        }
    }

    fn len(&self) -> usize {
        (self.wpos.wrapping_sub(self.rpos)) & (PAGE_SIZE - 1)
    }

    fn is_empty(&self) -> bool {
        self.wpos == self.rpos
    }

    fn is_full(&self) -> bool {
        self.len() == PAGE_SIZE - 1
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len());
        for slot in buf[..n].iter_mut() {
            *slot = self.data[self.rpos];
            self.rpos = (self.rpos + 1) & (PAGE_SIZE - 1);
        }
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let room = PAGE_SIZE - 1 - self.len();
        let n = buf.len().min(room);
        for &b in &buf[..n] {
            self.data[self.wpos] = b;
            self.wpos = (self.wpos + 1) & (PAGE_SIZE - 1);
        }
        n
    }
}

/// State shared by every end of one pipe.
pub struct PipeInner {
    ring: SpinLock<PipeRing>,
    readers: AtomicUsize,
    writers: AtomicUsize,
    read_wq: Arc<WaitQueue>,
    write_wq: Arc<WaitQueue>,
}

impl PipeInner {
    fn new(readers: usize, writers: usize) -> Arc<Self> {
        Arc::new(Self {
            ring: SpinLock::new(PipeRing::new()),
            readers: AtomicUsize::new(readers),
            writers: AtomicUsize::new(writers),
            read_wq: Arc::new(WaitQueue::new()),
            write_wq: Arc::new(WaitQueue::new()),
        })
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.ring.lock().len()
    }
}

fn inner_of(file: &File) -> KResult<Arc<PipeInner>> {
    let private = file.inode.private.lock();
    private
        .as_ref()
        .and_then(|b| b.downcast_ref::<Arc<PipeInner>>())
        .cloned()
        .ok_or(Errno::EINVAL)
}

/// File operations shared by both pipe ends and fifos; the access mode
/// of the open file decides which side it drives.
pub struct PipeOps;

impl FileOps for PipeOps {
    fn open(&self, _k: &Kernel, file: &File) -> KResult<()> {
        // Fifo path: count the ends this open contributes.
        let inner = inner_of(file)?;
        if file.readable() {
            inner.readers.fetch_add(1, Ordering::AcqRel);
        }
        if file.writable() {
            inner.writers.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn release(&self, k: &Kernel, file: &File) {
        let Ok(inner) = inner_of(file) else {
            return;
        };
        if file.readable() {
            inner.readers.fetch_sub(1, Ordering::AcqRel);
            // Writers must notice EPIPE.
            inner.write_wq.wake_all(&k.sched);
        }
        if file.writable() {
            inner.writers.fetch_sub(1, Ordering::AcqRel);
            // Readers must notice EOF.
            inner.read_wq.wake_all(&k.sched);
        }
    }

    fn read(&self, k: &Kernel, file: &File, buf: &mut [u8], _pos: i64) -> KResult<usize> {
        let inner = inner_of(file)?;
        loop {
            {
                let mut ring = inner.ring.lock();
                if !ring.is_empty() {
                    let n = ring.read(buf);
                    drop(ring);
                    inner.write_wq.wake_one(&k.sched);
                    return Ok(n);
                }
            }
            if inner.writers.load(Ordering::Acquire) == 0 {
                return Ok(0); // EOF
            }
            if file.flags().contains(OpenFlags::NONBLOCK) {
                return Err(Errno::EAGAIN);
            }
            k.sched.sleep_on(&inner.read_wq, true)?;
        }
    }

    fn write(&self, k: &Kernel, file: &File, buf: &[u8], _pos: i64) -> KResult<usize> {
        let inner = inner_of(file)?;
        let mut written = 0;
        while written < buf.len() {
            if inner.readers.load(Ordering::Acquire) == 0 {
                k.sched.current().signals.lock().raise(SIGPIPE);
                return Err(Errno::EPIPE);
            }
            let n = inner.ring.lock().write(&buf[written..]);
            if n > 0 {
                written += n;
                inner.read_wq.wake_one(&k.sched);
                continue;
            }
            // Ring full.
            if file.flags().contains(OpenFlags::NONBLOCK) {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(Errno::EAGAIN)
                };
            }
            match k.sched.sleep_on(&inner.write_wq, true) {
                Ok(()) => {}
                Err(e) => {
                    return if written > 0 { Ok(written) } else { Err(e) };
                }
            }
        }
        Ok(written)
    }

    fn lseek(&self, _k: &Kernel, _file: &File, _new_pos: i64) -> KResult<i64> {
        Err(Errno::ESPIPE)
    }

    fn ioctl(&self, _k: &Kernel, file: &File, cmd: u32, _arg: usize) -> KResult<usize> {
        match cmd {
            FIONREAD => Ok(inner_of(file)?.buffered()),
            _ => Err(Errno::ENOTTY),
        }
    }

    fn poll(&self, _k: &Kernel, file: &File, table: Option<&mut SelectTable>) -> PollEvents {
        let Ok(inner) = inner_of(file) else {
            return PollEvents::NVAL;
        };
        if let Some(table) = table {
            table.register(&inner.read_wq);
            table.register(&inner.write_wq);
        }
        let mut events = PollEvents::empty();
        let ring = inner.ring.lock();
        if !ring.is_empty() {
            events |= PollEvents::IN;
        }
        if !ring.is_full() {
            events |= PollEvents::OUT;
        }
        drop(ring);
        if inner.writers.load(Ordering::Acquire) == 0 {
            events |= PollEvents::HUP | PollEvents::IN;
        }
        if inner.readers.load(Ordering::Acquire) == 0 {
            events |= PollEvents::ERR;
        }
        events
    }
}

/// Inode ops for pipe inodes: nothing name-shaped applies.
struct PipeIops;
impl InodeOps for PipeIops {}

/// Creates an anonymous pipe, returning `(read_end, write_end)`.
pub fn pipe(extra_flags: OpenFlags) -> (Arc<File>, Arc<File>) {
    let inode = Inode::anonymous(
        InodeMeta::new(S_IFIFO | 0o600),
        Arc::new(PipeIops),
        Arc::new(PipeOps),
    );
    *inode.private.lock() = Some(Box::new(PipeInner::new(1, 1)));

    let read_end = File::with_ops(inode.clone(), Arc::new(PipeOps), extra_flags);
    let write_end = File::with_ops(
        inode,
        Arc::new(PipeOps),
        OpenFlags::WRONLY | extra_flags,
    );
    (read_end, write_end)
}

/// Wraps a fifo inode in a pipe-driven file. The shared ring is created
/// on first open; end counting happens in the open hook.
pub fn fifo_file(inode: Arc<Inode>, flags: OpenFlags) -> Arc<File> {
    {
        let mut private = inode.private.lock();
        if private
            .as_ref()
            .and_then(|b| b.downcast_ref::<Arc<PipeInner>>())
            .is_none()
        {
            *private = Some(Box::new(PipeInner::new(0, 0)));
        }
    }
    File::with_ops(inode, Arc::new(PipeOps), flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn kernel() -> Kernel {
        let k = Kernel::new_for_tests();
        let t = Task::new(k.sched.alloc_pid(), "pipe-test");
        k.sched.register(t.clone());
        k.sched.set_current(t);
        k
    }

    #[test]
    fn ring_arithmetic() {
        let mut ring = PipeRing::new();
        assert!(ring.is_empty());
        assert!(!ring.is_full());

        let data = vec![0xA5u8; PAGE_SIZE];
        let n = ring.write(&data);
        assert_eq!(n, PAGE_SIZE - 1, "capacity is one short of a page");
        assert!(ring.is_full());

        let mut out = vec![0u8; PAGE_SIZE];
        let n = ring.read(&mut out);
        assert_eq!(n, PAGE_SIZE - 1);
        assert!(ring.is_empty());
    }

    #[test]
    fn ring_wraps_cursors() {
        let mut ring = PipeRing::new();
        let mut out = [0u8; 3000];
        // Cycle more than a page of traffic through the ring.
        for round in 0..4u8 {
            let chunk = [round; 3000];
            assert_eq!(ring.write(&chunk), 3000);
            assert_eq!(ring.read(&mut out), 3000);
            assert_eq!(out[0], round);
            assert_eq!(out[2999], round);
        }
    }

    #[test]
    fn write_then_read() {
        let k = kernel();
        let (r, w) = pipe(OpenFlags::empty());
        let n = w.fops.write(&k, &w, b"x", 0).unwrap();
        assert_eq!(n, 1);
        let mut buf = [0u8; 4];
        let n = r.fops.read(&k, &r, &mut buf, 0).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], b'x');
    }

    #[test]
    fn nonblocking_read_empty_is_eagain() {
        let k = kernel();
        let (r, _w) = pipe(OpenFlags::NONBLOCK);
        let mut buf = [0u8; 1];
        assert_eq!(r.fops.read(&k, &r, &mut buf, 0).unwrap_err(), Errno::EAGAIN);
    }

    #[test]
    fn closed_writer_means_eof() {
        let k = kernel();
        let (r, w) = pipe(OpenFlags::empty());
        w.fops.write(&k, &w, b"ab", 0).unwrap();
        w.fops.release(&k, &w);

        let mut buf = [0u8; 8];
        assert_eq!(r.fops.read(&k, &r, &mut buf, 0).unwrap(), 2);
        assert_eq!(r.fops.read(&k, &r, &mut buf, 0).unwrap(), 0, "EOF");
    }

    #[test]
    fn closed_reader_gives_epipe_and_sigpipe() {
        let k = kernel();
        let (r, w) = pipe(OpenFlags::empty());
        r.fops.release(&k, &r);

        assert_eq!(w.fops.write(&k, &w, b"x", 0).unwrap_err(), Errno::EPIPE);
        assert!(k.sched.current().signals.lock().is_pending(SIGPIPE));
    }

    #[test]
    fn nonblocking_write_returns_what_fits() {
        let k = kernel();
        let (_r, w) = pipe(OpenFlags::NONBLOCK);
        let page = vec![1u8; PAGE_SIZE];
        let n = w.fops.write(&k, &w, &page, 0).unwrap();
        assert_eq!(n, PAGE_SIZE - 1);
        // Nothing fits any more.
        assert_eq!(w.fops.write(&k, &w, b"y", 0).unwrap_err(), Errno::EAGAIN);
    }

    #[test]
    fn fionread_reports_buffered_bytes() {
        let k = kernel();
        let (r, w) = pipe(OpenFlags::empty());
        w.fops.write(&k, &w, b"hello", 0).unwrap();
        assert_eq!(r.fops.ioctl(&k, &r, FIONREAD, 0).unwrap(), 5);
    }

    #[test]
    fn lseek_is_espipe() {
        let k = kernel();
        let (r, _w) = pipe(OpenFlags::empty());
        assert_eq!(r.fops.lseek(&k, &r, 0).unwrap_err(), Errno::ESPIPE);
    }

    #[test]
    fn poll_tracks_both_directions() {
        let k = kernel();
        let (r, w) = pipe(OpenFlags::empty());
        assert!(!r.fops.poll(&k, &r, None).contains(PollEvents::IN));
        assert!(w.fops.poll(&k, &w, None).contains(PollEvents::OUT));

        w.fops.write(&k, &w, b"z", 0).unwrap();
        assert!(r.fops.poll(&k, &r, None).contains(PollEvents::IN));

        w.fops.release(&k, &w);
        let ev = r.fops.poll(&k, &r, None);
        assert!(ev.contains(PollEvents::HUP));
    }
}
