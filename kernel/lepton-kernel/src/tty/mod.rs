//! TTY core.
//!
//! Each [`Tty`] couples a line discipline with termios settings, a
//! window size, a foreground process group and wait queues for blocked
//! readers. Hardware input drivers feed bytes in through a fixed-size
//! staging ring ([`Tty::receive_input`]); output goes to a registered
//! sink (the console driver). Userspace reaches a tty through
//! [`TtyOps`], registered in the character-device table under the tty
//! and console majors.

pub mod ldisc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use heapless::Deque;

use lepton_core::sync::{IrqLock, SpinLock};
use lepton_syscall::abi::{Termios, Winsize, ECHO, ONLCR, OPOST};
use lepton_syscall::flags::{OpenFlags, PollEvents};
use lepton_syscall::ioctl::{
    FIONREAD, KDGETMODE, KDGKBENT, KDGKBMODE, KDSETMODE, KDSKBENT, KDSKBMODE, K_XLATE, KD_TEXT,
    TCGETS, TCSETS, TCSETSF, TCSETSW, TIOCGPGRP, TIOCGWINSZ, TIOCSPGRP, TIOCSWINSZ,
};
use lepton_syscall::{Errno, KResult};

use crate::fs::{File, FileOps, SelectTable};
use crate::kernel::Kernel;
use crate::sched::WaitQueue;
use crate::syscall::uaccess;

use ldisc::{LdiscAction, LineDiscipline};

/// Number of virtual terminals.
pub const NR_TTYS: usize = 4;

/// Staging ring between the input IRQ and the line discipline.
const INPUT_BUF_SIZE: usize = 256;

/// Keyboard translation tables: plain, shift, ctrl, alt.
const NR_KEYMAPS: usize = 4;
/// Entries per translation table.
const NR_KEYS: usize = 128;

/// Output sink signature (console/serial driver).
pub type OutputFn = fn(&[u8]);

/// One terminal.
pub struct Tty {
    /// Minor number (0-based VT index).
    pub index: usize,
    termios: SpinLock<Termios>,
    winsize: SpinLock<Winsize>,
    fg_pgrp: AtomicU32,
    session: AtomicU32,
    /// Raw bytes from the interrupt handler, drained under the ldisc.
    input_ring: IrqLock<Deque<u8, INPUT_BUF_SIZE>>,
    ldisc: SpinLock<LineDiscipline>,
    read_wq: Arc<WaitQueue>,
    output: SpinLock<Option<OutputFn>>,
    /// `KDSKBMODE` state (raw scancodes vs translation).
    kbd_mode: AtomicU32,
    /// `KDSETMODE` state (text vs graphics).
    vt_mode: AtomicU32,
    keymap: SpinLock<[[u16; NR_KEYS]; NR_KEYMAPS]>,
}

impl Tty {
    /// A terminal with cooked defaults and no output sink.
    pub fn new(index: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            termios: SpinLock::new(Termios::default()),
            winsize: SpinLock::new(Winsize::default()),
            fg_pgrp: AtomicU32::new(0),
            session: AtomicU32::new(0),
            input_ring: IrqLock::new(Deque::new()),
            ldisc: SpinLock::new(LineDiscipline::new()),
            read_wq: Arc::new(WaitQueue::new()),
            output: SpinLock::new(None),
            kbd_mode: AtomicU32::new(K_XLATE),
            vt_mode: AtomicU32::new(KD_TEXT),
            keymap: SpinLock::new([[0; NR_KEYS]; NR_KEYMAPS]),
        })
    }

    /// Registers the output sink.
    pub fn set_output(&self, f: OutputFn) {
        *self.output.lock() = Some(f);
    }

    /// Foreground process group.
    pub fn fg_pgrp(&self) -> u32 {
        self.fg_pgrp.load(Ordering::Acquire)
    }

    /// Sets the foreground process group.
    pub fn set_fg_pgrp(&self, pgrp: u32) {
        self.fg_pgrp.store(pgrp, Ordering::Release);
    }

    /// Session owning the terminal.
    pub fn session(&self) -> u32 {
        self.session.load(Ordering::Acquire)
    }

    /// Accepts bytes from the input driver.
    ///
    /// Stages them in the IRQ-side ring, then drains the ring through
    /// the line discipline, performing echo, delivering `ISIG` signals
    /// to the foreground group and waking blocked readers.
    pub fn receive_input(&self, k: &Kernel, bytes: &[u8]) {
        {
            let mut ring = self.input_ring.lock();
            for &b in bytes {
                let _ = ring.push_back(b);
            }
        }

        let termios = *self.termios.lock();
        let mut wake = false;
        loop {
            let b = self.input_ring.lock().pop_front();
            let Some(b) = b else { break };
            let actions = self.ldisc.lock().input(b, &termios);
            for action in actions {
                match action {
                    LdiscAction::Echo(c) => {
                        if termios.c_lflag & ECHO != 0 {
                            self.output_bytes(&[c], &termios);
                        }
                    }
                    LdiscAction::EchoErase => {
                        if termios.c_lflag & ECHO != 0 {
                            self.output_bytes(b"\x08 \x08", &termios);
                        }
                    }
                    LdiscAction::EchoKill => {
                        if termios.c_lflag & ECHO != 0 {
                            self.output_bytes(b"\r\x1b[K", &termios);
                        }
                    }
                    LdiscAction::Signal(sig) => {
                        let pgrp = self.fg_pgrp();
                        if pgrp != 0 {
                            let _ = k.kill_pgrp(pgrp, sig);
                        }
                    }
                    LdiscAction::DataReady => wake = true,
                }
            }
        }
        if wake {
            self.read_wq.wake_all(&k.sched);
        }
    }

    /// Writes through the output sink, applying `OPOST`/`ONLCR`.
    fn output_bytes(&self, bytes: &[u8], termios: &Termios) {
        let Some(sink) = *self.output.lock() else {
            return;
        };
        if termios.c_oflag & OPOST != 0 && termios.c_oflag & ONLCR != 0 {
            for &b in bytes {
                if b == b'\n' {
                    sink(b"\r\n");
                } else {
                    sink(core::slice::from_ref(&b));
                }
            }
        } else {
            sink(bytes);
        }
    }

    fn read(&self, k: &Kernel, file: &File, buf: &mut [u8]) -> KResult<usize> {
        loop {
            if let Some(n) = self.ldisc.lock().try_read(buf) {
                return Ok(n);
            }
            if file.flags().contains(OpenFlags::NONBLOCK) {
                return Err(Errno::EAGAIN);
            }
            k.sched.sleep_on(&self.read_wq, true)?;
        }
    }

    fn write(&self, buf: &[u8]) -> usize {
        let termios = *self.termios.lock();
        self.output_bytes(buf, &termios);
        buf.len()
    }

    fn ioctl(&self, k: &Kernel, cmd: u32, arg: usize) -> KResult<usize> {
        match cmd {
            TCGETS => {
                let termios = *self.termios.lock();
                uaccess::write_user(arg, &termios)?;
                Ok(0)
            }
            TCSETS | TCSETSW | TCSETSF => {
                let termios: Termios = uaccess::read_user(arg)?;
                *self.termios.lock() = termios;
                Ok(0)
            }
            TIOCGPGRP => {
                uaccess::write_user(arg, &self.fg_pgrp())?;
                Ok(0)
            }
            TIOCSPGRP => {
                let pgrp: u32 = uaccess::read_user(arg)?;
                self.set_fg_pgrp(pgrp);
                Ok(0)
            }
            TIOCGWINSZ => {
                let ws = *self.winsize.lock();
                uaccess::write_user(arg, &ws)?;
                Ok(0)
            }
            TIOCSWINSZ => {
                let ws: Winsize = uaccess::read_user(arg)?;
                *self.winsize.lock() = ws;
                let pgrp = self.fg_pgrp();
                if pgrp != 0 {
                    let _ = k.kill_pgrp(pgrp, lepton_syscall::signal::SIGWINCH);
                }
                Ok(0)
            }
            FIONREAD => {
                let n = self.ldisc.lock().available();
                uaccess::write_user(arg, &(n as u32))?;
                Ok(0)
            }
            KDGKBMODE => {
                uaccess::write_user(arg, &self.kbd_mode.load(Ordering::Acquire))?;
                Ok(0)
            }
            KDSKBMODE => {
                self.kbd_mode.store(arg as u32, Ordering::Release);
                Ok(0)
            }
            KDGETMODE => {
                uaccess::write_user(arg, &self.vt_mode.load(Ordering::Acquire))?;
                Ok(0)
            }
            KDSETMODE => {
                self.vt_mode.store(arg as u32, Ordering::Release);
                Ok(0)
            }
            KDGKBENT => {
                let mut entry: Kbentry = uaccess::read_user(arg)?;
                let (table, index) = (entry.kb_table as usize, entry.kb_index as usize);
                if table >= NR_KEYMAPS || index >= NR_KEYS {
                    return Err(Errno::EINVAL);
                }
                entry.kb_value = self.keymap.lock()[table][index];
                uaccess::write_user(arg, &entry)?;
                Ok(0)
            }
            KDSKBENT => {
                let entry: Kbentry = uaccess::read_user(arg)?;
                let (table, index) = (entry.kb_table as usize, entry.kb_index as usize);
                if table >= NR_KEYMAPS || index >= NR_KEYS {
                    return Err(Errno::EINVAL);
                }
                self.keymap.lock()[table][index] = entry.kb_value;
                Ok(0)
            }
            _ => Err(Errno::ENOTTY),
        }
    }
}

/// `KDGKBENT`/`KDSKBENT` argument.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Kbentry {
    pub kb_table: u8,
    pub kb_index: u8,
    pub kb_value: u16,
}

/// The kernel's terminal set.
pub struct TtySet {
    ttys: Vec<Arc<Tty>>,
}

impl Default for TtySet {
    fn default() -> Self {
        Self::new()
    }
}

impl TtySet {
    pub fn new() -> Self {
        Self {
            ttys: (0..NR_TTYS).map(Tty::new).collect(),
        }
    }

    /// Terminal by VT index.
    pub fn get(&self, index: usize) -> KResult<Arc<Tty>> {
        self.ttys.get(index).cloned().ok_or(Errno::ENODEV)
    }
}

/// Character-device operations for the tty and console majors.
pub struct TtyOps;

impl TtyOps {
    fn tty_of(k: &Kernel, file: &File) -> KResult<Arc<Tty>> {
        let rdev = file.inode.meta.lock().rdev;
        // Console minors alias VT 0; tty minors are 1-based.
        let index = match rdev.major() {
            lepton_syscall::abi::MAJOR_CONSOLE => 0,
            _ => (rdev.minor() as usize).saturating_sub(1),
        };
        k.ttys.get(index)
    }
}

impl FileOps for TtyOps {
    fn open(&self, k: &Kernel, file: &File) -> KResult<()> {
        let tty = Self::tty_of(k, file)?;
        // First opener's job control group becomes the foreground.
        if !file.flags().contains(OpenFlags::NOCTTY) && tty.fg_pgrp() == 0 {
            let task = k.sched.current();
            tty.fg_pgrp.store(task.pgrp(), Ordering::Release);
            tty.session.store(task.session(), Ordering::Release);
        }
        Ok(())
    }

    fn read(&self, k: &Kernel, file: &File, buf: &mut [u8], _pos: i64) -> KResult<usize> {
        Self::tty_of(k, file)?.read(k, file, buf)
    }

    fn write(&self, k: &Kernel, file: &File, buf: &[u8], _pos: i64) -> KResult<usize> {
        Ok(Self::tty_of(k, file)?.write(buf))
    }

    fn lseek(&self, _k: &Kernel, _file: &File, _new_pos: i64) -> KResult<i64> {
        Err(Errno::ESPIPE)
    }

    fn ioctl(&self, k: &Kernel, file: &File, cmd: u32, arg: usize) -> KResult<usize> {
        Self::tty_of(k, file)?.ioctl(k, cmd, arg)
    }

    fn poll(&self, k: &Kernel, file: &File, table: Option<&mut SelectTable>) -> PollEvents {
        let Ok(tty) = Self::tty_of(k, file) else {
            return PollEvents::NVAL;
        };
        if let Some(table) = table {
            table.register(&tty.read_wq);
        }
        let mut events = PollEvents::OUT;
        if tty.ldisc.lock().readable() {
            events |= PollEvents::IN;
        }
        events
    }
}
