//! Terminal line discipline.
//!
//! Consumes input bytes one at a time under the tty's termios settings
//! and produces [`LdiscAction`]s for the owning tty to interpret (echo,
//! signal delivery, reader wake-up). In canonical mode bytes gather in
//! an edit buffer until a line terminator commits them to the ready
//! queue; raw mode passes everything straight through.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use lepton_syscall::abi::{
    Termios, ICANON, ICRNL, ISIG, VEOF, VERASE, VINTR, VKILL, VQUIT, VSUSP,
};
use lepton_syscall::signal::{SIGINT, SIGQUIT, SIGTSTP};

/// Longest editable line in canonical mode.
const LINE_BUF_SIZE: usize = 256;

/// What the tty should do about one processed byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdiscAction {
    /// Echo this byte.
    Echo(u8),
    /// Erase one character from the display.
    EchoErase,
    /// Erase the whole displayed line.
    EchoKill,
    /// Deliver this signal to the foreground process group.
    Signal(u32),
    /// Data became available for readers.
    DataReady,
}

/// Line discipline state.
pub struct LineDiscipline {
    /// Committed bytes awaiting `read`.
    ready: VecDeque<u8>,
    /// Line under edit (canonical mode only).
    line: Vec<u8>,
    /// A VEOF arrived on an empty line: next read returns 0.
    eof_pending: bool,
}

impl Default for LineDiscipline {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDiscipline {
    pub const fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            line: Vec::new(),
            eof_pending: false,
        }
    }

    /// Feeds one input byte through the discipline.
    ///
    /// Returns the actions the tty must carry out, in order.
    pub fn input(&mut self, mut b: u8, termios: &Termios) -> Vec<LdiscAction> {
        let mut actions = Vec::new();
        let lflag = termios.c_lflag;
        let cc = &termios.c_cc;

        if termios.c_iflag & ICRNL != 0 && b == b'\r' {
            b = b'\n';
        }

        if lflag & ISIG != 0 {
            let sig = if b == cc[VINTR] {
                Some(SIGINT)
            } else if b == cc[VQUIT] {
                Some(SIGQUIT)
            } else if b == cc[VSUSP] {
                Some(SIGTSTP)
            } else {
                None
            };
            if let Some(sig) = sig {
                self.line.clear();
                actions.push(LdiscAction::Signal(sig));
                return actions;
            }
        }

        if lflag & ICANON == 0 {
            // Raw: straight to the ready queue.
            self.ready.push_back(b);
            actions.push(LdiscAction::DataReady);
            return actions;
        }

        if b == cc[VERASE] {
            if self.line.pop().is_some() {
                actions.push(LdiscAction::EchoErase);
            }
        } else if b == cc[VKILL] {
            if !self.line.is_empty() {
                self.line.clear();
                actions.push(LdiscAction::EchoKill);
            }
        } else if b == cc[VEOF] {
            if self.line.is_empty() {
                self.eof_pending = true;
            } else {
                // Flush the partial line without a terminator.
                self.ready.extend(self.line.drain(..));
            }
            actions.push(LdiscAction::DataReady);
        } else if b == b'\n' {
            self.ready.extend(self.line.drain(..));
            self.ready.push_back(b'\n');
            actions.push(LdiscAction::Echo(b'\n'));
            actions.push(LdiscAction::DataReady);
        } else if self.line.len() < LINE_BUF_SIZE {
            self.line.push(b);
            actions.push(LdiscAction::Echo(b));
        }
        actions
    }

    /// Non-blocking read of committed data.
    ///
    /// `Some(0)` reports a pending EOF; `None` means nothing to read
    /// yet (the caller sleeps).
    pub fn try_read(&mut self, buf: &mut [u8]) -> Option<usize> {
        if self.eof_pending && self.ready.is_empty() {
            self.eof_pending = false;
            return Some(0);
        }
        if self.ready.is_empty() {
            return None;
        }
        let mut n = 0;
        for slot in buf.iter_mut() {
            match self.ready.pop_front() {
                Some(b) => {
                    *slot = b;
                    n += 1;
                }
                None => break,
            }
        }
        Some(n)
    }

    /// Bytes a reader could fetch right now.
    pub fn available(&self) -> usize {
        self.ready.len()
    }

    /// True when a read would not block.
    pub fn readable(&self) -> bool {
        !self.ready.is_empty() || self.eof_pending
    }
}
