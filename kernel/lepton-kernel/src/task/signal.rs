//! Per-task signal state and delivery decisions.
//!
//! A task carries a 32-bit pending mask, a 32-bit blocked mask and one
//! action slot per signal. Senders only set pending bits; everything
//! else happens in the context of the receiving task when it crosses
//! the kernel/user boundary and asks [`SignalState::take_deliverable`]
//! what to do next.

use lepton_syscall::signal::{
    sigmask, SigactionAbi, NSIG, SA_NODEFER, SA_RESETHAND, SIGCHLD, SIGCONT, SIGKILL, SIGSTOP,
    SIGTSTP, SIGTTIN, SIGTTOU, SIGWINCH, SIG_DFL, SIG_IGN,
};

use crate::arch::TaskContext;

/// What the boundary code should do for a popped signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Drop the signal.
    Ignore,
    /// Kill the task.
    Terminate,
    /// Kill the task and dump core.
    Core,
    /// Move the task to the stopped state.
    Stop,
    /// Resume a stopped task.
    Continue,
    /// Run a userspace handler.
    Handler(SigactionAbi),
}

/// Register state saved while a handler runs, restored by `sigreturn`.
#[derive(Debug, Clone, Copy)]
pub struct SignalFrame {
    /// The interrupted context, restored bit-identically.
    pub context: TaskContext,
    /// Blocked mask in force before delivery.
    pub blocked: u32,
}

/// A task's signal bookkeeping.
pub struct SignalState {
    pending: u32,
    blocked: u32,
    actions: [SigactionAbi; NSIG],
    /// Saved frame while a handler is executing.
    frame: Option<SignalFrame>,
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalState {
    /// Fresh state: nothing pending, nothing blocked, all defaults.
    pub const fn new() -> Self {
        Self {
            pending: 0,
            blocked: 0,
            actions: [SigactionAbi::default_action(); NSIG],
            frame: None,
        }
    }

    /// Marks `sig` pending. Returns `false` for out-of-range numbers.
    pub fn raise(&mut self, sig: u32) -> bool {
        match sigmask(sig) {
            Some(bit) => {
                self.pending |= bit;
                true
            }
            None => false,
        }
    }

    /// True if an unblocked signal is pending.
    pub fn pending_deliverable(&self) -> bool {
        self.deliverable_mask() != 0
    }

    /// True if `sig` is currently pending (blocked or not).
    pub fn is_pending(&self, sig: u32) -> bool {
        sigmask(sig).is_some_and(|bit| self.pending & bit != 0)
    }

    fn deliverable_mask(&self) -> u32 {
        // SIGKILL and SIGSTOP punch through the blocked mask.
        let unstoppable = sigmask(SIGKILL).unwrap() | sigmask(SIGSTOP).unwrap();
        self.pending & (!self.blocked | unstoppable)
    }

    /// Pops the lowest-numbered deliverable signal and resolves its
    /// disposition. For handlers, the action's mask (plus the signal
    /// itself, unless `SA_NODEFER`) is folded into the blocked mask and
    /// `SA_RESETHAND` reverts the slot to default.
    pub fn take_deliverable(&mut self) -> Option<(u32, Disposition)> {
        let mask = self.deliverable_mask();
        if mask == 0 {
            return None;
        }
        let sig = mask.trailing_zeros() + 1;
        let bit = sigmask(sig).expect("mask bit implies valid signal");
        self.pending &= !bit;

        let action = self.actions[sig as usize];
        let disposition = match action.sa_handler {
            SIG_DFL => default_disposition(sig),
            SIG_IGN => Disposition::Ignore,
            _ if sig == SIGKILL || sig == SIGSTOP => default_disposition(sig),
            _ => {
                if action.sa_flags & SA_RESETHAND != 0 {
                    self.actions[sig as usize] = SigactionAbi::default_action();
                }
                self.blocked |= action.sa_mask;
                if action.sa_flags & SA_NODEFER == 0 {
                    self.blocked |= bit;
                }
                Disposition::Handler(action)
            }
        };
        Some((sig, disposition))
    }

    /// Looks at the next deliverable signal and its installed action
    /// without consuming anything (syscall-restart decisions).
    pub fn peek_deliverable(&self) -> Option<(u32, SigactionAbi)> {
        let mask = self.deliverable_mask();
        if mask == 0 {
            return None;
        }
        let sig = mask.trailing_zeros() + 1;
        Some((sig, self.actions[sig as usize]))
    }

    /// Installs an action, returning the old one. `SIGKILL`/`SIGSTOP`
    /// cannot be caught, blocked or ignored.
    pub fn set_action(&mut self, sig: u32, action: SigactionAbi) -> Option<SigactionAbi> {
        if sig as usize >= NSIG || sig == 0 || sig == SIGKILL || sig == SIGSTOP {
            return None;
        }
        let old = self.actions[sig as usize];
        self.actions[sig as usize] = action;
        old.into()
    }

    /// Reads an action slot.
    pub fn action(&self, sig: u32) -> Option<SigactionAbi> {
        if sig == 0 || sig as usize >= NSIG {
            None
        } else {
            Some(self.actions[sig as usize])
        }
    }

    /// Reset for `execve`: caught handlers revert to default, ignored
    /// dispositions survive, masks are kept.
    pub fn reset_for_exec(&mut self) {
        for slot in self.actions.iter_mut() {
            if slot.sa_handler != SIG_IGN {
                *slot = SigactionAbi::default_action();
            }
        }
        self.frame = None;
    }

    /// The blocked mask.
    pub fn blocked(&self) -> u32 {
        self.blocked
    }

    /// Replaces the blocked mask; `SIGKILL`/`SIGSTOP` bits are stripped.
    pub fn set_blocked(&mut self, mask: u32) {
        let unstoppable = sigmask(SIGKILL).unwrap() | sigmask(SIGSTOP).unwrap();
        self.blocked = mask & !unstoppable;
    }

    /// Saves the interrupted context for handler delivery.
    pub fn push_frame(&mut self, context: TaskContext) {
        self.frame = Some(SignalFrame {
            context,
            blocked: self.blocked,
        });
    }

    /// `sigreturn`: restores the saved context and blocked mask.
    pub fn pop_frame(&mut self) -> Option<TaskContext> {
        let frame = self.frame.take()?;
        self.blocked = frame.blocked;
        Some(frame.context)
    }
}

/// The default action for each signal.
fn default_disposition(sig: u32) -> Disposition {
    match sig {
        SIGCHLD | SIGWINCH => Disposition::Ignore,
        SIGCONT => Disposition::Continue,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => Disposition::Stop,
        lepton_syscall::signal::SIGQUIT
        | lepton_syscall::signal::SIGILL
        | lepton_syscall::signal::SIGTRAP
        | lepton_syscall::signal::SIGABRT
        | lepton_syscall::signal::SIGBUS
        | lepton_syscall::signal::SIGFPE
        | lepton_syscall::signal::SIGSEGV
        | lepton_syscall::signal::SIGSYS => Disposition::Core,
        _ => Disposition::Terminate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lepton_syscall::signal::{SIGINT, SIGUSR1, SA_RESTART};

    fn handler(addr: usize) -> SigactionAbi {
        SigactionAbi {
            sa_handler: addr,
            sa_flags: SA_RESTART,
            sa_restorer: 0,
            sa_mask: 0,
        }
    }

    #[test]
    fn raise_and_deliver_default() {
        let mut s = SignalState::new();
        assert!(s.raise(SIGINT));
        let (sig, disp) = s.take_deliverable().unwrap();
        assert_eq!(sig, SIGINT);
        assert_eq!(disp, Disposition::Terminate);
        assert!(s.take_deliverable().is_none(), "bit was consumed");
    }

    #[test]
    fn blocked_signal_stays_pending() {
        let mut s = SignalState::new();
        s.set_blocked(sigmask(SIGUSR1).unwrap());
        s.raise(SIGUSR1);
        assert!(!s.pending_deliverable());
        assert!(s.is_pending(SIGUSR1));

        s.set_blocked(0);
        assert!(s.pending_deliverable());
        let (sig, _) = s.take_deliverable().unwrap();
        assert_eq!(sig, SIGUSR1);
    }

    #[test]
    fn sigkill_cannot_be_blocked_or_caught() {
        let mut s = SignalState::new();
        s.set_blocked(u32::MAX);
        assert!(s.set_action(SIGKILL, handler(0x1000)).is_none());
        s.raise(SIGKILL);
        let (sig, disp) = s.take_deliverable().unwrap();
        assert_eq!(sig, SIGKILL);
        assert_eq!(disp, Disposition::Terminate);
    }

    #[test]
    fn handler_blocks_own_signal_until_sigreturn() {
        let mut s = SignalState::new();
        s.set_action(SIGUSR1, handler(0x2000));
        s.raise(SIGUSR1);

        let (_, disp) = s.take_deliverable().unwrap();
        assert!(matches!(disp, Disposition::Handler(a) if a.sa_handler == 0x2000));

        // The signal is now blocked; a second instance stays queued.
        s.raise(SIGUSR1);
        assert!(!s.pending_deliverable());

        s.push_frame(TaskContext::default());
        let restored = s.pop_frame();
        assert!(restored.is_some());
        assert!(s.pending_deliverable(), "mask restored by sigreturn");
    }

    #[test]
    fn exec_reset_keeps_ignored() {
        let mut s = SignalState::new();
        s.set_action(SIGUSR1, handler(0x3000));
        s.set_action(
            SIGINT,
            SigactionAbi {
                sa_handler: SIG_IGN,
                sa_flags: 0,
                sa_restorer: 0,
                sa_mask: 0,
            },
        );
        s.reset_for_exec();
        assert_eq!(s.action(SIGUSR1).unwrap().sa_handler, SIG_DFL);
        assert_eq!(s.action(SIGINT).unwrap().sa_handler, SIG_IGN);
    }

    #[test]
    fn stop_and_continue_dispositions() {
        let mut s = SignalState::new();
        s.raise(SIGTSTP);
        assert_eq!(s.take_deliverable().unwrap().1, Disposition::Stop);
        s.raise(SIGCONT);
        assert_eq!(s.take_deliverable().unwrap().1, Disposition::Continue);
    }

    #[test]
    fn sigreturn_restores_context_bits() {
        let mut s = SignalState::new();
        let ctx = TaskContext {
            edi: 1,
            esi: 2,
            ebx: 3,
            ebp: 4,
            esp: 5,
            eip: 6,
        };
        s.push_frame(ctx);
        let restored = s.pop_frame().unwrap();
        assert_eq!(restored.eip, 6);
        assert_eq!(restored.esp, 5);
        assert_eq!(restored.edi, 1);
    }
}
