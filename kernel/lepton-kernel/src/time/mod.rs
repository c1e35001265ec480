//! Jiffies and the timer wheel.
//!
//! One expiry-ordered list of timer events. The periodic tick advances
//! the jiffy counter and fires every event whose expiry has passed.
//! Callbacks run outside the list lock, so a callback may add, modify
//! or delete timers (periodic timers re-add themselves).

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use lepton_core::sync::IrqLock;

use crate::config::HZ;
use crate::sched::Scheduler;

/// Handle for deleting or re-arming a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

/// Timer callback; receives the scheduler so it can wake tasks.
pub type TimerFn = Box<dyn FnMut(&Scheduler) + Send>;

struct TimerEvent {
    expires: u64,
    id: TimerId,
    callback: TimerFn,
}

/// The global timer list plus the jiffy counter.
pub struct TimerWheel {
    jiffies: AtomicU64,
    events: IrqLock<Vec<TimerEvent>>,
    next_id: AtomicU64,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub const fn new() -> Self {
        Self {
            jiffies: AtomicU64::new(0),
            events: IrqLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Ticks since boot.
    pub fn jiffies(&self) -> u64 {
        self.jiffies.load(Ordering::Acquire)
    }

    /// Converts milliseconds to jiffies, rounding up.
    pub fn msecs_to_jiffies(ms: u64) -> u64 {
        ms.div_ceil(1000 / HZ)
    }

    /// Arms a timer firing at absolute jiffy `expires`.
    pub fn add(&self, expires: u64, callback: TimerFn) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut events = self.events.lock();
        Self::insert_sorted(
            &mut events,
            TimerEvent {
                expires,
                id,
                callback,
            },
        );
        id
    }

    /// Disarms a timer. Returns `false` if it already fired or never
    /// existed.
    pub fn del(&self, id: TimerId) -> bool {
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|e| e.id != id);
        events.len() != before
    }

    /// Re-arms an existing timer to a new expiry, keeping its identity.
    pub fn modify(&self, id: TimerId, expires: u64) -> bool {
        let mut events = self.events.lock();
        let Some(idx) = events.iter().position(|e| e.id == id) else {
            return false;
        };
        let mut event = events.remove(idx);
        event.expires = expires;
        Self::insert_sorted(&mut events, event);
        true
    }

    /// Advances the jiffy counter and fires expired events.
    ///
    /// Called from the timer interrupt (or driven manually in tests).
    pub fn tick(&self, sched: &Scheduler) {
        let now = self.jiffies.fetch_add(1, Ordering::AcqRel) + 1;

        // Detach expired events first; callbacks run without the list
        // lock so they may arm new timers.
        let mut expired = Vec::new();
        {
            let mut events = self.events.lock();
            while events.first().is_some_and(|e| e.expires <= now) {
                expired.push(events.remove(0));
            }
        }
        for mut event in expired {
            (event.callback)(sched);
        }
    }

    /// Pending event count.
    pub fn pending(&self) -> usize {
        self.events.lock().len()
    }

    /// Earliest pending expiry.
    pub fn next_expiry(&self) -> Option<u64> {
        self.events.lock().first().map(|e| e.expires)
    }

    /// True when the list is expiry-sorted (it always must be).
    pub fn is_sorted(&self) -> bool {
        let events = self.events.lock();
        events.windows(2).all(|w| w[0].expires <= w[1].expires)
    }

    fn insert_sorted(events: &mut Vec<TimerEvent>, event: TimerEvent) {
        // Insert after every equal expiry so equal timers fire FIFO.
        let pos = events
            .iter()
            .position(|e| e.expires > event.expires)
            .unwrap_or(events.len());
        events.insert(pos, event);
    }
}
