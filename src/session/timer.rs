//! Cancellable timers
//!
//! The core never sleeps. It asks a [`Scheduler`] to deliver a [`TimerId`]
//! later and ignores any firing whose id is no longer the active one.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Dominant-speaker sampling
    AudioPoll,
    /// Re-check of the admission queue
    AdmissionRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Delivers timer firings back to the session
pub trait Scheduler: Send {
    fn schedule(&mut self, timer: TimerId, after: Duration);
    fn cancel(&mut self, timer: TimerId);
}

/// At most one pending timer per kind
pub struct TimerSet {
    scheduler: Box<dyn Scheduler>,
    active: HashMap<TimerKind, TimerId>,
    next_generation: u64,
}

impl TimerSet {
    pub fn new(scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            active: HashMap::new(),
            next_generation: 0,
        }
    }

    /// (Re)arm the timer of `kind`, replacing any pending one
    pub fn schedule(&mut self, kind: TimerKind, after: Duration) -> TimerId {
        self.cancel(kind);
        self.next_generation += 1;
        let timer = TimerId {
            kind,
            generation: self.next_generation,
        };
        self.active.insert(kind, timer);
        self.scheduler.schedule(timer, after);
        timer
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.active.remove(&kind) {
            self.scheduler.cancel(timer);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.active.drain() {
            self.scheduler.cancel(timer);
        }
    }

    pub fn is_active(&self, kind: TimerKind) -> bool {
        self.active.contains_key(&kind)
    }

    /// Consume a firing. Returns false for cancelled or superseded timers.
    pub fn accept(&mut self, fired: TimerId) -> bool {
        if self.active.get(&fired.kind) == Some(&fired) {
            self.active.remove(&fired.kind);
            true
        } else {
            false
        }
    }
}
