//! Envelopes wrap the work handed to a [`Scheduler`](crate::Scheduler).
//!
//! An envelope owns the task body and records where the task is in its
//! lifecycle. The phase is only ever changed while the scheduler's state lock
//! is held, but can be read from anywhere through a [`TaskHandle`](crate::TaskHandle).

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use parking_lot::Mutex;

/// Identifies a task accepted by a scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle phase of a scheduled task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Accepted and waiting for the timer to fire it.
    Live,

    /// Fired while the scheduler was not draining; waits for `await_tasks`.
    Held,

    /// The body is executing right now.
    Running,

    /// The body has run. Terminal for one-shot tasks.
    Ran,

    /// Cancelled before its body ran, or dropped by a reset. Terminal.
    Cancelled,
}

impl Phase {
    /// Returns `true` for phases a task never leaves.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Phase::Ran | Phase::Cancelled)
    }

    const fn to_u8(self) -> u8 {
        match self {
            Phase::Live => 0,
            Phase::Held => 1,
            Phase::Running => 2,
            Phase::Ran => 3,
            Phase::Cancelled => 4,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Phase::Live,
            1 => Phase::Held,
            2 => Phase::Running,
            3 => Phase::Ran,
            _ => Phase::Cancelled,
        }
    }
}

pub(crate) enum Body {
    Once(Box<dyn FnOnce() + Send>),
    Repeat(Box<dyn FnMut() + Send>),
    Spent,
}

impl Body {
    fn run(&mut self) {
        if let Body::Repeat(task) = self {
            task();
            return;
        }
        if let Body::Once(task) = std::mem::replace(self, Body::Spent) {
            task();
        }
    }
}

pub(crate) struct Envelope {
    id: TaskId,
    periodic: bool,
    phase: AtomicU8,
    body: Mutex<Body>,
}

impl Envelope {
    pub(crate) fn new(id: TaskId, periodic: bool, body: Body) -> Self {
        Envelope {
            id,
            periodic,
            phase: AtomicU8::new(Phase::Live.to_u8()),
            body: Mutex::new(body),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn is_periodic(&self) -> bool {
        self.periodic
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.to_u8(), Ordering::Release);
    }

    /// Runs the body on the calling thread.
    pub(crate) fn run(&self) {
        self.body.lock().run();
    }

    /// Drops the body and whatever it captured.
    pub(crate) fn discard(&self) {
        let body = std::mem::replace(&mut *self.body.lock(), Body::Spent);
        drop(body);
    }
}
