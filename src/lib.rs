//! Deterministic completion barrier for scheduled work in unit tests.
//!
//! Tests of code that schedules background work should neither sleep for a
//! guessed amount of time nor hang forever when that work never completes.
//! `chronus` provides a [`Scheduler`] the code under test hands its work to,
//! and a single blocking call, [`Scheduler::await_tasks`], that the test makes
//! before asserting:
//!
//! - work that already fired is run on the spot, in the order it fired,
//! - the call returns once every accepted task has finished,
//! - and it panics if that does not happen within a bounded time.
//!
//! Features include:
//! - One-shot tasks with an optional delay, and value-producing tasks whose
//!   result is delivered through a [`Scheduled`] future
//! - Periodic tasks at a fixed rate or with a fixed delay
//! - Best-effort cancellation through a [`TaskHandle`]
//! - A pluggable [`TimingFacility`], with [`Timer`] as the default
//!   single-worker implementation

pub mod config;
pub mod envelope;
pub mod error;
pub mod periodic;
pub mod scheduler;
pub mod task;
pub mod timing;

pub use config::Config;
pub use envelope::{Phase, TaskId};
pub use error::{Error, Result};
pub use periodic::Cadence;
pub use scheduler::{Scheduler, TaskHandle};
pub use task::Scheduled;
pub use timing::{Fire, Timer, TimerKey, TimingFacility};
