//! Error definitions.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by the scheduler and its timing facility.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The timing facility has been shut down and accepts no more work.
    #[error("Timing facility is shut down")]
    Shutdown,

    /// Outstanding work did not finish within the await budget.
    #[error("Task can't exceed {}ms. Remaining tasks are {remaining}.", .budget.as_millis())]
    Timeout {
        /// Number of tasks still outstanding when the budget ran out.
        remaining: usize,
        /// The budget that was exceeded.
        budget: Duration,
    },

    /// A periodic task was given a zero period.
    #[error("Periodic tasks need a non-zero period")]
    ZeroPeriod,

    /// The task was cancelled or panicked before producing its value.
    #[error("Task was cancelled or panicked before producing a value")]
    Abandoned,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
