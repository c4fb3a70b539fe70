//! Tunables for a [`Scheduler`](crate::Scheduler).

use std::time::Duration;

/// Default wall-clock budget for all outstanding work of one await cycle.
pub const DEFAULT_AWAIT_BUDGET: Duration = Duration::from_millis(200);

/// Default interval at which `await_tasks` re-checks the outstanding count.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default name of the timer worker thread.
pub const DEFAULT_THREAD_NAME: &str = "chronus-timer";

/// Scheduler configuration.
///
/// The defaults match the conventions most tests are written against: a
/// 200ms budget checked every 10ms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    await_budget: Duration,
    poll_interval: Duration,
    thread_name: String,
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the budget `await_tasks` allows for all outstanding work.
    #[must_use]
    pub fn with_await_budget(mut self, budget: Duration) -> Self {
        self.await_budget = budget;
        self
    }

    /// Sets how often `await_tasks` re-checks the outstanding count.
    ///
    /// A zero interval is clamped to one millisecond.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Sets the name of the timer worker thread.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Returns the await budget.
    #[must_use]
    pub fn await_budget(&self) -> Duration {
        self.await_budget
    }

    /// Returns the poll interval of `await_tasks`.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Returns the name of the timer worker thread.
    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            await_budget: DEFAULT_AWAIT_BUDGET,
            poll_interval: DEFAULT_POLL_INTERVAL,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}
