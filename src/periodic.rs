//! Re-arming rules for timer entries.
//!
//! A [`Cadence`] tells the timing facility whether an entry fires once or keeps
//! coming back, and how its next due time is derived from the previous one.

use std::time::{Duration, Instant};

/// How a timer entry is re-armed after it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cadence {
    /// Fires a single time and is then forgotten.
    Once,

    /// Fires every `period`, measured from the previous due time.
    ///
    /// If a firing runs late, the following ones are not pushed back, so a
    /// slow callback is followed by firings in quick succession.
    FixedRate(Duration),

    /// Fires `delay` after the previous firing has completed.
    FixedDelay(Duration),
}

impl Cadence {
    /// Returns `true` for cadences that re-arm after firing.
    #[must_use]
    pub const fn is_periodic(&self) -> bool {
        !matches!(self, Cadence::Once)
    }

    /// Computes the next due time of an entry that was due at `due` and whose
    /// callback finished at `finished`.
    ///
    /// Returns `None` for [`Cadence::Once`].
    #[must_use]
    pub fn next_due(&self, due: Instant, finished: Instant) -> Option<Instant> {
        match *self {
            Cadence::Once => None,
            Cadence::FixedRate(period) => Some(due + period),
            Cadence::FixedDelay(delay) => Some(finished + delay),
        }
    }
}
