#![allow(dead_code)]

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chronus::{Cadence, Error, Fire, TimerKey, TimingFacility};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Body that never returns.
pub fn park_forever() {
    loop {
        std::thread::park();
    }
}

struct ManualEntry {
    delay: Duration,
    cadence: Cadence,
    fire: Fire,
}

#[derive(Default)]
struct ManualState {
    armed: BTreeMap<TimerKey, ManualEntry>,
    next_key: u64,
    shutdown: bool,
}

/// Timing facility that only fires when the test tells it to.
#[derive(Clone, Default)]
pub struct ManualTimer {
    state: Arc<Mutex<ManualState>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of all armed entries, in arming order.
    pub fn armed(&self) -> Vec<TimerKey> {
        self.state.lock().armed.keys().copied().collect()
    }

    pub fn delay_of(&self, key: TimerKey) -> Option<Duration> {
        self.state.lock().armed.get(&key).map(|e| e.delay)
    }

    /// The callback of an armed entry, without firing or removing it.
    pub fn callback(&self, key: TimerKey) -> Option<Fire> {
        self.state
            .lock()
            .armed
            .get(&key)
            .map(|e| Arc::clone(&e.fire))
    }

    /// Fires one entry the way a timer worker would. One-shot entries are
    /// removed, periodic ones stay armed.
    pub fn fire(&self, key: TimerKey) -> bool {
        let fire = {
            let mut state = self.state.lock();
            let Some(entry) = state.armed.get(&key) else {
                return false;
            };
            let fire = Arc::clone(&entry.fire);
            if entry.cadence == Cadence::Once {
                state.armed.remove(&key);
            }
            fire
        };
        fire();
        true
    }

    /// Fires every armed entry once, in arming order.
    pub fn fire_all(&self) -> usize {
        let keys = self.armed();
        keys.into_iter().filter(|key| self.fire(*key)).count()
    }
}

impl TimingFacility for ManualTimer {
    fn arm(&self, delay: Duration, cadence: Cadence, fire: Fire) -> Result<TimerKey, Error> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(Error::Shutdown);
        }
        let key = TimerKey::new(state.next_key);
        state.next_key += 1;
        state.armed.insert(
            key,
            ManualEntry {
                delay,
                cadence,
                fire,
            },
        );
        Ok(key)
    }

    fn disarm(&self, key: TimerKey) -> bool {
        self.state.lock().armed.remove(&key).is_some()
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.armed.clear();
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}

/// Shared log of which task ran, in order.
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<&'static str>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorder(&self, name: &'static str) -> impl FnOnce() + Send + 'static {
        let entries = Arc::clone(&self.entries);
        move || entries.lock().push(name)
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.entries.lock().clone()
    }
}
