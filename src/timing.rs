//! Timing facility for scheduled callbacks.
//!
//! [`TimingFacility`] is the capability the scheduler needs from a timer: arm a
//! callback after a delay, optionally re-arm it periodically, disarm it before
//! it fires and shut the whole thing down. [`Timer`] implements it with a single
//! dedicated worker thread driving a deadline-ordered heap, so callbacks never
//! fire concurrently with each other.

use std::{
    any::Any,
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    config::DEFAULT_THREAD_NAME,
    error::{Error, Result},
    periodic::Cadence,
};

/// Callback invoked by a timing facility when an entry becomes due.
pub type Fire = Arc<dyn Fn() + Send + Sync>;

/// Identifies an armed timer entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey(u64);

impl TimerKey {
    /// Creates a key from a raw value.
    ///
    /// Useful for alternative [`TimingFacility`] implementations.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw key value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

/// A delay-ordered timer that fires callbacks.
///
/// Implementations must never invoke two callbacks at the same time, and must
/// not invoke a callback after [`disarm`](TimingFacility::disarm) returned
/// `true` for its key, except for a firing that was already in progress.
pub trait TimingFacility: Send + Sync {
    /// Arms `fire` to be invoked once `delay` has elapsed, then re-armed
    /// according to `cadence`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the facility has been shut down.
    fn arm(&self, delay: Duration, cadence: Cadence, fire: Fire) -> Result<TimerKey>;

    /// Removes an entry so it never fires again.
    ///
    /// Returns `false` if the entry is unknown, already disarmed, or was a
    /// one-shot entry that has already fired.
    fn disarm(&self, key: TimerKey) -> bool;

    /// Stops the facility and drops every pending callback.
    fn shutdown(&self);

    /// Returns `true` once [`shutdown`](TimingFacility::shutdown) was called.
    fn is_shutdown(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Entry {
    due: Instant,
    seq: u64,
    key: TimerKey,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap: earliest due first, then arming order.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Armed {
    fire: Fire,
    cadence: Cadence,
    // Sequence number of the heap entry that currently represents this key.
    seq: u64,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Entry>,
    armed: HashMap<TimerKey, Armed>,
    next_key: u64,
    next_seq: u64,
    // A callback is executing on the worker with the lock released.
    firing: bool,
    shutdown: bool,
}

impl Queue {
    fn push(&mut self, key: TimerKey, due: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { due, seq, key });
        seq
    }

    fn is_current(&self, entry: &Entry) -> bool {
        self.armed
            .get(&entry.key)
            .is_some_and(|armed| armed.seq == entry.seq)
    }

    fn rearm(&mut self, key: TimerKey, due: Instant) {
        if !self.armed.contains_key(&key) {
            return;
        }
        let seq = self.push(key, due);
        if let Some(armed) = self.armed.get_mut(&key) {
            armed.seq = seq;
        }
    }
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

/// Single-worker implementation of [`TimingFacility`].
///
/// The worker thread is started on construction and stopped on
/// [`shutdown`](TimingFacility::shutdown) or drop. A panicking callback is
/// logged and does not stop the worker. Shutting down while a callback is
/// running does not wait for it: the worker is detached and exits once the
/// callback returns.
pub struct Timer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Starts a timer whose worker thread has the default name.
    #[must_use]
    pub fn new() -> Self {
        Self::with_thread_name(DEFAULT_THREAD_NAME)
    }

    /// Starts a timer whose worker thread is called `name`.
    #[must_use]
    pub fn with_thread_name(name: impl Into<String>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let name = name.into();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(&worker_shared))
            .expect("Timer worker thread creation failed");
        tracing::debug!(thread = %name, "timer started");
        Timer {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Returns the number of armed entries, periodic ones included.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().armed.len()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingFacility for Timer {
    fn arm(&self, delay: Duration, cadence: Cadence, fire: Fire) -> Result<TimerKey> {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(Error::Shutdown);
        }
        let key = TimerKey(queue.next_key);
        queue.next_key += 1;
        let seq = queue.push(key, Instant::now() + delay);
        queue.armed.insert(key, Armed { fire, cadence, seq });
        self.shared.wake.notify_one();
        Ok(key)
    }

    fn disarm(&self, key: TimerKey) -> bool {
        // The heap entry stays behind and is skipped once it surfaces.
        self.shared.queue.lock().armed.remove(&key).is_some()
    }

    fn shutdown(&self) {
        let busy = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            self.shared.wake.notify_all();
            queue.firing
        };
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        // A callback may tear the timer down from the worker itself, or may
        // never return at all. Either way the worker is left to exit alone.
        if busy || worker.thread().id() == thread::current().id() {
            tracing::debug!("timer shut down with a callback in flight, worker detached");
            return;
        }
        if worker.join().is_err() {
            tracing::warn!("timer worker exited with a panic");
        }
        tracing::debug!("timer shut down");
    }

    fn is_shutdown(&self) -> bool {
        self.shared.queue.lock().shutdown
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            break;
        }
        let Some(head) = queue.heap.peek().copied() else {
            shared.wake.wait(&mut queue);
            continue;
        };
        if !queue.is_current(&head) {
            queue.heap.pop();
            continue;
        }
        if head.due > Instant::now() {
            shared.wake.wait_until(&mut queue, head.due);
            continue;
        }
        queue.heap.pop();

        let Some(armed) = queue.armed.get(&head.key) else {
            continue;
        };
        let fire = Arc::clone(&armed.fire);
        let cadence = armed.cadence;
        if !cadence.is_periodic() {
            queue.armed.remove(&head.key);
        }

        queue.firing = true;
        let finished = MutexGuard::unlocked(&mut queue, || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| fire())) {
                tracing::warn!(
                    key = head.key.get(),
                    panic = panic_message(payload.as_ref()),
                    "timer callback panicked"
                );
            }
            Instant::now()
        });
        queue.firing = false;

        if let Some(next) = cadence.next_due(head.due, finished) {
            queue.rearm(head.key, next);
        }
    }
    queue.heap.clear();
    queue.armed.clear();
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
