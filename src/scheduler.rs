//! Provides the `Scheduler`, a completion barrier for scheduled work.
//!
//! Tasks handed to the scheduler are wrapped in envelopes and armed on a
//! [`TimingFacility`]. When an envelope fires, the scheduler decides whether the
//! body may run right away or has to wait: outside of [`Scheduler::await_tasks`]
//! fired envelopes are parked in a FIFO hold queue, and only `await_tasks`
//! lets them run. This makes a test's observations independent of how far the
//! real timer got before the test started waiting.
//!
//! `await_tasks` first replays the hold queue on the calling thread, in fire
//! order, then waits until every accepted task has finished or the configured
//! budget runs out. Either way it leaves the scheduler empty, so the next cycle
//! starts clean.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Weak},
    thread,
    time::{Duration, Instant},
};

use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex};

use crate::{
    config::Config,
    envelope::{Body, Envelope, Phase, TaskId},
    error::{Error, Result},
    periodic::Cadence,
    task::Scheduled,
    timing::{Fire, Timer, TimerKey, TimingFacility},
};

/// A cancellable reference to a task accepted by a [`Scheduler`].
///
/// Handles are cheap to clone and never keep the scheduler alive. Once the
/// scheduler is gone, [`cancel`](TaskHandle::cancel) always reports `false`.
#[derive(Clone)]
pub struct TaskHandle {
    envelope: Arc<Envelope>,
    inner: Weak<Inner>,
}

impl TaskHandle {
    /// Returns the id the scheduler assigned to this task.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.envelope.id()
    }

    /// Returns the current lifecycle phase of the task.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.envelope.phase()
    }

    /// Returns `true` if the task was scheduled with a periodic cadence.
    #[must_use]
    pub fn is_periodic(&self) -> bool {
        self.envelope.is_periodic()
    }

    /// Cancels the task, see [`Scheduler::cancel`].
    pub fn cancel(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.cancel(self.envelope.id()))
    }
}

struct Slot {
    envelope: Arc<Envelope>,
    key: TimerKey,
    // Whether this envelope currently contributes to `outstanding`.
    counted: bool,
    // A periodic envelope cancelled while running; retired once the run ends.
    doomed: bool,
}

#[derive(Default)]
struct State {
    draining: bool,
    outstanding: usize,
    held: VecDeque<TaskId>,
    slots: HashMap<TaskId, Slot>,
    next_id: u64,
}

impl State {
    fn uncount(&mut self, id: TaskId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            if slot.counted {
                slot.counted = false;
                self.outstanding = self.outstanding.saturating_sub(1);
            }
        }
    }
}

struct Inner {
    config: Config,
    facility: Box<dyn TimingFacility>,
    state: Mutex<State>,
    settled: Condvar,
}

// Marks a firing as finished when dropped, also when the body panics.
struct Finish<'a> {
    inner: &'a Inner,
    id: TaskId,
}

impl Drop for Finish<'_> {
    fn drop(&mut self) {
        self.inner.finish(self.id);
    }
}

// Returns the scheduler to a clean slate when a held body unwinds out of an
// await cycle. Regular exits reset inside `wait_settled`.
struct ResetOnPanic<'a>(&'a Inner);

impl Drop for ResetOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let discarded = self.0.reset(&mut self.0.state.lock());
            retire(discarded);
        }
    }
}

fn retire(discarded: Vec<Arc<Envelope>>) {
    if !discarded.is_empty() {
        tracing::debug!(discarded = discarded.len(), "reset dropped unfinished tasks");
    }
    for envelope in discarded {
        envelope.discard();
    }
}

impl Inner {
    fn accept(
        self: &Arc<Self>,
        body: Body,
        delay: Duration,
        cadence: Cadence,
    ) -> Result<TaskHandle> {
        if matches!(cadence, Cadence::FixedRate(p) | Cadence::FixedDelay(p) if p.is_zero()) {
            return Err(Error::ZeroPeriod);
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let id = TaskId::new(state.next_id);
        state.next_id += 1;
        let envelope = Arc::new(Envelope::new(id, cadence.is_periodic(), body));

        let weak = Arc::downgrade(self);
        let fire: Fire = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.fire(id);
            }
        });
        // The worker has to take the state lock before it can act on `fire`,
        // so the slot below is always in place by then.
        let key = self.facility.arm(delay, cadence, fire)?;

        state.slots.insert(
            id,
            Slot {
                envelope: Arc::clone(&envelope),
                key,
                counted: true,
                doomed: false,
            },
        );
        state.outstanding += 1;
        tracing::trace!(task = %id, ?delay, ?cadence, "task accepted");

        Ok(TaskHandle {
            envelope,
            inner: Arc::downgrade(self),
        })
    }

    fn fire(&self, id: TaskId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(slot) = state.slots.get_mut(&id) else {
            return;
        };
        match slot.envelope.phase() {
            Phase::Live => {}
            Phase::Held | Phase::Running => {
                // A periodic firing overlapping the previous one.
                tracing::trace!(task = %id, "firing coalesced");
                return;
            }
            Phase::Ran | Phase::Cancelled => return,
        }
        if !slot.counted {
            slot.counted = true;
            state.outstanding += 1;
        }

        if state.draining {
            slot.envelope.set_phase(Phase::Running);
            let envelope = Arc::clone(&slot.envelope);
            drop(guard);
            tracing::trace!(task = %id, "task fired while draining");
            self.run(&envelope);
        } else {
            slot.envelope.set_phase(Phase::Held);
            state.held.push_back(id);
            tracing::trace!(task = %id, held = state.held.len(), "task held");
        }
    }

    fn run(&self, envelope: &Envelope) {
        let _finish = Finish {
            inner: self,
            id: envelope.id(),
        };
        envelope.run();
    }

    fn finish(&self, id: TaskId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.uncount(id);

        let mut retired = None;
        if let Some(slot) = state.slots.get(&id) {
            if slot.doomed {
                slot.envelope.set_phase(Phase::Cancelled);
                retired = state.slots.remove(&id).map(|slot| slot.envelope);
            } else if slot.envelope.is_periodic() {
                slot.envelope.set_phase(Phase::Live);
            } else {
                slot.envelope.set_phase(Phase::Ran);
                state.slots.remove(&id);
            }
        }
        tracing::trace!(task = %id, outstanding = state.outstanding, "task ran");
        drop(guard);
        self.settled.notify_all();

        if let Some(envelope) = retired {
            envelope.discard();
        }
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(slot) = state.slots.get_mut(&id) else {
            tracing::debug!(task = %id, "cancel too late");
            return false;
        };

        match slot.envelope.phase() {
            Phase::Live => {
                // Losing the race against the worker is fine: once the slot
                // is gone the pending firing finds nothing to do.
                self.facility.disarm(slot.key);
            }
            Phase::Held => {
                self.facility.disarm(slot.key);
                state.held.retain(|held| *held != id);
            }
            Phase::Running if slot.envelope.is_periodic() && !slot.doomed => {
                self.facility.disarm(slot.key);
                slot.doomed = true;
                tracing::debug!(task = %id, "periodic task cancelled while running");
                return true;
            }
            Phase::Running | Phase::Ran | Phase::Cancelled => {
                tracing::debug!(task = %id, "cancel too late");
                return false;
            }
        }

        state.uncount(id);
        let envelope = state.slots.remove(&id).map(|slot| slot.envelope);
        if let Some(envelope) = &envelope {
            envelope.set_phase(Phase::Cancelled);
        }
        tracing::debug!(task = %id, outstanding = state.outstanding, "task cancelled");
        drop(guard);
        self.settled.notify_all();

        if let Some(envelope) = envelope {
            envelope.discard();
        }
        true
    }

    fn drain_held(&self) {
        loop {
            let envelope = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let Some(id) = state.held.pop_front() else {
                    break;
                };
                let Some(slot) = state.slots.get(&id) else {
                    continue;
                };
                slot.envelope.set_phase(Phase::Running);
                Arc::clone(&slot.envelope)
            };
            tracing::trace!(task = %envelope.id(), "draining held task");
            self.run(&envelope);
        }
    }

    /// Waits for the outstanding count to reach zero, then resets the cycle
    /// without releasing the lock in between. Work accepted afterwards belongs
    /// to the next cycle.
    fn wait_settled(&self, start: Instant) -> Result<()> {
        let budget = self.config.await_budget();
        let deadline = start + budget;
        let mut state = self.state.lock();
        let mut result = Ok(());
        while state.outstanding > 0 {
            let now = Instant::now();
            if now >= deadline {
                let remaining = state.outstanding;
                tracing::error!(
                    remaining,
                    ?budget,
                    "outstanding tasks exceeded the await budget"
                );
                result = Err(Error::Timeout { remaining, budget });
                break;
            }
            let wait = self.config.poll_interval().min(deadline - now);
            self.settled.wait_for(&mut state, wait);
        }
        let discarded = self.reset(&mut state);
        drop(state);
        retire(discarded);
        result
    }

    /// Ends an await cycle. Returns the envelopes whose bodies have to be
    /// dropped once the lock is released.
    fn reset(&self, state: &mut State) -> Vec<Arc<Envelope>> {
        let mut discarded = Vec::new();
        state.draining = false;
        state.outstanding = 0;
        state.held.clear();
        state.slots.retain(|_, slot| {
            slot.counted = false;
            let keep = match slot.envelope.phase() {
                Phase::Held => slot.envelope.is_periodic(),
                Phase::Live if slot.envelope.is_periodic() => true,
                Phase::Live => {
                    self.facility.disarm(slot.key);
                    false
                }
                // Still executing; its completion will no longer count.
                Phase::Running => true,
                Phase::Ran | Phase::Cancelled => false,
            };
            if !keep {
                slot.envelope.set_phase(Phase::Cancelled);
                discarded.push(Arc::clone(&slot.envelope));
            } else if slot.envelope.phase() == Phase::Held {
                slot.envelope.set_phase(Phase::Live);
            }
            keep
        });
        discarded
    }
}

/// Completion barrier for work scheduled on a background timer.
///
/// Tasks are accepted with [`schedule`](Scheduler::schedule),
/// [`submit`](Scheduler::submit) and their variants, and are guaranteed to have
/// run by the time [`await_tasks`](Scheduler::await_tasks) returns.
///
/// ```
/// use std::sync::{
///     Arc,
///     atomic::{AtomicUsize, Ordering},
/// };
/// use std::time::Duration;
///
/// use chronus::Scheduler;
///
/// let scheduler = Scheduler::new();
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// for delay in [10, 20, 30] {
///     let counter = Arc::clone(&counter);
///     scheduler
///         .schedule(
///             move || {
///                 counter.fetch_add(1, Ordering::SeqCst);
///             },
///             Duration::from_millis(delay),
///         )
///         .unwrap();
/// }
///
/// scheduler.await_tasks();
/// assert_eq!(counter.load(Ordering::SeqCst), 3);
/// ```
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Creates a scheduler with the default [`Config`] and its own [`Timer`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a scheduler with the given configuration and its own [`Timer`].
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        let timer = Timer::with_thread_name(config.thread_name());
        Self::with_facility(config, timer)
    }

    /// Creates a scheduler on top of an arbitrary timing facility.
    ///
    /// The facility must not invoke callbacks from inside `arm` or `disarm`.
    #[must_use]
    pub fn with_facility(config: Config, facility: impl TimingFacility + 'static) -> Self {
        Scheduler {
            inner: Arc::new(Inner {
                config,
                facility: Box::new(facility),
                state: Mutex::new(State::default()),
                settled: Condvar::new(),
            }),
        }
    }

    /// Accepts `task` to run once `delay` has elapsed.
    ///
    /// The task counts as outstanding until it has run or is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the timing facility has been shut down.
    pub fn schedule(
        &self,
        task: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> Result<TaskHandle> {
        self.inner
            .accept(Body::Once(Box::new(task)), delay, Cadence::Once)
    }

    /// Accepts `task` to run as soon as possible. Same as a zero-delay
    /// [`schedule`](Scheduler::schedule).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the timing facility has been shut down.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<TaskHandle> {
        self.schedule(task, Duration::ZERO)
    }

    /// Accepts a value-producing `task` to run once `delay` has elapsed.
    ///
    /// The value is delivered through the returned [`Scheduled`], which
    /// resolves once the task has run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the timing facility has been shut down.
    pub fn schedule_call<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
        delay: Duration,
    ) -> Result<Scheduled<T>> {
        let (sender, receiver) = oneshot::channel();
        let handle = self.schedule(
            move || {
                // The receiver may already be gone; the value is not needed then.
                let _ = sender.send(task());
            },
            delay,
        )?;
        Ok(Scheduled::new(handle, receiver))
    }

    /// Accepts a value-producing `task` to run as soon as possible.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the timing facility has been shut down.
    pub fn submit_call<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> Result<Scheduled<T>> {
        self.schedule_call(task, Duration::ZERO)
    }

    /// Accepts `task` to run after `initial_delay` and then every `period`,
    /// measured from one due time to the next.
    ///
    /// Each firing counts as outstanding until it has run, so `await_tasks`
    /// returns once the task has run at least once and no firing of it is
    /// pending. The task keeps firing across await cycles until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroPeriod`] for a zero `period` and
    /// [`Error::Shutdown`] if the timing facility has been shut down.
    pub fn schedule_at_fixed_rate(
        &self,
        task: impl FnMut() + Send + 'static,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<TaskHandle> {
        self.inner.accept(
            Body::Repeat(Box::new(task)),
            initial_delay,
            Cadence::FixedRate(period),
        )
    }

    /// Accepts `task` to run after `initial_delay` and then `delay` after each
    /// completed run.
    ///
    /// Accounting is the same as for
    /// [`schedule_at_fixed_rate`](Scheduler::schedule_at_fixed_rate).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroPeriod`] for a zero `delay` and
    /// [`Error::Shutdown`] if the timing facility has been shut down.
    pub fn schedule_with_fixed_delay(
        &self,
        task: impl FnMut() + Send + 'static,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<TaskHandle> {
        self.inner.accept(
            Body::Repeat(Box::new(task)),
            initial_delay,
            Cadence::FixedDelay(delay),
        )
    }

    /// Cancels a task if it has not started running.
    ///
    /// A task that has not fired yet is removed from the timer, a task that
    /// fired and sits in the hold queue is removed from the queue. Either way
    /// its body never runs and it stops counting as outstanding. Returns
    /// `false` if the task is running or has already finished.
    ///
    /// Periodic tasks stop firing; a run in progress is allowed to finish.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        if !handle.inner.ptr_eq(&Arc::downgrade(&self.inner)) {
            return false;
        }
        self.inner.cancel(handle.id())
    }

    /// Runs every held task and waits until no task is outstanding.
    ///
    /// Held tasks run on the calling thread in the order they fired, including
    /// tasks that the held ones schedule and that fire in the meantime.
    /// Afterwards the scheduler is reset, whatever the outcome.
    ///
    /// # Panics
    ///
    /// Panics if outstanding tasks do not finish within the configured await
    /// budget, reporting how many remain. A panic raised by a held task body
    /// propagates to the caller.
    pub fn await_tasks(&self) {
        if let Err(error) = self.try_await_tasks() {
            panic!("{error}");
        }
    }

    /// Same as [`await_tasks`](Scheduler::await_tasks), but reports a timeout
    /// as an error instead of panicking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if outstanding tasks do not finish within the
    /// configured await budget.
    pub fn try_await_tasks(&self) -> Result<()> {
        let start = Instant::now();
        let _reset = ResetOnPanic(&self.inner);
        {
            let mut state = self.inner.state.lock();
            state.draining = true;
            tracing::debug!(
                outstanding = state.outstanding,
                held = state.held.len(),
                "awaiting tasks"
            );
        }
        self.inner.drain_held();
        self.inner.wait_settled(start)?;
        tracing::debug!(elapsed = ?start.elapsed(), "tasks settled");
        Ok(())
    }

    /// Returns the number of accepted tasks that have not finished.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    /// Returns the number of tasks waiting in the hold queue.
    #[must_use]
    pub fn held(&self) -> usize {
        self.inner.state.lock().held.len()
    }

    /// Returns `true` while `await_tasks` lets fired tasks run.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().draining
    }

    /// Returns the configuration this scheduler was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Shuts the timing facility down. Scheduling afterwards fails with
    /// [`Error::Shutdown`].
    pub fn shutdown(&self) {
        self.inner.facility.shutdown();
    }

    /// Returns `true` once the timing facility has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.facility.is_shutdown()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.facility.shutdown();
    }
}
