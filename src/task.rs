//! Defines `Scheduled`, the result side of a value-producing task.
//!
//! [`Scheduler::schedule_call`](crate::Scheduler::schedule_call) and
//! [`Scheduler::submit_call`](crate::Scheduler::submit_call) return a
//! `Scheduled<T>`. It is a future resolving to the task's value once the task
//! has run, and it carries the [`TaskHandle`] of the task so it can be
//! cancelled like any other.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::channel::oneshot::{self, Receiver};
use pin_project_lite::pin_project;

use crate::{
    error::{Error, Result},
    scheduler::TaskHandle,
};

pin_project! {
    /// The pending value of a task accepted by a [`Scheduler`](crate::Scheduler).
    ///
    /// Resolves to `Ok(value)` once the task has run, or to
    /// [`Error::Abandoned`] if the task was cancelled, dropped by a reset, or
    /// panicked.
    ///
    /// Held tasks only run inside `await_tasks`, so awaiting a `Scheduled`
    /// before that may wait forever. The usual order is to call
    /// `await_tasks` first and read the value afterwards.
    #[must_use = "futures do nothing unless polled or .awaited"]
    pub struct Scheduled<T> {
        handle: TaskHandle,
        #[pin]
        receiver: Receiver<T>,
    }
}

impl<T> Scheduled<T> {
    pub(crate) fn new(handle: TaskHandle, receiver: Receiver<T>) -> Self {
        Scheduled { handle, receiver }
    }

    /// Returns the handle of the underlying task.
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// Cancels the underlying task, see [`Scheduler::cancel`](crate::Scheduler::cancel).
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// Takes the value without waiting.
    ///
    /// Returns `None` while the task has not run yet.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(Err(Error::Abandoned)),
        }
    }

    /// Blocks the current thread until the value is available.
    ///
    /// See the type level docs for when this can block forever.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Abandoned`] if the task will never produce a value.
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for Scheduled<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.receiver
            .poll(cx)
            .map(|result| result.map_err(|oneshot::Canceled| Error::Abandoned))
    }
}
