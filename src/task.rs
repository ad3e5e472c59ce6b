//! Cancellable delayed tasks
//!
//! Reconnect timers, recovery windows and rebuild cooldowns are all a
//! `RetryTask`: at most one pending task per owner, aborted when the owner
//! is torn down so a stale timer can never fire into a destroyed object.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A single cancellable delayed task
#[derive(Debug, Default)]
pub struct RetryTask {
    handle: Option<JoinHandle<()>>,
}

impl RetryTask {
    /// Create an idle retry task
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Run `task` after `delay`.
    ///
    /// Returns false (and does nothing) if a task is already pending.
    pub fn schedule<F>(&mut self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_pending() {
            return false;
        }

        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        }));
        true
    }

    /// Replace any pending task with a new one
    pub fn reschedule<F>(&mut self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.schedule(delay, task);
    }

    /// Abort the pending task, if any
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Forget the handle without aborting.
    ///
    /// Called from inside the task once it has fired, so that dropping or
    /// rescheduling the owner does not abort the running callback.
    pub fn disarm(&mut self) {
        self.handle.take();
    }

    /// Whether a task is scheduled and has not finished
    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for RetryTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Delay for the `attempt`-th retry (1-based): `base * 2^(attempt-1)`, capped
pub fn backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(cap)
}
