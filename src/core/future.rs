//! Handles to the eventual result of submitted work.
//!
//! A [`TaskFuture`] is a small state machine shared between the executor that
//! drives it and any number of waiters:
//!
//! ```text
//! Pending ──► Running ──► Finished
//!    │           │
//!    │           └──────► Cancelled      (remote revocation of running work)
//!    └──────────────────► Cancelled ──► CancelledAndNotified
//! ```
//!
//! No transition leaves `Finished` or `CancelledAndNotified`. Waiting uses a
//! `parking_lot::Condvar`; there is no polling on the waiter side.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::core::FutureError;

/// Lifecycle state of a [`TaskFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FutureState {
    /// Submitted, not started.
    Pending,
    /// Executing.
    Running,
    /// Completed with a result or a failure.
    Finished,
    /// Cancelled; the executor has not acknowledged it yet.
    Cancelled,
    /// Cancelled and acknowledged by the executor.
    CancelledAndNotified,
}

impl FutureState {
    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Cancelled)
                | (Self::Running, Self::Finished | Self::Cancelled)
                | (Self::Cancelled, Self::CancelledAndNotified)
        )
    }

    /// Whether the future has a final outcome (result, failure or cancellation).
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Cancelled | Self::CancelledAndNotified
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::CancelledAndNotified)
    }
}

impl fmt::Display for FutureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Cancelled => "CANCELLED",
            Self::CancelledAndNotified => "CANCELLED_AND_NOTIFIED",
        };
        f.write_str(name)
    }
}

/// Process-unique identity of a future.
pub type FutureId = u64;

static NEXT_FUTURE_ID: AtomicU64 = AtomicU64::new(1);

/// Veto over cancelling a pending future whose work lives elsewhere.
///
/// Called without the future's lock held.
pub trait CancelHook: Send + Sync {
    /// Try to withdraw the work. Returns `true` only if it will not run.
    fn try_cancel(&self) -> bool;
}

type Callback<T> = Box<dyn FnOnce(&TaskFuture<T>) + Send>;

struct Inner<T> {
    state: FutureState,
    outcome: Option<Result<T, Arc<anyhow::Error>>>,
    callbacks: Vec<Callback<T>>,
}

struct Shared<T> {
    id: FutureId,
    inner: Mutex<Inner<T>>,
    done: Condvar,
    cancel_hook: Option<Box<dyn CancelHook>>,
}

/// Handle to the eventual result of submitted work. Clones share state.
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Default for TaskFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskFuture<T> {
    /// A pending future.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A pending future whose cancellation is subject to `hook`.
    #[must_use]
    pub fn with_cancel_hook(hook: Box<dyn CancelHook>) -> Self {
        Self::build(Some(hook))
    }

    fn build(cancel_hook: Option<Box<dyn CancelHook>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_FUTURE_ID.fetch_add(1, Ordering::Relaxed),
                inner: Mutex::new(Inner {
                    state: FutureState::Pending,
                    outcome: None,
                    callbacks: Vec::new(),
                }),
                done: Condvar::new(),
                cancel_hook,
            }),
        }
    }

    /// Identity of this future.
    #[must_use]
    pub fn id(&self) -> FutureId {
        self.shared.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> FutureState {
        self.shared.inner.lock().state
    }

    /// Whether the future finished or was cancelled.
    #[must_use]
    pub fn done(&self) -> bool {
        self.state().is_done()
    }

    /// Whether the work is executing.
    #[must_use]
    pub fn running(&self) -> bool {
        self.state() == FutureState::Running
    }

    /// Whether the future was cancelled.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        matches!(
            self.state(),
            FutureState::Cancelled | FutureState::CancelledAndNotified
        )
    }

    /// Attempt to cancel the work.
    ///
    /// Returns `false` if the work is running or finished, `true` if the
    /// future is (now or already) cancelled. A pending future with a
    /// [`CancelHook`] is only cancelled if the hook agrees.
    pub fn cancel(&self) -> bool {
        {
            let inner = self.shared.inner.lock();
            match inner.state {
                FutureState::Running | FutureState::Finished => return false,
                FutureState::Cancelled | FutureState::CancelledAndNotified => return true,
                FutureState::Pending => {}
            }
        }

        if let Some(hook) = &self.shared.cancel_hook {
            if !hook.try_cancel() {
                return false;
            }
        }

        let mut inner = self.shared.inner.lock();
        match inner.state {
            FutureState::Pending => {
                inner.state = FutureState::Cancelled;
                self.complete(inner);
                true
            }
            // Someone else moved it while the hook ran.
            FutureState::Cancelled | FutureState::CancelledAndNotified => true,
            FutureState::Running | FutureState::Finished => false,
        }
    }

    /// Executor entry point before running the work.
    ///
    /// Moves `Pending → Running` and returns `true`, or acknowledges a
    /// cancellation (`Cancelled → CancelledAndNotified`) and returns `false`,
    /// in which case the work must not run.
    ///
    /// # Errors
    ///
    /// [`FutureError::InvalidState`] from any other state.
    pub fn set_running_or_notify_cancel(&self) -> Result<bool, FutureError> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            FutureState::Pending => {
                inner.state = FutureState::Running;
                Ok(true)
            }
            FutureState::Cancelled => {
                inner.state = FutureState::CancelledAndNotified;
                self.shared.done.notify_all();
                Ok(false)
            }
            from => Err(FutureError::InvalidState {
                from,
                to: FutureState::Running,
            }),
        }
    }

    /// Store the result of running work.
    ///
    /// # Errors
    ///
    /// [`FutureError::InvalidState`] unless the future is running.
    pub fn set_result(&self, value: T) -> Result<(), FutureError> {
        self.finish(Ok(value))
    }

    /// Store the failure of running work.
    ///
    /// # Errors
    ///
    /// [`FutureError::InvalidState`] unless the future is running.
    pub fn set_failure(&self, error: anyhow::Error) -> Result<(), FutureError> {
        self.finish(Err(Arc::new(error)))
    }

    fn finish(&self, outcome: Result<T, Arc<anyhow::Error>>) -> Result<(), FutureError> {
        let mut inner = self.shared.inner.lock();
        if !inner.state.can_transition_to(FutureState::Finished) {
            return Err(FutureError::InvalidState {
                from: inner.state,
                to: FutureState::Finished,
            });
        }
        inner.state = FutureState::Finished;
        inner.outcome = Some(outcome);
        self.complete(inner);
        Ok(())
    }

    /// Cancel regardless of the hook, including running work, and acknowledge
    /// it. Used when the remote side has already revoked the task.
    pub(crate) fn abandon(&self) {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            // Pending/Running → Cancelled → CancelledAndNotified in one step.
            FutureState::Pending | FutureState::Running => {
                inner.state = FutureState::CancelledAndNotified;
                self.complete(inner);
            }
            FutureState::Cancelled => {
                inner.state = FutureState::CancelledAndNotified;
                self.shared.done.notify_all();
            }
            FutureState::Finished | FutureState::CancelledAndNotified => {}
        }
    }

    /// Wake waiters and run callbacks after reaching a done state.
    fn complete(&self, mut inner: MutexGuard<'_, Inner<T>>) {
        let callbacks = std::mem::take(&mut inner.callbacks);
        self.shared.done.notify_all();
        drop(inner);
        self.run_callbacks(callbacks);
    }

    fn run_callbacks(&self, callbacks: Vec<Callback<T>>) {
        for callback in callbacks {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(self)));
            if outcome.is_err() {
                error!(future_id = self.shared.id, "done callback panicked");
            }
        }
    }

    /// Run `callback` once the future is done; immediately if it already is.
    pub fn add_done_callback(&self, callback: impl FnOnce(&Self) + Send + 'static) {
        let mut inner = self.shared.inner.lock();
        if inner.state.is_done() {
            drop(inner);
            self.run_callbacks(vec![Box::new(callback)]);
        } else {
            inner.callbacks.push(Box::new(callback));
        }
    }

    /// Block until done or until `timeout` elapses. Returns whether done.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.shared.inner.lock();
        while !inner.state.is_done() {
            match deadline {
                Some(deadline) => {
                    if self.shared.done.wait_until(&mut inner, deadline).timed_out() {
                        return inner.state.is_done();
                    }
                }
                None => self.shared.done.wait(&mut inner),
            }
        }
        true
    }

    /// The stored failure, if the work finished with one.
    #[must_use]
    pub fn failure(&self) -> Option<Arc<anyhow::Error>> {
        match &self.shared.inner.lock().outcome {
            Some(Err(e)) => Some(Arc::clone(e)),
            _ => None,
        }
    }
}

impl<T: Clone> TaskFuture<T> {
    /// Block until done and return the result.
    ///
    /// # Errors
    ///
    /// - [`FutureError::Cancelled`] if the work was cancelled
    /// - [`FutureError::Failed`] if the work failed
    pub fn result(&self) -> Result<T, FutureError> {
        self.wait(None);
        self.outcome()
    }

    /// Like [`TaskFuture::result`] with a deadline.
    ///
    /// # Errors
    ///
    /// [`FutureError::Timeout`] if the future is not done within `timeout`,
    /// otherwise as [`TaskFuture::result`].
    pub fn result_timeout(&self, timeout: Duration) -> Result<T, FutureError> {
        if !self.wait(Some(timeout)) {
            return Err(FutureError::Timeout);
        }
        self.outcome()
    }

    /// Non-blocking look at the outcome.
    ///
    /// # Errors
    ///
    /// [`FutureError::Timeout`] if not done yet, otherwise as
    /// [`TaskFuture::result`].
    pub fn try_result(&self) -> Result<T, FutureError> {
        if !self.done() {
            return Err(FutureError::Timeout);
        }
        self.outcome()
    }

    fn outcome(&self) -> Result<T, FutureError> {
        let inner = self.shared.inner.lock();
        match (&inner.state, &inner.outcome) {
            (FutureState::Cancelled | FutureState::CancelledAndNotified, _) => {
                Err(FutureError::Cancelled)
            }
            (_, Some(Ok(value))) => Ok(value.clone()),
            (_, Some(Err(e))) => Err(FutureError::Failed(Arc::clone(e))),
            (from, None) => Err(FutureError::InvalidState {
                from: *from,
                to: FutureState::Finished,
            }),
        }
    }
}

#[cfg(feature = "tokio-runtime")]
impl<T: Clone + Send + 'static> TaskFuture<T> {
    /// Await the result from async code.
    ///
    /// The condvar wait runs on tokio's blocking pool so the calling runtime
    /// is never blocked.
    ///
    /// # Errors
    ///
    /// As [`TaskFuture::result_timeout`].
    pub async fn result_async(&self, timeout: Duration) -> Result<T, FutureError> {
        let future = self.clone();
        match tokio::task::spawn_blocking(move || future.result_timeout(timeout)).await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(FutureError::Failed(Arc::new(anyhow::anyhow!(
                "waiter task failed: {join_error}"
            )))),
        }
    }
}

/// Block until every future is done or `timeout` elapses. Returns whether all
/// are done.
pub fn wait_all<T>(futures: &[TaskFuture<T>], timeout: Option<Duration>) -> bool {
    let deadline = timeout.map(|t| Instant::now() + t);
    futures.iter().all(|future| {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        future.wait(remaining)
    })
}
