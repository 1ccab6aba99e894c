//! Executors: where submitted work runs.
//!
//! Every executor hands back a [`TaskFuture`] for each accepted job and
//! refuses work once shut down. They differ in *where* the job runs, which is
//! captured by [`ConcurrencyModel`] and decides whether leases bind per thread
//! or per process.

pub mod inline;
pub mod process_pool;
pub mod thread_pool;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::core::future::TaskFuture;
use crate::core::storage::WorkerScope;
use crate::core::ExecutorError;

pub use inline::{InlineExecutor, SyncExecutor};
pub use process_pool::{ProcessJob, ProcessOutput, ProcessPoolExecutor};
pub use thread_pool::{ExecutorStats, PoolOptions, ThreadPoolExecutor};

/// A unit of work an executor can run.
///
/// Implemented for every `FnOnce() -> anyhow::Result<T>` closure that can be
/// moved to another thread.
pub trait Job: Send + 'static {
    /// Value produced on success.
    type Output: Send + 'static;

    /// Run the job to completion.
    ///
    /// # Errors
    ///
    /// Whatever the job reports; it is stored in the job's future.
    fn run(self) -> anyhow::Result<Self::Output>;
}

impl<F, T> Job for F
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn run(self) -> anyhow::Result<T> {
        self()
    }
}

/// Where an executor runs its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyModel {
    /// On the submitting thread.
    Inline,
    /// On a fixed set of OS threads in this process.
    Threads,
    /// In child processes.
    Processes,
    /// On a remote worker fleet.
    Remote,
}

impl ConcurrencyModel {
    /// Unit that owns lease bindings under this model.
    #[must_use]
    pub const fn worker_scope(self) -> WorkerScope {
        match self {
            Self::Inline | Self::Threads => WorkerScope::Thread,
            Self::Processes | Self::Remote => WorkerScope::Process,
        }
    }
}

/// Lifecycle shared by all executors.
pub trait Executor: Send + Sync {
    /// Where this executor runs jobs.
    fn concurrency(&self) -> ConcurrencyModel;

    /// Whether [`Executor::shutdown`] has been called.
    fn is_shutdown(&self) -> bool;

    /// Stop accepting work. With `wait`, block until accepted work is done.
    ///
    /// # Errors
    ///
    /// [`ExecutorError::Shutdown`] if the executor was already shut down.
    fn shutdown(&self, wait: bool) -> Result<(), ExecutorError>;
}

/// Acceptance of jobs of type `J`.
pub trait Submit<J>: Executor {
    /// Value the job's future resolves to.
    type Output;

    /// Schedule `job` and return a future for its result.
    ///
    /// # Errors
    ///
    /// - [`ExecutorError::Shutdown`] after shutdown
    /// - executor-specific admission errors such as [`ExecutorError::QueueFull`]
    fn submit(&self, job: J) -> Result<TaskFuture<Self::Output>, ExecutorError>;
}

/// How a driven job ended, for executor bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Driven {
    Completed,
    Failed,
    Cancelled,
}

/// Run `job` for `future`: honour a prior cancellation, contain panics, store
/// the outcome.
pub(crate) fn drive<J: Job>(future: &TaskFuture<J::Output>, job: J) -> Driven {
    match future.set_running_or_notify_cancel() {
        Ok(true) => {}
        Ok(false) => return Driven::Cancelled,
        Err(e) => {
            error!(future_id = future.id(), error = %e, "future was not pending when its job started");
            return Driven::Cancelled;
        }
    }

    let (stored, driven) = match catch_unwind(AssertUnwindSafe(|| job.run())) {
        Ok(Ok(value)) => (future.set_result(value), Driven::Completed),
        Ok(Err(e)) => (future.set_failure(e), Driven::Failed),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            (
                future.set_failure(anyhow::anyhow!("job panicked: {message}")),
                Driven::Failed,
            )
        }
    };
    if let Err(e) = stored {
        error!(future_id = future.id(), error = %e, "failed to store job outcome");
    }
    driven
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
