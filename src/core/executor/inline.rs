//! Executors that run jobs on the submitting thread.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::ReentrantMutex;
use tracing::info;

use super::{drive, ConcurrencyModel, Executor, Job, Submit};
use crate::core::future::TaskFuture;
use crate::core::ExecutorError;

/// Runs each job to completion inside `submit`, under the shutdown lock.
///
/// The lock is re-entrant, so a job may submit further work from the same
/// thread. A `shutdown` from another thread waits for the running job.
#[derive(Debug, Default)]
pub struct InlineExecutor {
    closed: ReentrantMutex<Cell<bool>>,
}

impl InlineExecutor {
    /// A new, open executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Executor for InlineExecutor {
    fn concurrency(&self) -> ConcurrencyModel {
        ConcurrencyModel::Inline
    }

    fn is_shutdown(&self) -> bool {
        self.closed.lock().get()
    }

    fn shutdown(&self, _wait: bool) -> Result<(), ExecutorError> {
        let closed = self.closed.lock();
        if closed.replace(true) {
            return Err(ExecutorError::Shutdown);
        }
        info!("inline executor shut down");
        Ok(())
    }
}

impl<J: Job> Submit<J> for InlineExecutor {
    type Output = J::Output;

    fn submit(&self, job: J) -> Result<TaskFuture<J::Output>, ExecutorError> {
        let closed = self.closed.lock();
        if closed.get() {
            return Err(ExecutorError::Shutdown);
        }
        let future = TaskFuture::new();
        drive(&future, job);
        drop(closed);
        Ok(future)
    }
}

/// Runs each job to completion inside `submit` without holding any lock.
///
/// A `shutdown` from another thread takes effect immediately; the job already
/// running still completes.
#[derive(Debug, Default)]
pub struct SyncExecutor {
    closed: AtomicBool,
}

impl SyncExecutor {
    /// A new, open executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Executor for SyncExecutor {
    fn concurrency(&self) -> ConcurrencyModel {
        ConcurrencyModel::Inline
    }

    fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn shutdown(&self, _wait: bool) -> Result<(), ExecutorError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ExecutorError::Shutdown);
        }
        info!("sync executor shut down");
        Ok(())
    }
}

impl<J: Job> Submit<J> for SyncExecutor {
    type Output = J::Output;

    fn submit(&self, job: J) -> Result<TaskFuture<J::Output>, ExecutorError> {
        if self.is_shutdown() {
            return Err(ExecutorError::Shutdown);
        }
        let future = TaskFuture::new();
        drive(&future, job);
        Ok(future)
    }
}
