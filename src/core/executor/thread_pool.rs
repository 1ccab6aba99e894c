//! Fixed pool of named OS worker threads.
//!
//! Workers block on a bounded `crossbeam-channel` queue; there is no polling.
//! Shutting down drops the sender, so each worker drains what is already
//! queued and then exits on its own. Each worker is a distinct thread, which
//! makes it a distinct lease holder for thread-scoped leases; its bindings are
//! released when the thread exits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{drive, ConcurrencyModel, Driven, Executor, Job, Submit};
use crate::core::future::TaskFuture;
use crate::core::ExecutorError;

/// Sizing of a worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Number of worker threads.
    pub max_workers: usize,
    /// Jobs that may wait in the queue before submission is refused.
    pub max_queue_depth: usize,
    /// Worker thread name prefix; workers are named `{prefix}-{index}`.
    pub thread_name: String,
    /// Stack size for worker threads, if not the platform default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_size: Option<usize>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get(),
            max_queue_depth: 1024,
            thread_name: "lease-worker".to_string(),
            stack_size: None,
        }
    }
}

impl PoolOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the queue depth.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Set the worker stack size.
    #[must_use]
    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Check the options.
    ///
    /// # Errors
    ///
    /// [`ExecutorError::InvalidConfig`] if a size is zero.
    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.max_workers == 0 {
            return Err(ExecutorError::InvalidConfig(
                "max_workers must be greater than 0".into(),
            ));
        }
        if self.max_queue_depth == 0 {
            return Err(ExecutorError::InvalidConfig(
                "max_queue_depth must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Jobs accepted so far.
    pub submitted: u64,
    /// Jobs currently executing.
    pub active: u64,
    /// Jobs waiting in the queue.
    pub queued: u64,
    /// Jobs that produced a result.
    pub completed: u64,
    /// Jobs that returned an error or panicked.
    pub failed: u64,
    /// Jobs skipped because their future was cancelled first.
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    active: AtomicU64,
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn snapshot(&self, worker_count: usize) -> ExecutorStats {
        ExecutorStats {
            worker_count,
            submitted: self.submitted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

type Task = Box<dyn FnOnce() -> Driven + Send>;

/// Executor backed by a fixed set of OS threads.
pub struct ThreadPoolExecutor {
    options: PoolOptions,
    task_tx: Mutex<Option<Sender<Task>>>,
    counters: Arc<Counters>,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("options", &self.options)
            .field("closed", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl ThreadPoolExecutor {
    /// Start `options.max_workers` worker threads.
    ///
    /// # Errors
    ///
    /// - [`ExecutorError::InvalidConfig`] if the options are invalid
    /// - [`ExecutorError::Spawn`] if a worker thread cannot be started
    pub fn new(options: PoolOptions) -> Result<Self, ExecutorError> {
        options.validate()?;

        let (task_tx, task_rx) = bounded::<Task>(options.max_queue_depth);
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(options.max_workers);
        for worker_id in 0..options.max_workers {
            match spawn_worker(worker_id, &options, task_rx.clone(), Arc::clone(&counters)) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Closing the channel lets the workers already started exit.
                    drop(task_tx);
                    return Err(ExecutorError::Spawn(e.to_string()));
                }
            }
        }

        info!(
            max_workers = options.max_workers,
            max_queue_depth = options.max_queue_depth,
            "thread pool executor started"
        );

        Ok(Self {
            options,
            task_tx: Mutex::new(Some(task_tx)),
            counters,
            closed: AtomicBool::new(false),
            workers: Mutex::new(workers),
        })
    }

    /// Start a pool with `max_workers` threads and default queue depth.
    ///
    /// # Errors
    ///
    /// As [`ThreadPoolExecutor::new`].
    pub fn with_workers(max_workers: usize) -> Result<Self, ExecutorError> {
        Self::new(PoolOptions::new().with_max_workers(max_workers))
    }

    /// Current activity counters.
    #[must_use]
    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot(self.options.max_workers)
    }

    /// Pool sizing.
    #[must_use]
    pub const fn options(&self) -> &PoolOptions {
        &self.options
    }

    fn enqueue(&self, task: Task) -> Result<(), ExecutorError> {
        let task_tx = self.task_tx.lock();
        let Some(sender) = task_tx.as_ref() else {
            return Err(ExecutorError::Shutdown);
        };
        // Count before sending so a fast worker never decrements below zero.
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        match sender.try_send(task) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                warn!(max_queue_depth = self.options.max_queue_depth, "executor queue is full");
                Err(ExecutorError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                Err(ExecutorError::Shutdown)
            }
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn concurrency(&self) -> ConcurrencyModel {
        ConcurrencyModel::Threads
    }

    fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn shutdown(&self, wait: bool) -> Result<(), ExecutorError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ExecutorError::Shutdown);
        }
        info!(wait, "shutting down thread pool executor");

        // Workers drain the queue, then see the channel close.
        self.task_tx.lock().take();

        if wait {
            let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
            let worker_count = workers.len();
            for (worker_id, worker) in workers.into_iter().enumerate() {
                if worker.join().is_err() {
                    warn!(worker_id, "worker thread panicked");
                } else {
                    debug!(worker_id, "worker joined");
                }
            }
            info!(worker_count, "thread pool executor shut down");
        }
        Ok(())
    }
}

impl<J: Job> Submit<J> for ThreadPoolExecutor {
    type Output = J::Output;

    fn submit(&self, job: J) -> Result<TaskFuture<J::Output>, ExecutorError> {
        if self.is_shutdown() {
            return Err(ExecutorError::Shutdown);
        }
        let future = TaskFuture::new();
        let handle = future.clone();
        self.enqueue(Box::new(move || drive(&handle, job)))?;
        debug!(future_id = future.id(), "job submitted to thread pool");
        Ok(future)
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        // Close the queue but do not join: a worker stuck in a job would hang
        // the dropping thread. Call `shutdown(true)` for a graceful stop.
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.task_tx.lock().take();
            debug!("thread pool dropped without explicit shutdown, workers detached");
        }
    }
}

fn spawn_worker(
    worker_id: usize,
    options: &PoolOptions,
    task_rx: Receiver<Task>,
    counters: Arc<Counters>,
) -> std::io::Result<JoinHandle<()>> {
    let mut builder = thread::Builder::new().name(format!("{}-{worker_id}", options.thread_name));
    if let Some(stack_size) = options.stack_size {
        builder = builder.stack_size(stack_size);
    }
    builder.spawn(move || {
        debug!(worker_id, "worker thread started");

        // Blocks until work arrives; returns Err once the sender is gone and
        // the queue is empty.
        while let Ok(task) = task_rx.recv() {
            counters.queued.fetch_sub(1, Ordering::Relaxed);
            counters.active.fetch_add(1, Ordering::Relaxed);

            let counter = match task() {
                Driven::Completed => &counters.completed,
                Driven::Failed => &counters.failed,
                Driven::Cancelled => &counters.cancelled,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            counters.active.fetch_sub(1, Ordering::Relaxed);
        }

        debug!(worker_id, "worker thread exiting");
    })
}
