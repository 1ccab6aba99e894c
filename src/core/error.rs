//! Error types for lease and executor operations.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::core::future::FutureState;

/// Errors produced by leases and the lease registry.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Every `(slot, repeat)` pair is held by some other worker.
    #[error("resource exhausted: no free slot in lease `{name}` (capacity {capacity})")]
    ResourceExhausted {
        /// Lease name.
        name: String,
        /// Total number of bindings the lease can grant.
        capacity: usize,
    },
    /// `release()` was called by a worker that holds no binding.
    #[error("release called with no lock acquired on lease `{0}`")]
    NotHeld(String),
    /// A lease with this name is already registered.
    #[error("a lease named `{0}` has already been registered")]
    AlreadyRegistered(String),
    /// No lease with this name is registered.
    #[error("no lease named `{0}` is registered")]
    NotFound(String),
    /// The calling thread is exiting and can no longer hold a binding.
    #[error("cannot bind lease `{0}`: the calling thread is exiting")]
    WorkerExiting(String),
    /// Lease parameters are unusable.
    #[error("invalid lease definition: {0}")]
    InvalidSpec(String),
    /// The lock directory could not be created.
    #[error("cannot create lock directory {}: {source}", path.display())]
    LockDir {
        /// Directory that was being created.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// A lock file could not be opened, written or removed.
    #[error("lock file {}: {source}", path.display())]
    LockFile {
        /// Lock file path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
}

/// Errors reported by executors when accepting or managing work.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor no longer accepts work.
    #[error("cannot schedule new futures after shutdown")]
    Shutdown,
    /// The work queue is full.
    #[error("executor queue is full")]
    QueueFull,
    /// Executor configuration is unusable.
    #[error("invalid executor configuration: {0}")]
    InvalidConfig(String),
    /// Dispatch to the remote task queue failed.
    #[error("remote dispatch failed: {0}")]
    Transport(#[from] RemoteError),
    /// A worker thread or monitor could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
}

/// Errors observed through a [`TaskFuture`](crate::core::TaskFuture).
#[derive(Debug, Clone, Error)]
pub enum FutureError {
    /// The work was cancelled before it produced a result.
    #[error("future was cancelled")]
    Cancelled,
    /// The wait deadline passed before the future completed.
    #[error("timed out waiting for future")]
    Timeout,
    /// The work finished with an error.
    #[error("task failed: {0:#}")]
    Failed(Arc<anyhow::Error>),
    /// A transition that the future state machine does not allow.
    #[error("invalid future state transition from {from} to {to}")]
    InvalidState {
        /// State the future was in.
        from: FutureState,
        /// State that was requested.
        to: FutureState,
    },
}

/// Errors from a remote task-queue client.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The broker could not be reached or rejected the request.
    #[error("transport error: {0}")]
    Transport(String),
    /// The broker has no record of this task id.
    #[error("unknown remote task `{0}`")]
    UnknownTask(String),
    /// No remote function is registered under this name.
    #[error("unknown remote function `{0}`")]
    UnknownFunction(String),
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Input could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),
    /// Parsed values violate a constraint.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// An environment variable is missing or malformed.
    #[error("environment variable `{key}`: {reason}")]
    Env {
        /// Variable name.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
