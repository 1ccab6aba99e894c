//! Build executors from configuration.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::{ExecutorConfig, ExecutorKind, Settings};
use crate::core::executor::{ConcurrencyModel, Executor, Job, Submit};
use crate::core::future::TaskFuture;
use crate::core::remote::{RemoteExecutor, RemoteExecutorOptions};
use crate::core::{ExecutorError, InlineExecutor, ProcessPoolExecutor, SyncExecutor, ThreadPoolExecutor};
use crate::infra::remote::TaskQueueClient;

/// An executor that runs closures in this process.
#[derive(Debug)]
pub enum LocalExecutor {
    /// See [`InlineExecutor`].
    Inline(InlineExecutor),
    /// See [`SyncExecutor`].
    Sync(SyncExecutor),
    /// See [`ThreadPoolExecutor`].
    ThreadPool(ThreadPoolExecutor),
}

impl LocalExecutor {
    fn as_executor(&self) -> &dyn Executor {
        match self {
            Self::Inline(executor) => executor,
            Self::Sync(executor) => executor,
            Self::ThreadPool(executor) => executor,
        }
    }
}

impl Executor for LocalExecutor {
    fn concurrency(&self) -> ConcurrencyModel {
        self.as_executor().concurrency()
    }

    fn is_shutdown(&self) -> bool {
        self.as_executor().is_shutdown()
    }

    fn shutdown(&self, wait: bool) -> Result<(), ExecutorError> {
        self.as_executor().shutdown(wait)
    }
}

impl<J: Job> Submit<J> for LocalExecutor {
    type Output = J::Output;

    fn submit(&self, job: J) -> Result<TaskFuture<J::Output>, ExecutorError> {
        match self {
            Self::Inline(executor) => executor.submit(job),
            Self::Sync(executor) => executor.submit(job),
            Self::ThreadPool(executor) => executor.submit(job),
        }
    }
}

fn require_kind(cfg: &ExecutorConfig, wanted: &[ExecutorKind]) -> Result<(), ExecutorError> {
    cfg.validate()
        .map_err(|e| ExecutorError::InvalidConfig(e.to_string()))?;
    if wanted.contains(&cfg.kind) {
        Ok(())
    } else {
        Err(ExecutorError::InvalidConfig(format!(
            "executor kind {:?} cannot be built here (expected one of {wanted:?})",
            cfg.kind
        )))
    }
}

/// Build an in-process executor for closures.
///
/// # Errors
///
/// [`ExecutorError::InvalidConfig`] for process-pool and remote kinds, whose
/// jobs are not closures, or invalid sizes; [`ExecutorError::Spawn`] if a
/// worker cannot start.
pub fn build_local_executor(cfg: &ExecutorConfig) -> Result<LocalExecutor, ExecutorError> {
    require_kind(
        cfg,
        &[ExecutorKind::Inline, ExecutorKind::Sync, ExecutorKind::ThreadPool],
    )?;
    let executor = match cfg.kind {
        ExecutorKind::Inline => LocalExecutor::Inline(InlineExecutor::new()),
        ExecutorKind::Sync => LocalExecutor::Sync(SyncExecutor::new()),
        _ => LocalExecutor::ThreadPool(ThreadPoolExecutor::new(cfg.pool_options())?),
    };
    info!(kind = ?cfg.kind, "local executor built");
    Ok(executor)
}

/// Build a process pool whose children share leases under `processing_root`.
///
/// # Errors
///
/// [`ExecutorError::InvalidConfig`] unless `cfg.kind` is `process_pool`.
pub fn build_process_pool(
    cfg: &ExecutorConfig,
    processing_root: &Path,
) -> Result<ProcessPoolExecutor, ExecutorError> {
    require_kind(cfg, &[ExecutorKind::ProcessPool])?;
    ProcessPoolExecutor::new(
        cfg.pool_options().with_thread_name("lease-process"),
        processing_root,
    )
}

/// Build a remote executor over `client`.
///
/// # Errors
///
/// [`ExecutorError::InvalidConfig`] unless the executor kind is `remote`.
pub fn build_remote_executor(
    settings: &Settings,
    client: Arc<dyn TaskQueueClient>,
) -> Result<RemoteExecutor, ExecutorError> {
    require_kind(&settings.executor, &[ExecutorKind::Remote])?;
    let options = settings
        .remote
        .as_ref()
        .map_or_else(RemoteExecutorOptions::default, |remote| remote.options());
    Ok(RemoteExecutor::new(client, options))
}
