//! Child-process executor.
//!
//! Jobs are command lines. Each accepted [`ProcessJob`] is started as a child
//! process by one of `max_workers` supervising threads, so at most that many
//! children run at once. Children inherit the parent's lease directory through
//! [`OWNER_PID_ENV`] and [`PROCESSING_ROOT_ENV`]; a child builds its leases
//! with [`LeaseOptions::from_env`](crate::core::LeaseOptions::from_env) and
//! competes for the same lock files as its siblings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::thread_pool::{PoolOptions, ThreadPoolExecutor};
use super::{ConcurrencyModel, Executor, Job, Submit};
use crate::core::future::TaskFuture;
use crate::core::lease::{OWNER_PID_ENV, PROCESSING_ROOT_ENV};
use crate::core::ExecutorError;
use crate::util::current_pid;

/// A command to run in a child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessJob {
    /// Program to execute, looked up on `PATH` if not a path.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory; inherited if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_dir: Option<PathBuf>,
}

impl ProcessJob {
    /// A job running `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Captured result of a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit status.
    pub status: ExitStatus,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl Job for ProcessJob {
    type Output = ProcessOutput;

    /// Run the command to completion, capturing its output.
    ///
    /// A non-zero exit is an error carrying the child's stderr.
    fn run(self) -> anyhow::Result<ProcessOutput> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .with_context(|| format!("failed to start `{}`", self.program))?;
        let result = ProcessOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.status.success() {
            anyhow::bail!(
                "`{}` exited with {}: {}",
                self.program,
                result.status,
                result.stderr.trim()
            );
        }
        Ok(result)
    }
}

/// Executor running [`ProcessJob`]s as child processes.
#[derive(Debug)]
pub struct ProcessPoolExecutor {
    supervisors: ThreadPoolExecutor,
    processing_root: PathBuf,
    owner_pid: u32,
}

impl ProcessPoolExecutor {
    /// Start a pool whose children share leases rooted at `processing_root`.
    ///
    /// # Errors
    ///
    /// As [`ThreadPoolExecutor::new`].
    pub fn new(options: PoolOptions, processing_root: impl Into<PathBuf>) -> Result<Self, ExecutorError> {
        let supervisors = ThreadPoolExecutor::new(options)?;
        Ok(Self {
            supervisors,
            processing_root: processing_root.into(),
            owner_pid: current_pid(),
        })
    }

    /// Root of the lease directory children are pointed at.
    #[must_use]
    pub fn processing_root(&self) -> &Path {
        &self.processing_root
    }

    /// Pid children use to locate the shared lock directory.
    #[must_use]
    pub const fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Add the lease-sharing variables to a job's environment.
    fn prepare(&self, job: ProcessJob) -> ProcessJob {
        job.env(OWNER_PID_ENV, self.owner_pid.to_string())
            .env(PROCESSING_ROOT_ENV, self.processing_root.to_string_lossy())
    }
}

impl Executor for ProcessPoolExecutor {
    fn concurrency(&self) -> ConcurrencyModel {
        ConcurrencyModel::Processes
    }

    fn is_shutdown(&self) -> bool {
        self.supervisors.is_shutdown()
    }

    fn shutdown(&self, wait: bool) -> Result<(), ExecutorError> {
        self.supervisors.shutdown(wait)
    }
}

impl Submit<ProcessJob> for ProcessPoolExecutor {
    type Output = ProcessOutput;

    fn submit(&self, job: ProcessJob) -> Result<TaskFuture<ProcessOutput>, ExecutorError> {
        let job = self.prepare(job);
        debug!(program = %job.program, "submitting child process");
        self.supervisors.submit(job)
    }
}
