//! Executor for work dispatched to a remote task queue.
//!
//! The broker never pushes anything back. A monitor re-reads the state of
//! every outstanding task each `update_delay` and translates it into
//! [`TaskFuture`] transitions, so a future's state may lag the remote state by
//! up to one tick plus the time the tick itself takes.
//!
//! ```text
//! remote state        future transition
//! ------------        -----------------
//! REVOKED          →  CancelledAndNotified
//! RUNNING, RETRY   →  Running
//! SUCCESS          →  Finished (result)
//! FAILURE          →  Finished (failure)
//! anything else    →  none
//! ```
//!
//! Cancelling a pending remote future asks the broker to revoke the task and
//! only succeeds once the broker reports it revoked. A fleet worker may pick
//! the task up between the state check and the revoke request; the cancel
//! then reports `false` and the task runs.

mod handle;
mod monitor;

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::core::executor::{ConcurrencyModel, Executor, Submit};
use crate::core::future::{wait_all, TaskFuture};
use crate::core::ExecutorError;
use crate::infra::remote::TaskQueueClient;

pub use handle::{RemoteCancel, RemoteHandle};

/// Default interval between monitor ticks.
pub const DEFAULT_UPDATE_DELAY: Duration = Duration::from_millis(100);

/// State of a task as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RemoteState {
    /// Unknown to workers yet, or queued.
    Pending,
    /// Delivered to a worker.
    Received,
    /// A worker began executing it.
    Started,
    /// Executing.
    Running,
    /// Failed and scheduled for another attempt.
    Retry,
    /// Finished with a result.
    Success,
    /// Finished with an error.
    Failure,
    /// Withdrawn before running.
    Revoked,
    /// Any state the bridge does not act on.
    Other(String),
}

impl RemoteState {
    /// Whether the task was picked up or finished, so revoking it is moot.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(
            self,
            Self::Started | Self::Running | Self::Retry | Self::Success | Self::Failure
        )
    }

    /// Whether the broker will not change this state again.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }

    /// Broker spelling of the state.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Received => "RECEIVED",
            Self::Started => "STARTED",
            Self::Running => "RUNNING",
            Self::Retry => "RETRY",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Revoked => "REVOKED",
            Self::Other(other) => other,
        }
    }
}

impl From<&str> for RemoteState {
    fn from(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "PENDING" => Self::Pending,
            "RECEIVED" => Self::Received,
            "STARTED" => Self::Started,
            "RUNNING" => Self::Running,
            "RETRY" => Self::Retry,
            "SUCCESS" => Self::Success,
            "FAILURE" => Self::Failure,
            "REVOKED" => Self::Revoked,
            _ => Self::Other(raw.to_string()),
        }
    }
}

impl From<String> for RemoteState {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<RemoteState> for String {
    fn from(state: RemoteState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named remote function and its arguments.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteCall {
    /// Registered function name.
    pub task: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl RemoteCall {
    /// A call to `task` with no arguments.
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Who drives monitor ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    /// A background thread ticks every `update_delay`, started on first submit.
    #[default]
    Background,
    /// The caller ticks with [`RemoteExecutor::poll`].
    Manual,
}

/// Construction parameters of a [`RemoteExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteExecutorOptions {
    /// Interval between monitor ticks.
    pub update_delay: Duration,
    /// Who drives the monitor.
    pub monitor: MonitorMode,
}

impl Default for RemoteExecutorOptions {
    fn default() -> Self {
        Self {
            update_delay: DEFAULT_UPDATE_DELAY,
            monitor: MonitorMode::Background,
        }
    }
}

impl RemoteExecutorOptions {
    /// Set the tick interval.
    #[must_use]
    pub const fn with_update_delay(mut self, update_delay: Duration) -> Self {
        self.update_delay = update_delay;
        self
    }

    /// Set the monitor mode.
    #[must_use]
    pub const fn with_monitor(mut self, monitor: MonitorMode) -> Self {
        self.monitor = monitor;
        self
    }
}

/// A future and the remote task it mirrors.
struct Tracked {
    future: TaskFuture<Value>,
    handle: Arc<RemoteHandle>,
}

#[derive(Default)]
struct State {
    closed: bool,
    stop: bool,
    tracked: Vec<Tracked>,
}

struct Shared {
    client: Arc<dyn TaskQueueClient>,
    options: RemoteExecutorOptions,
    /// Shutdown lock; also guards the tracked set.
    state: Mutex<State>,
    /// Wakes the monitor early on shutdown.
    wake: Condvar,
    /// Serializes ticks.
    tick: Mutex<()>,
}

/// Executor dispatching [`RemoteCall`]s to a [`TaskQueueClient`].
pub struct RemoteExecutor {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("options", &self.shared.options)
            .field("tracked", &self.tracked())
            .field("closed", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl RemoteExecutor {
    /// An executor dispatching through `client`.
    pub fn new(client: Arc<dyn TaskQueueClient>, options: RemoteExecutorOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                options,
                state: Mutex::new(State::default()),
                wake: Condvar::new(),
                tick: Mutex::new(()),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Options in effect.
    #[must_use]
    pub fn options(&self) -> &RemoteExecutorOptions {
        &self.shared.options
    }

    /// Number of futures still being monitored.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.shared.state.lock().tracked.len()
    }

    /// Run one monitor tick now. Returns the number of futures still tracked.
    pub fn poll(&self) -> usize {
        self.shared.poll()
    }

    fn ensure_monitor(&self) -> Result<(), ExecutorError> {
        if self.shared.options.monitor != MonitorMode::Background {
            return Ok(());
        }
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("remote-monitor".to_string())
            .spawn(move || shared.run_monitor())
            .map_err(|e| ExecutorError::Spawn(e.to_string()))?;
        *monitor = Some(handle);
        debug!(update_delay_ms = self.shared.options.update_delay.as_millis(), "remote monitor started");
        Ok(())
    }

    fn stop_monitor(&self) {
        self.shared.state.lock().stop = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.monitor.lock().take() {
            if handle.join().is_err() {
                warn!("remote monitor panicked");
            }
        }
    }
}

impl Executor for RemoteExecutor {
    fn concurrency(&self) -> ConcurrencyModel {
        ConcurrencyModel::Remote
    }

    fn is_shutdown(&self) -> bool {
        self.shared.state.lock().closed
    }

    fn shutdown(&self, wait: bool) -> Result<(), ExecutorError> {
        let outstanding: Vec<TaskFuture<Value>> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ExecutorError::Shutdown);
            }
            state.closed = true;
            state.tracked.iter().map(|t| t.future.clone()).collect()
        };
        info!(outstanding = outstanding.len(), wait, "shutting down remote executor");

        for future in &outstanding {
            future.cancel();
        }
        self.shared.wake.notify_all();

        if wait {
            match self.shared.options.monitor {
                MonitorMode::Background => {
                    wait_all(&outstanding, None);
                    self.stop_monitor();
                    // Futures cancelled above are done but not yet
                    // acknowledged; the stopped monitor will not get to them.
                    self.poll();
                }
                MonitorMode::Manual => {
                    while self.poll() > 0 {
                        thread::sleep(self.shared.options.update_delay);
                    }
                }
            }
            info!("remote executor shut down");
        }
        Ok(())
    }
}

impl Submit<RemoteCall> for RemoteExecutor {
    type Output = Value;

    fn submit(&self, call: RemoteCall) -> Result<TaskFuture<Value>, ExecutorError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(ExecutorError::Shutdown);
        }
        self.ensure_monitor()?;

        let id = self.shared.client.send_task(&call)?;
        let handle = Arc::new(RemoteHandle::new(id, Arc::clone(&self.shared.client)));
        let future = TaskFuture::with_cancel_hook(Box::new(RemoteCancel::new(Arc::clone(&handle))));
        debug!(task_id = %handle.id(), task = %call.task, future_id = future.id(), "remote task submitted");

        state.tracked.push(Tracked {
            future: future.clone(),
            handle,
        });
        Ok(future)
    }
}

impl Drop for RemoteExecutor {
    fn drop(&mut self) {
        // Let the monitor exit without joining it.
        let mut state = self.shared.state.lock();
        if !state.stop {
            state.stop = true;
            if !state.tracked.is_empty() {
                debug!(tracked = state.tracked.len(), "remote executor dropped with tracked futures");
            }
        }
        drop(state);
        self.shared.wake.notify_all();
    }
}
