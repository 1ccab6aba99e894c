//! Remote task-queue clients.
//!
//! [`TaskQueueClient`] is the narrow surface the
//! [`RemoteExecutor`](crate::core::remote::RemoteExecutor) needs from a
//! broker: dispatch, on-demand state, revoke, result fetch and cleanup. The
//! executor never receives notifications; everything is pulled.

pub mod memory;

use serde_json::Value;

use crate::core::remote::{RemoteCall, RemoteState};
use crate::core::RemoteError;

pub use memory::InMemoryTaskQueue;

/// Broker-assigned task identifier.
pub type TaskId = String;

/// Stored outcome of a finished remote task: its value, or the remote
/// failure rendered as text.
pub type TaskOutcome = Result<Value, String>;

/// Client for a remote task queue.
pub trait TaskQueueClient: Send + Sync {
    /// Dispatch `call` and return its id.
    ///
    /// # Errors
    ///
    /// [`RemoteError`] if the broker cannot accept the task.
    fn send_task(&self, call: &RemoteCall) -> Result<TaskId, RemoteError>;

    /// Current state of a task, fetched from the broker.
    ///
    /// # Errors
    ///
    /// [`RemoteError`] on transport failure or unknown id.
    fn state(&self, id: &str) -> Result<RemoteState, RemoteError>;

    /// Ask the broker not to run a task. Work already started is unaffected.
    ///
    /// # Errors
    ///
    /// [`RemoteError`] on transport failure or unknown id.
    fn revoke(&self, id: &str) -> Result<(), RemoteError>;

    /// Outcome of a task in state `Success` or `Failure`.
    ///
    /// # Errors
    ///
    /// [`RemoteError`] on transport failure, unknown id, or if the task has
    /// not finished.
    fn fetch_result(&self, id: &str) -> Result<TaskOutcome, RemoteError>;

    /// Discard whatever the broker stores for a task. Best effort.
    fn forget(&self, id: &str);
}
