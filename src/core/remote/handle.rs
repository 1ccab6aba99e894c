//! Local view of one remote task.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::RemoteState;
use crate::core::future::CancelHook;
use crate::core::RemoteError;
use crate::infra::remote::{TaskId, TaskOutcome, TaskQueueClient};

/// Opaque reference to a dispatched task, with its last known state.
///
/// The state is only refreshed on demand. Dropping the handle tells the
/// broker to forget the task's stored result.
pub struct RemoteHandle {
    id: TaskId,
    client: Arc<dyn TaskQueueClient>,
    state: Mutex<RemoteState>,
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl RemoteHandle {
    /// Handle for task `id`, initially `Pending`.
    pub fn new(id: TaskId, client: Arc<dyn TaskQueueClient>) -> Self {
        Self {
            id,
            client,
            state: Mutex::new(RemoteState::Pending),
        }
    }

    /// Broker task id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Last state seen, without asking the broker.
    #[must_use]
    pub fn state(&self) -> RemoteState {
        self.state.lock().clone()
    }

    /// Ask the broker for the current state and remember it.
    ///
    /// # Errors
    ///
    /// [`RemoteError`] from the client; the cached state is left unchanged.
    pub fn refresh(&self) -> Result<RemoteState, RemoteError> {
        let fresh = self.client.state(&self.id)?;
        let mut state = self.state.lock();
        if *state != fresh {
            debug!(task_id = %self.id, from = %*state, to = %fresh, "remote state changed");
            state.clone_from(&fresh);
        }
        Ok(fresh)
    }

    /// Ask the broker not to run the task.
    ///
    /// # Errors
    ///
    /// [`RemoteError`] from the client.
    pub fn revoke(&self) -> Result<(), RemoteError> {
        self.client.revoke(&self.id)
    }

    /// Fetch the outcome of a finished task.
    ///
    /// # Errors
    ///
    /// [`RemoteError`] from the client.
    pub fn fetch_result(&self) -> Result<TaskOutcome, RemoteError> {
        self.client.fetch_result(&self.id)
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        self.client.forget(&self.id);
    }
}

/// Cancel hook of a remote future: revoke the task unless it is committed.
#[derive(Debug)]
pub struct RemoteCancel {
    handle: Arc<RemoteHandle>,
}

impl RemoteCancel {
    /// Hook bound to `handle`.
    #[must_use]
    pub const fn new(handle: Arc<RemoteHandle>) -> Self {
        Self { handle }
    }

    fn revoke(&self) -> Result<bool, RemoteError> {
        if self.handle.refresh()?.is_committed() {
            return Ok(false);
        }
        // A worker may start the task right here; the refresh below then
        // reports it as committed and the cancel fails.
        self.handle.revoke()?;
        Ok(self.handle.refresh()? == RemoteState::Revoked)
    }
}

impl CancelHook for RemoteCancel {
    fn try_cancel(&self) -> bool {
        match self.revoke() {
            Ok(revoked) => {
                debug!(task_id = %self.handle.id(), revoked, "remote cancel attempted");
                revoked
            }
            Err(e) => {
                warn!(task_id = %self.handle.id(), error = %e, "remote cancel failed");
                false
            }
        }
    }
}
