//! In-process task broker with its own worker fleet.
//!
//! Useful for development and tests: it behaves like a remote queue (tasks are
//! named functions, state is pulled, results are stored until forgotten) but
//! runs everything on local threads.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{TaskId, TaskOutcome, TaskQueueClient};
use crate::core::executor::panic_message;
use crate::core::remote::{RemoteCall, RemoteState};
use crate::core::RemoteError;

/// A registered remote function.
pub type TaskFn = Arc<dyn Fn(&[Value], &Map<String, Value>) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Debug)]
struct TaskRecord {
    call: RemoteCall,
    state: RemoteState,
    outcome: Option<TaskOutcome>,
}

#[derive(Default)]
struct Broker {
    functions: RwLock<HashMap<String, TaskFn>>,
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
}

/// In-memory [`TaskQueueClient`] backed by a local worker fleet.
pub struct InMemoryTaskQueue {
    broker: Arc<Broker>,
    queue_tx: Mutex<Option<Sender<TaskId>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for InMemoryTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTaskQueue")
            .field("tasks", &self.broker.tasks.lock().len())
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl InMemoryTaskQueue {
    /// Start a broker with `workers` fleet threads.
    ///
    /// # Errors
    ///
    /// [`RemoteError::Transport`] if a fleet thread cannot be started.
    pub fn new(workers: usize) -> Result<Self, RemoteError> {
        let broker = Arc::new(Broker::default());
        let (queue_tx, queue_rx) = unbounded::<TaskId>();

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let broker = Arc::clone(&broker);
            let queue_rx = queue_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("memory-broker-{worker_id}"))
                .spawn(move || fleet_worker(worker_id, &broker, &queue_rx))
                .map_err(|e| RemoteError::Transport(format!("cannot start broker worker: {e}")))?;
            handles.push(handle);
        }
        info!(workers, "in-memory task queue started");

        Ok(Self {
            broker,
            queue_tx: Mutex::new(Some(queue_tx)),
            workers: Mutex::new(handles),
        })
    }

    /// Make `f` callable remotely as `name`, replacing any previous function.
    pub fn register_task<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value], &Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.broker.functions.write().insert(name.into(), Arc::new(f));
    }

    /// Number of tasks whose records are still stored.
    #[must_use]
    pub fn stored(&self) -> usize {
        self.broker.tasks.lock().len()
    }

    /// Stop accepting tasks and join the fleet once queued tasks are done.
    pub fn shutdown(&self) {
        self.queue_tx.lock().take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("broker worker panicked");
            }
        }
    }
}

impl Drop for InMemoryTaskQueue {
    fn drop(&mut self) {
        self.queue_tx.lock().take();
    }
}

impl TaskQueueClient for InMemoryTaskQueue {
    fn send_task(&self, call: &RemoteCall) -> Result<TaskId, RemoteError> {
        if !self.broker.functions.read().contains_key(&call.task) {
            return Err(RemoteError::UnknownFunction(call.task.clone()));
        }
        let queue_tx = self.queue_tx.lock();
        let Some(sender) = queue_tx.as_ref() else {
            return Err(RemoteError::Transport("broker is shut down".into()));
        };

        let id = uuid::Uuid::new_v4().to_string();
        self.broker.tasks.lock().insert(
            id.clone(),
            TaskRecord {
                call: call.clone(),
                state: RemoteState::Pending,
                outcome: None,
            },
        );
        if sender.send(id.clone()).is_err() {
            self.broker.tasks.lock().remove(&id);
            return Err(RemoteError::Transport("broker is shut down".into()));
        }
        debug!(task_id = %id, task = %call.task, "task queued");
        Ok(id)
    }

    fn state(&self, id: &str) -> Result<RemoteState, RemoteError> {
        self.broker
            .tasks
            .lock()
            .get(id)
            .map(|record| record.state.clone())
            .ok_or_else(|| RemoteError::UnknownTask(id.to_string()))
    }

    fn revoke(&self, id: &str) -> Result<(), RemoteError> {
        let mut tasks = self.broker.tasks.lock();
        let record = tasks
            .get_mut(id)
            .ok_or_else(|| RemoteError::UnknownTask(id.to_string()))?;
        if record.state == RemoteState::Pending {
            record.state = RemoteState::Revoked;
            debug!(task_id = %id, "task revoked");
        }
        Ok(())
    }

    fn fetch_result(&self, id: &str) -> Result<TaskOutcome, RemoteError> {
        let tasks = self.broker.tasks.lock();
        let record = tasks
            .get(id)
            .ok_or_else(|| RemoteError::UnknownTask(id.to_string()))?;
        record.outcome.clone().ok_or_else(|| {
            RemoteError::Transport(format!("task `{id}` has no result in state {}", record.state))
        })
    }

    fn forget(&self, id: &str) {
        self.broker.tasks.lock().remove(id);
    }
}

fn fleet_worker(worker_id: usize, broker: &Broker, queue_rx: &Receiver<TaskId>) {
    while let Ok(id) = queue_rx.recv() {
        let call = {
            let mut tasks = broker.tasks.lock();
            let Some(record) = tasks.get_mut(&id) else {
                continue;
            };
            if record.state != RemoteState::Pending {
                debug!(worker_id, task_id = %id, state = %record.state, "skipping task");
                continue;
            }
            record.state = RemoteState::Started;
            record.call.clone()
        };

        let function = broker.functions.read().get(&call.task).cloned();
        let outcome = match function {
            Some(function) => {
                match catch_unwind(AssertUnwindSafe(|| function(&call.args, &call.kwargs))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(format!("{e:#}")),
                    Err(payload) => Err(format!("task panicked: {}", panic_message(payload.as_ref()))),
                }
            }
            None => Err(format!("unknown remote function `{}`", call.task)),
        };

        let mut tasks = broker.tasks.lock();
        if let Some(record) = tasks.get_mut(&id) {
            record.state = if outcome.is_ok() {
                RemoteState::Success
            } else {
                RemoteState::Failure
            };
            record.outcome = Some(outcome);
            debug!(worker_id, task_id = %id, state = %record.state, "task finished");
        }
    }
}
