//! Integration tests for the remote executor
//!
//! A scripted broker drives the state bridge one manual tick at a time; the
//! in-memory broker covers the background monitor end to end.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde_json::{json, Value};

use prometheus_lease_executor::core::{
    Executor, ExecutorError, FutureError, FutureState, MonitorMode, RemoteCall, RemoteError,
    RemoteExecutor, RemoteExecutorOptions, RemoteState, Submit,
};
use prometheus_lease_executor::infra::remote::{TaskId, TaskOutcome};
use prometheus_lease_executor::infra::{InMemoryTaskQueue, TaskQueueClient};

// ============================================================================
// SCRIPTED BROKER
// ============================================================================

#[derive(Default)]
struct Script {
    /// Answers for successive `state()` calls; the last one sticks.
    states: VecDeque<Result<RemoteState, RemoteError>>,
    current: Option<RemoteState>,
    outcome: Option<TaskOutcome>,
    /// Whether `revoke()` takes effect, as opposed to losing the race
    /// against a fleet worker.
    revocable: bool,
    revokes: usize,
    forgotten: Vec<TaskId>,
    fail_send: bool,
    sent: usize,
}

#[derive(Default)]
struct ScriptedClient {
    script: Mutex<Script>,
}

impl ScriptedClient {
    fn with_states(states: impl IntoIterator<Item = RemoteState>) -> Arc<Self> {
        let client = Self::default();
        client.script.lock().states = states.into_iter().map(Ok).collect();
        Arc::new(client)
    }

    fn set_outcome(&self, outcome: TaskOutcome) {
        self.script.lock().outcome = Some(outcome);
    }
}

impl TaskQueueClient for ScriptedClient {
    fn send_task(&self, _call: &RemoteCall) -> Result<TaskId, RemoteError> {
        let mut script = self.script.lock();
        if script.fail_send {
            return Err(RemoteError::Transport("broker unreachable".into()));
        }
        let id = format!("task-{}", script.sent);
        script.sent += 1;
        Ok(id)
    }

    fn state(&self, _id: &str) -> Result<RemoteState, RemoteError> {
        let mut script = self.script.lock();
        match script.states.pop_front() {
            Some(Ok(state)) => {
                script.current = Some(state.clone());
                Ok(state)
            }
            Some(Err(e)) => Err(e),
            None => Ok(script.current.clone().unwrap_or(RemoteState::Pending)),
        }
    }

    fn revoke(&self, _id: &str) -> Result<(), RemoteError> {
        let mut script = self.script.lock();
        script.revokes += 1;
        let current = script.current.clone().unwrap_or(RemoteState::Pending);
        if !current.is_committed() {
            script.current = Some(if script.revocable {
                RemoteState::Revoked
            } else {
                RemoteState::Running
            });
        }
        Ok(())
    }

    fn fetch_result(&self, id: &str) -> Result<TaskOutcome, RemoteError> {
        self.script
            .lock()
            .outcome
            .clone()
            .ok_or_else(|| RemoteError::Transport(format!("no result for {id}")))
    }

    fn forget(&self, id: &str) {
        self.script.lock().forgotten.push(id.to_string());
    }
}

fn manual(client: &Arc<ScriptedClient>) -> RemoteExecutor {
    RemoteExecutor::new(
        Arc::clone(client) as Arc<dyn TaskQueueClient>,
        RemoteExecutorOptions::default().with_monitor(MonitorMode::Manual),
    )
}

// ============================================================================
// STATE BRIDGE
// ============================================================================

#[test]
fn test_future_follows_remote_progress() {
    let client = ScriptedClient::with_states([
        RemoteState::Pending,
        RemoteState::Running,
        RemoteState::Success,
    ]);
    client.set_outcome(Ok(json!(42)));
    let executor = manual(&client);

    let future = executor.submit(RemoteCall::new("answer")).unwrap();
    assert_eq!(future.state(), FutureState::Pending);

    assert_eq!(executor.poll(), 1);
    assert_eq!(future.state(), FutureState::Pending);
    assert_eq!(executor.poll(), 1);
    assert_eq!(future.state(), FutureState::Running);
    assert_eq!(executor.poll(), 0);
    assert_eq!(future.state(), FutureState::Finished);
    assert_eq!(future.result().unwrap(), json!(42));

    // Finished stays finished.
    assert!(!future.cancel());
    assert_eq!(future.result().unwrap(), json!(42));
    assert_eq!(client.script.lock().revokes, 0);
}

#[test]
fn test_done_callback_may_poll_executor() {
    let client = ScriptedClient::with_states([RemoteState::Success]);
    client.set_outcome(Ok(json!("ok")));
    let executor = Arc::new(manual(&client));
    let (tx, rx) = mpsc::channel();

    let future = executor.submit(RemoteCall::new("answer")).unwrap();
    let inner = Arc::clone(&executor);
    future.add_done_callback(move |_| {
        tx.send(inner.poll()).ok();
    });

    assert_eq!(executor.poll(), 0);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    assert_eq!(future.result().unwrap(), json!("ok"));
}

#[test]
fn test_started_does_not_move_future() {
    let client = ScriptedClient::with_states([RemoteState::Received, RemoteState::Started]);
    let executor = manual(&client);
    let future = executor.submit(RemoteCall::new("slow")).unwrap();

    executor.poll();
    executor.poll();
    assert_eq!(future.state(), FutureState::Pending);
    assert_eq!(executor.tracked(), 1);
}

#[test]
fn test_failure_surfaces_remote_message() {
    let client = ScriptedClient::with_states([RemoteState::Failure]);
    client.set_outcome(Err("ZeroDivisionError: division by zero".into()));
    let executor = manual(&client);

    let future = executor.submit(RemoteCall::new("divide").arg(1).arg(0)).unwrap();
    assert_eq!(executor.poll(), 0);
    let err = future.result().unwrap_err();
    assert!(matches!(err, FutureError::Failed(_)));
    assert!(err.to_string().contains("division by zero"), "{err}");
}

#[test]
fn test_refresh_error_is_retried_next_tick() {
    let client = ScriptedClient::default();
    {
        let mut script = client.script.lock();
        script.states = VecDeque::from([
            Err(RemoteError::Transport("connection reset".into())),
            Ok(RemoteState::Success),
        ]);
        script.outcome = Some(Ok(json!("ok")));
    }
    let client = Arc::new(client);
    let executor = manual(&client);

    let future = executor.submit(RemoteCall::new("job")).unwrap();
    assert_eq!(executor.poll(), 1);
    assert_eq!(future.state(), FutureState::Pending);
    assert_eq!(executor.poll(), 0);
    assert_eq!(future.result().unwrap(), json!("ok"));
}

#[test]
fn test_remote_revoke_cancels_future() {
    let client = ScriptedClient::with_states([RemoteState::Revoked]);
    let executor = manual(&client);

    let future = executor.submit(RemoteCall::new("job")).unwrap();
    assert_eq!(executor.poll(), 0);
    assert_eq!(future.state(), FutureState::CancelledAndNotified);
    assert!(matches!(future.result(), Err(FutureError::Cancelled)));
}

#[test]
fn test_revoke_after_start_cancels_running_future() {
    let client = ScriptedClient::with_states([RemoteState::Running, RemoteState::Revoked]);
    let executor = manual(&client);

    let future = executor.submit(RemoteCall::new("job")).unwrap();
    executor.poll();
    assert!(future.running());
    executor.poll();
    assert_eq!(future.state(), FutureState::CancelledAndNotified);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn test_cancel_pending_revokes_task() {
    let client = Arc::new(ScriptedClient::default());
    client.script.lock().revocable = true;
    let executor = manual(&client);

    let future = executor.submit(RemoteCall::new("job")).unwrap();
    assert!(future.cancel());
    assert_eq!(future.state(), FutureState::Cancelled);
    assert_eq!(client.script.lock().revokes, 1);

    assert_eq!(executor.poll(), 0);
    assert_eq!(future.state(), FutureState::CancelledAndNotified);
    assert!(matches!(future.result(), Err(FutureError::Cancelled)));
}

#[test]
fn test_cancel_refused_when_task_already_committed() {
    let client = ScriptedClient::with_states([RemoteState::Success]);
    client.set_outcome(Ok(json!(1)));
    let executor = manual(&client);

    let future = executor.submit(RemoteCall::new("job")).unwrap();
    assert!(!future.cancel());
    assert_eq!(future.state(), FutureState::Pending);
    assert_eq!(client.script.lock().revokes, 0);

    assert_eq!(executor.poll(), 0);
    assert_eq!(future.result().unwrap(), json!(1));
}

#[test]
fn test_cancel_losing_race_to_worker() {
    let client = Arc::new(ScriptedClient::default());
    let executor = manual(&client);

    let future = executor.submit(RemoteCall::new("job")).unwrap();
    // The revoke lands after a fleet worker picked the task up.
    assert!(!future.cancel());
    assert_eq!(client.script.lock().revokes, 1);
    assert_eq!(future.state(), FutureState::Pending);

    executor.poll();
    assert_eq!(future.state(), FutureState::Running);
}

// ============================================================================
// DISPATCH AND CLEANUP
// ============================================================================

#[test]
fn test_send_failure_is_transport_error() {
    let client = Arc::new(ScriptedClient::default());
    client.script.lock().fail_send = true;
    let executor = manual(&client);

    let err = executor.submit(RemoteCall::new("job")).unwrap_err();
    assert!(matches!(err, ExecutorError::Transport(RemoteError::Transport(_))));
    assert_eq!(executor.tracked(), 0);
}

#[test]
fn test_dropping_settled_future_forgets_task() {
    let client = ScriptedClient::with_states([RemoteState::Success]);
    client.set_outcome(Ok(Value::Null));
    let executor = manual(&client);

    let future = executor.submit(RemoteCall::new("job")).unwrap();
    assert_eq!(executor.poll(), 0);
    assert!(client.script.lock().forgotten.is_empty());

    drop(future);
    assert_eq!(client.script.lock().forgotten, vec!["task-0".to_string()]);
}

#[test]
fn test_manual_shutdown_waits_for_tracked_tasks() {
    let client = ScriptedClient::with_states([RemoteState::Running, RemoteState::Success]);
    client.set_outcome(Ok(json!("late")));
    let executor = RemoteExecutor::new(
        Arc::clone(&client) as Arc<dyn TaskQueueClient>,
        RemoteExecutorOptions::default()
            .with_monitor(MonitorMode::Manual)
            .with_update_delay(Duration::from_millis(1)),
    );

    let future = executor.submit(RemoteCall::new("job")).unwrap();
    executor.poll();
    assert!(future.running());

    executor.shutdown(true).unwrap();
    assert_eq!(executor.tracked(), 0);
    assert_eq!(future.result().unwrap(), json!("late"));
    assert!(matches!(
        executor.submit(RemoteCall::new("job")),
        Err(ExecutorError::Shutdown)
    ));
    assert!(matches!(executor.shutdown(true), Err(ExecutorError::Shutdown)));
}

// ============================================================================
// IN-MEMORY BROKER, BACKGROUND MONITOR
// ============================================================================

fn background(queue: &Arc<InMemoryTaskQueue>) -> RemoteExecutor {
    RemoteExecutor::new(
        Arc::clone(queue) as Arc<dyn TaskQueueClient>,
        RemoteExecutorOptions::default().with_update_delay(Duration::from_millis(10)),
    )
}

#[test]
fn test_in_memory_round_trip() {
    let queue = Arc::new(InMemoryTaskQueue::new(2).unwrap());
    queue.register_task("add", |args, _| {
        let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
        Ok(Value::from(sum))
    });
    queue.register_task("greet", |_, kwargs| {
        let name = kwargs.get("name").and_then(Value::as_str).unwrap_or("nobody");
        Ok(Value::from(format!("hello {name}")))
    });
    queue.register_task("boom", |_, _| anyhow::bail!("exploded"));
    let executor = background(&queue);

    let sum = executor.submit(RemoteCall::new("add").arg(2).arg(3)).unwrap();
    let greeting = executor
        .submit(RemoteCall::new("greet").kwarg("name", "ada"))
        .unwrap();
    let boom = executor.submit(RemoteCall::new("boom")).unwrap();

    let timeout = Duration::from_secs(5);
    assert_eq!(sum.result_timeout(timeout).unwrap(), json!(5));
    assert_eq!(greeting.result_timeout(timeout).unwrap(), json!("hello ada"));
    let err = boom.result_timeout(timeout).unwrap_err();
    assert!(err.to_string().contains("exploded"), "{err}");

    assert!(matches!(
        executor.submit(RemoteCall::new("missing")),
        Err(ExecutorError::Transport(RemoteError::UnknownFunction(_)))
    ));

    executor.shutdown(true).unwrap();
    assert_eq!(executor.tracked(), 0);
    drop((sum, greeting, boom));
    assert_eq!(queue.stored(), 0);
    queue.shutdown();
}

#[test]
fn test_shutdown_cancels_queued_remote_work() {
    let queue = Arc::new(InMemoryTaskQueue::new(1).unwrap());
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    {
        let gate = Arc::clone(&gate);
        queue.register_task("block", move |_, _| {
            started_tx.lock().send(()).ok();
            let (open, opened) = &*gate;
            let mut open = open.lock();
            while !*open {
                opened.wait(&mut open);
            }
            Ok(Value::from("released"))
        });
    }
    let executor = background(&queue);

    let running = executor.submit(RemoteCall::new("block")).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let queued = executor.submit(RemoteCall::new("block")).unwrap();

    executor.shutdown(false).unwrap();
    assert!(executor.is_shutdown());
    assert!(queued.cancelled());
    assert!(!running.cancelled());
    assert!(matches!(
        executor.submit(RemoteCall::new("block")),
        Err(ExecutorError::Shutdown)
    ));
    assert!(matches!(executor.shutdown(false), Err(ExecutorError::Shutdown)));

    {
        let (open, opened) = &*gate;
        *open.lock() = true;
        opened.notify_all();
    }
    assert_eq!(
        running.result_timeout(Duration::from_secs(5)).unwrap(),
        json!("released")
    );
    assert!(queued.wait(Some(Duration::from_secs(5))));
    assert!(matches!(queued.result(), Err(FutureError::Cancelled)));
    queue.shutdown();
}


#[test]
fn test_blocking_shutdown_acknowledges_cancelled_work() {
    let queue = Arc::new(InMemoryTaskQueue::new(1).unwrap());
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    {
        let gate = Arc::clone(&gate);
        queue.register_task("block", move |_, _| {
            started_tx.lock().send(()).ok();
            let (open, opened) = &*gate;
            let mut open = open.lock();
            while !*open {
                opened.wait(&mut open);
            }
            Ok(Value::Null)
        });
    }
    queue.register_task("noop", |_, _| Ok(Value::Null));

    // Occupy the only fleet worker outside the executor.
    queue.send_task(&RemoteCall::new("block")).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let executor = background(&queue);
    let queued = executor.submit(RemoteCall::new("noop")).unwrap();
    executor.shutdown(true).unwrap();

    assert_eq!(queued.state(), FutureState::CancelledAndNotified);
    assert_eq!(executor.tracked(), 0);

    {
        let (open, opened) = &*gate;
        *open.lock() = true;
        opened.notify_all();
    }
    queue.shutdown();
}
