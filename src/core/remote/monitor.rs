//! Poll loop reconciling futures with remote task state.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::{RemoteHandle, RemoteState, Shared, Tracked};
use crate::core::future::{FutureState, TaskFuture};
use crate::infra::remote::TaskOutcome;

impl Shared {
    /// One tick over every tracked pair. Returns how many remain tracked.
    ///
    /// Broker queries run under the tick lock; future transitions, and so
    /// done callbacks, run after it is released, which lets a callback poll.
    pub(super) fn poll(&self) -> usize {
        let steps: Vec<(TaskFuture<Value>, Step)> = {
            let _tick = self.tick.lock();

            // Snapshot so broker calls happen without the shutdown lock held.
            let snapshot: Vec<(TaskFuture<Value>, Arc<RemoteHandle>)> = self
                .state
                .lock()
                .tracked
                .iter()
                .map(|t| (t.future.clone(), Arc::clone(&t.handle)))
                .collect();

            snapshot
                .into_iter()
                .map(|(future, handle)| {
                    let step = reconcile(&future, &handle);
                    (future, step)
                })
                .collect()
        };

        let settled: Vec<u64> = steps
            .into_iter()
            .filter(|(future, step)| apply(future, step))
            .map(|(future, _)| future.id())
            .collect();

        let mut state = self.state.lock();
        if !settled.is_empty() {
            state
                .tracked
                .retain(|t: &Tracked| !settled.contains(&t.future.id()));
        }
        state.tracked.len()
    }

    /// Background loop: tick every `update_delay` until stopped, or until the
    /// executor is closed and nothing is left to track.
    pub(super) fn run_monitor(&self) {
        debug!("remote monitor running");
        let mut state = self.state.lock();
        loop {
            if state.stop {
                break;
            }
            self.wake.wait_for(&mut state, self.options.update_delay);
            if state.stop {
                break;
            }
            drop(state);
            self.poll();
            state = self.state.lock();
            if state.closed && state.tracked.is_empty() {
                break;
            }
        }
        debug!("remote monitor exiting");
    }
}

/// What a tick decided for one tracked future.
#[derive(Debug)]
enum Step {
    Keep,
    Untrack,
    Abandon,
    Start,
    Settle(TaskOutcome),
}

/// Compare `future` with its remote task. Only queries the broker.
fn reconcile(future: &TaskFuture<Value>, handle: &RemoteHandle) -> Step {
    match future.state() {
        FutureState::Finished | FutureState::CancelledAndNotified => return Step::Untrack,
        // Cancelled through the hook, so the broker already revoked it.
        FutureState::Cancelled => return Step::Abandon,
        FutureState::Pending | FutureState::Running => {}
    }

    let remote = match handle.refresh() {
        Ok(remote) => remote,
        Err(e) => {
            warn!(task_id = %handle.id(), error = %e, "failed to refresh remote state, retrying next tick");
            return Step::Keep;
        }
    };

    match remote {
        RemoteState::Revoked => {
            debug!(task_id = %handle.id(), future_id = future.id(), "remote task revoked");
            Step::Abandon
        }
        RemoteState::Running | RemoteState::Retry => Step::Start,
        RemoteState::Success | RemoteState::Failure => match handle.fetch_result() {
            Ok(outcome) => {
                debug!(task_id = %handle.id(), future_id = future.id(), "remote outcome fetched");
                Step::Settle(outcome)
            }
            Err(e) => {
                warn!(task_id = %handle.id(), error = %e, "failed to fetch remote result, retrying next tick");
                Step::Keep
            }
        },
        _ => Step::Keep,
    }
}

/// Carry out `step` on `future`. Returns `true` once the pair no longer
/// needs tracking.
fn apply(future: &TaskFuture<Value>, step: &Step) -> bool {
    match step {
        Step::Keep => false,
        Step::Untrack => true,
        Step::Abandon => {
            future.abandon();
            true
        }
        Step::Start => future.state() == FutureState::Pending && !mark_running(future),
        Step::Settle(outcome) => {
            settle(future, outcome);
            true
        }
    }
}

/// Move a pending future to `Running`. Returns `false` if it turned out to be
/// cancelled instead.
fn mark_running(future: &TaskFuture<Value>) -> bool {
    match future.set_running_or_notify_cancel() {
        Ok(running) => running,
        Err(e) => {
            debug!(future_id = future.id(), error = %e, "future already left pending");
            future.state() == FutureState::Running
        }
    }
}

fn settle(future: &TaskFuture<Value>, outcome: &TaskOutcome) {
    // Pending futures pass through Running to keep the transition legal.
    if future.state() == FutureState::Pending && !mark_running(future) {
        return;
    }
    let stored = match outcome {
        Ok(value) => future.set_result(value.clone()),
        Err(message) => future.set_failure(anyhow::anyhow!(message.clone())),
    };
    match stored {
        Ok(()) => debug!(future_id = future.id(), "remote future finished"),
        Err(e) => debug!(future_id = future.id(), error = %e, "remote outcome not stored"),
    }
}
