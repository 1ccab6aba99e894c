//! Tests for error types

use std::sync::Arc;

use prometheus_lease_executor::core::{
    ConfigError, ExecutorError, FutureError, FutureState, LeaseError, RemoteError,
};

#[test]
fn test_resource_exhausted_error() {
    let err = LeaseError::ResourceExhausted {
        name: "gpu".to_string(),
        capacity: 4,
    };
    assert_eq!(
        format!("{err}"),
        "resource exhausted: no free slot in lease `gpu` (capacity 4)"
    );
}

#[test]
fn test_not_held_error() {
    let err = LeaseError::NotHeld("gpu".to_string());
    assert_eq!(format!("{err}"), "release called with no lock acquired on lease `gpu`");
}

#[test]
fn test_worker_exiting_error() {
    let err = LeaseError::WorkerExiting("gpu".to_string());
    assert_eq!(
        format!("{err}"),
        "cannot bind lease `gpu`: the calling thread is exiting"
    );
}

#[test]
fn test_shutdown_error() {
    assert_eq!(
        format!("{}", ExecutorError::Shutdown),
        "cannot schedule new futures after shutdown"
    );
}

#[test]
fn test_transport_error_wraps_remote_error() {
    let err: ExecutorError = RemoteError::Transport("connection refused".to_string()).into();
    assert_eq!(
        format!("{err}"),
        "remote dispatch failed: transport error: connection refused"
    );
}

#[test]
fn test_failed_future_error_shows_cause_chain() {
    let cause = anyhow::anyhow!("disk full").context("writing checkpoint");
    let err = FutureError::Failed(Arc::new(cause));
    assert_eq!(format!("{err}"), "task failed: writing checkpoint: disk full");
}

#[test]
fn test_invalid_state_error() {
    let err = FutureError::InvalidState {
        from: FutureState::Finished,
        to: FutureState::Running,
    };
    assert_eq!(
        format!("{err}"),
        "invalid future state transition from FINISHED to RUNNING"
    );
}

#[test]
fn test_env_config_error() {
    let err = ConfigError::Env {
        key: "LEASE_EXECUTOR".to_string(),
        reason: "unknown executor kind `fork`".to_string(),
    };
    assert_eq!(
        format!("{err}"),
        "environment variable `LEASE_EXECUTOR`: unknown executor kind `fork`"
    );
}
