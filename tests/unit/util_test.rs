//! Tests for utility functions

use prometheus_lease_executor::util::{current_pid, hostname, init_tracing, process_alive};

#[test]
fn test_current_pid_matches_std() {
    assert_eq!(current_pid(), std::process::id());
    assert!(process_alive(current_pid()));
}

#[test]
fn test_hostname_is_usable_as_directory_name() {
    let name = hostname();
    assert!(!name.is_empty());
    assert!(!name.contains('/'));
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
    tracing::info!("tracing initialised twice without panicking");
}
