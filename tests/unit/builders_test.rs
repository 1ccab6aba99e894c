//! Tests for builder modules

use std::sync::Arc;

use prometheus_lease_executor::builders::{build_registry, build_remote_executor};
use prometheus_lease_executor::config::{ExecutorKind, Settings};
use prometheus_lease_executor::core::{
    Executor, ExecutorError, LeaseError, LockKind, MonitorMode, SlotId, WorkerScope,
};
use prometheus_lease_executor::infra::{InMemoryTaskQueue, TaskQueueClient};

fn scratch_root() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("builders-unit-{}", uuid::Uuid::new_v4()))
}

#[test]
fn test_build_registry_from_settings() {
    let root = scratch_root();
    let json = format!(
        r#"{{
            "processing_root": {root:?},
            "leases": [
                {{ "name": "gpu", "slots": ["cuda:0"], "lock_mode": "hard" }},
                {{ "name": "cpu", "slots": 2, "repeat": 3, "lock_mode": "soft", "scope": "process" }}
            ],
            "executor": {{ "kind": "thread_pool" }}
        }}"#
    );
    let settings = Settings::from_json_str(&json).unwrap();
    let registry = build_registry(&settings).unwrap();
    assert_eq!(registry.len(), 2);

    let gpu = registry.get("gpu").unwrap();
    assert_eq!(gpu.scope(), WorkerScope::Thread);
    assert_eq!(gpu.lock_kind(), LockKind::Hard);
    assert_eq!(gpu.slots(), &[SlotId::from("cuda:0")]);
    assert!(gpu.lock_dir().starts_with(&root));

    let cpu = registry.get("cpu").unwrap();
    assert_eq!(cpu.scope(), WorkerScope::Process);
    assert_eq!(cpu.lock_kind(), LockKind::Soft);
    assert_eq!(cpu.capacity(), 6);

    assert!(matches!(registry.get("nic"), Err(LeaseError::NotFound(_))));
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn test_build_registry_rejects_invalid_settings() {
    let mut settings = Settings::default();
    settings.executor.max_queue_depth = 0;
    assert!(matches!(
        build_registry(&settings),
        Err(LeaseError::InvalidSpec(_))
    ));
}

#[test]
fn test_build_remote_executor() {
    let queue: Arc<dyn TaskQueueClient> = Arc::new(InMemoryTaskQueue::new(1).unwrap());

    let mut settings = Settings::default();
    assert!(matches!(
        build_remote_executor(&settings, Arc::clone(&queue)),
        Err(ExecutorError::InvalidConfig(_))
    ));

    settings.executor.kind = ExecutorKind::Remote;
    let executor = build_remote_executor(&settings, queue).unwrap();
    assert_eq!(executor.options().monitor, MonitorMode::Background);
    executor.shutdown(true).unwrap();
}
