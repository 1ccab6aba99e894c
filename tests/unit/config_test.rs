//! Tests for configuration validation

use prometheus_lease_executor::config::{
    ExecutorConfig, ExecutorKind, LeaseConfig, RemoteConfig, Settings, SlotsConfig,
};
use prometheus_lease_executor::core::{LockMode, SlotId, WorkerScope};

fn lease(name: &str, slots: SlotsConfig) -> LeaseConfig {
    LeaseConfig {
        name: name.to_string(),
        slots,
        repeat: 1,
        lock_mode: LockMode::Auto,
        scope: None,
    }
}

#[test]
fn test_lease_config_validation() {
    assert!(lease("gpu", SlotsConfig::Count(2)).validate().is_ok());
    assert!(lease("", SlotsConfig::Count(2)).validate().is_err());
    assert!(lease("gpu", SlotsConfig::List(Vec::new())).validate().is_err());

    let mut no_repeat = lease("gpu", SlotsConfig::Count(1));
    no_repeat.repeat = 0;
    assert!(no_repeat.validate().is_err());
}

#[test]
fn test_executor_config_validation() {
    assert!(ExecutorConfig::default().validate().is_ok());

    let zero_workers = ExecutorConfig {
        max_workers: Some(0),
        ..ExecutorConfig::default()
    };
    assert!(zero_workers.validate().is_err());

    let zero_depth = ExecutorConfig {
        max_queue_depth: 0,
        ..ExecutorConfig::default()
    };
    assert!(zero_depth.validate().is_err());
}

#[test]
fn test_remote_config_defaults() {
    let remote = RemoteConfig::default();
    assert_eq!(remote.update_delay_ms, 100);
    assert!(remote.validate().is_ok());
    assert_eq!(remote.options().update_delay, remote.update_delay());
}

#[test]
fn test_lease_scope_follows_executor() {
    let mut settings = Settings::default();
    settings.executor.kind = ExecutorKind::ProcessPool;
    assert_eq!(settings.default_scope(), WorkerScope::Process);

    let mut pinned = lease("gpu", SlotsConfig::Count(1));
    pinned.scope = Some(WorkerScope::Thread);
    let options = pinned.options(&settings.processing_root, settings.default_scope());
    assert_eq!(options.scope, WorkerScope::Thread);
}

#[test]
fn test_settings_from_json() {
    let json = r#"{
        "processing_root": "/var/run/inference",
        "leases": [
            { "name": "gpu", "slots": ["cuda:0", "cuda:1"], "repeat": 2, "lock_mode": "hard" },
            { "name": "nic", "slots": 1, "scope": "process" }
        ],
        "executor": { "kind": "process_pool", "max_workers": 4 },
        "remote": { "update_delay_ms": 250 }
    }"#;

    let settings = Settings::from_json_str(json).unwrap();
    assert_eq!(settings.processing_root.to_str(), Some("/var/run/inference"));
    assert_eq!(settings.leases.len(), 2);
    assert_eq!(
        settings.leases[0].slots,
        SlotsConfig::List(vec![SlotId::from("cuda:0"), SlotId::from("cuda:1")])
    );
    assert_eq!(settings.leases[0].lock_mode, LockMode::Hard);
    assert_eq!(settings.leases[1].scope, Some(WorkerScope::Process));
    assert_eq!(settings.executor.kind, ExecutorKind::ProcessPool);
    assert_eq!(settings.executor.workers(), 4);
    assert_eq!(settings.remote.map(|r| r.update_delay_ms), Some(250));
}

#[test]
fn test_settings_serialize_round_trip() {
    let settings = Settings {
        leases: vec![lease("gpu", SlotsConfig::Count(3))],
        ..Settings::default()
    };
    let json = serde_json::to_string(&settings).unwrap();
    assert_eq!(Settings::from_json_str(&json).unwrap(), settings);
}
