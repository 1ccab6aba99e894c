//! Configuration models for leases and executors.

pub mod settings;

pub use settings::{
    ExecutorConfig, ExecutorKind, LeaseConfig, RemoteConfig, Settings, SlotsConfig, EXECUTOR_ENV,
};
