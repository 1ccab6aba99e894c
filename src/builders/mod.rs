//! Builders to construct registries and executors from configuration.

pub mod executor_builder;
pub mod registry_builder;

pub use executor_builder::{
    build_local_executor, build_process_pool, build_remote_executor, LocalExecutor,
};
pub use registry_builder::{build_registry, register_leases};
