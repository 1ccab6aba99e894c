//! Shared utilities.

pub mod host;
pub mod telemetry;

pub use host::{hostname, process_alive, current_pid};
pub use telemetry::*;
