//! # Prometheus Lease Executor
//!
//! Worker leases on scarce exclusive resources, and one execution contract
//! for work that runs inline, on a thread pool, in child processes or on a
//! remote task queue.
//!
//! ## Leases
//!
//! A [`Lease`](core::Lease) is a named pool of `slots × repeat` bindings,
//! typically one slot per GPU. Each worker calls `acquire()` once and keeps
//! the slot for its lifetime; what counts as a worker (thread or process)
//! follows the executor in use. Bindings are lock files, so independent
//! processes exclude each other and a crashed holder never wedges a slot:
//!
//! - **hard locks** (`flock(2)`) are dropped by the kernel when the holder dies
//! - **soft locks** (marker files, for filesystems without working locks)
//!   record the holder's pid and are reclaimed once that pid is gone
//!
//! ```rust,ignore
//! use prometheus_lease_executor::core::{Lease, LeaseOptions, Submit, ThreadPoolExecutor};
//!
//! let pool = ThreadPoolExecutor::with_workers(4)?;
//! let gpus = Lease::for_executor("gpu", ["cuda:0", "cuda:1"], 2, &pool, LeaseOptions::new("/var/run/app"))?;
//!
//! let future = pool.submit(move || {
//!     let device = gpus.acquire()?;
//!     run_inference_on(&device)
//! })?;
//! let output = future.result()?;
//! ```
//!
//! ## Futures and executors
//!
//! Every executor returns a [`TaskFuture`](core::TaskFuture) per job: a
//! blocking handle with a strict state machine (pending, running, finished,
//! cancelled). The [`RemoteExecutor`](core::RemoteExecutor) fills futures by
//! polling the broker, since a remote queue cannot push state changes.
//!
//! ## Configuration
//!
//! [`config::Settings`] describes leases and the executor in JSON or through
//! environment variables; [`builders`] turns it into a registry and executor.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Leases, futures and executors.
pub mod core;
/// Configuration models for leases and executors.
pub mod config;
/// Builders to construct registries and executors from configuration.
pub mod builders;
/// Infrastructure adapters: lock files and remote task-queue clients.
pub mod infra;
/// Shared utilities.
pub mod util;
