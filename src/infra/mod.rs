//! Infrastructure adapters: lock files on disk and remote task-queue clients.

pub mod lockfile;
pub mod remote;

pub use lockfile::{LockFile, LockKind};
pub use remote::{InMemoryTaskQueue, TaskQueueClient};
