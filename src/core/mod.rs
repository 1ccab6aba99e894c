//! Leases, futures and executors.

pub mod error;
pub mod executor;
pub mod future;
pub mod lease;
pub mod registry;
pub mod remote;
pub mod storage;

pub use error::{AppResult, ConfigError, ExecutorError, FutureError, LeaseError, RemoteError};
pub use executor::{
    ConcurrencyModel, Executor, ExecutorStats, InlineExecutor, Job, PoolOptions, ProcessJob,
    ProcessOutput, ProcessPoolExecutor, Submit, SyncExecutor, ThreadPoolExecutor,
};
pub use future::{wait_all, CancelHook, FutureId, FutureState, TaskFuture};
pub use lease::{
    install_exit_guard, release_all_live_leases, ExitGuard, Lease, LeaseOptions, LockMode, SlotId,
    Slots,
};
pub use registry::LeaseRegistry;
pub use remote::{
    MonitorMode, RemoteCall, RemoteExecutor, RemoteExecutorOptions, RemoteHandle, RemoteState,
};
pub use storage::{BindingInfo, WorkerLocalStorage, WorkerScope};

pub use crate::infra::lockfile::LockKind;
