//! Worker-local storage for lease bindings.
//!
//! A worker holds at most one binding per lease for its whole lifetime. What
//! counts as a "worker" depends on the executor in use: with thread-based
//! executors every OS thread is a worker, with process-based executors the
//! whole process is. [`WorkerLocalStorage`] hides that choice behind one
//! capability with two implementations, picked once when the lease is built.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::core::LeaseError;
use crate::infra::lockfile::{remove_dir_if_empty, LockFile};

/// Unit of ownership for lease bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerScope {
    /// Each OS thread holds its own binding.
    #[default]
    Thread,
    /// All threads of a process share one binding.
    Process,
}

/// A worker's live claim on one `(slot, repeat)` pair of a lease.
///
/// Dropping a binding that still owns its lock tears it down: this is how
/// bindings are returned when a worker thread exits or a process-scoped lease
/// goes away.
pub struct Binding {
    lease: String,
    slot: usize,
    repeat: usize,
    lock: Option<LockFile>,
    lock_dir: PathBuf,
    ref_count: usize,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("lease", &self.lease)
            .field("slot", &self.slot)
            .field("repeat", &self.repeat)
            .field("ref_count", &self.ref_count)
            .finish_non_exhaustive()
    }
}

impl Binding {
    pub(crate) fn new(
        lease: impl Into<String>,
        slot: usize,
        repeat: usize,
        lock: LockFile,
        lock_dir: PathBuf,
    ) -> Self {
        Self {
            lease: lease.into(),
            slot,
            repeat,
            lock: Some(lock),
            lock_dir,
            ref_count: 1,
        }
    }

    /// Snapshot of the binding's position and reference count.
    #[must_use]
    pub const fn info(&self) -> BindingInfo {
        BindingInfo {
            slot: self.slot,
            repeat: self.repeat,
            ref_count: self.ref_count,
        }
    }

    /// Delete the lock file, unlock, and drop the lock directory if empty.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::LockFile`] if the lock file cannot be removed.
    pub(crate) fn teardown(mut self) -> Result<(), LeaseError> {
        self.release_lock()
    }

    fn release_lock(&mut self) -> Result<(), LeaseError> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };
        let path = lock.path().to_path_buf();
        lock.release()
            .map_err(|source| LeaseError::LockFile { path, source })?;
        if remove_dir_if_empty(&self.lock_dir) {
            debug!(lease = %self.lease, dir = %self.lock_dir.display(), "removed empty lock directory");
        }
        debug!(lease = %self.lease, slot = self.slot, repeat = self.repeat, "binding released");
        Ok(())
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        if self.lock.is_none() {
            return;
        }
        debug!(lease = %self.lease, slot = self.slot, "releasing binding at worker teardown");
        if let Err(e) = self.release_lock() {
            error!(lease = %self.lease, error = %e, "failed to release binding at teardown");
        }
    }
}

/// Position and reference count of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingInfo {
    /// Index into the lease's slot list.
    pub slot: usize,
    /// Repeat index within the slot.
    pub repeat: usize,
    /// Outstanding `acquire()` calls not yet matched by `release()`.
    pub ref_count: usize,
}

/// Result of decrementing a binding's reference count.
#[derive(Debug)]
pub enum ReleaseOutcome {
    /// The worker held no binding.
    NotHeld,
    /// The binding is still referenced.
    Retained {
        /// References left.
        remaining: usize,
    },
    /// The binding was removed from storage and must be torn down.
    Freed(Binding),
}

/// Holder of at most one binding per calling worker.
pub trait WorkerLocalStorage: Send + Sync + fmt::Debug {
    /// What a "worker" is for this storage.
    fn scope(&self) -> WorkerScope;

    /// The caller's binding, if any, without changing its reference count.
    fn current(&self) -> Option<BindingInfo>;

    /// Increment the caller's reference count and return the binding.
    fn retain(&self) -> Option<BindingInfo>;

    /// Record a freshly acquired binding for the caller.
    ///
    /// A binding the caller already holds is replaced and torn down. The
    /// binding is handed back when the caller can no longer hold one, as
    /// when a thread is already tearing down its locals.
    fn store(&self, binding: Binding) -> Result<(), Binding>;

    /// Decrement the caller's reference count, freeing it at zero or when
    /// `force` is set.
    fn release(&self, force: bool) -> ReleaseOutcome;
}

fn decrement(slot: &mut Option<Binding>, force: bool) -> ReleaseOutcome {
    let Some(binding) = slot.as_mut() else {
        return ReleaseOutcome::NotHeld;
    };
    binding.ref_count = binding.ref_count.saturating_sub(1);
    if binding.ref_count > 0 && !force {
        return ReleaseOutcome::Retained {
            remaining: binding.ref_count,
        };
    }
    slot.take().map_or(ReleaseOutcome::NotHeld, ReleaseOutcome::Freed)
}

thread_local! {
    static THREAD_BINDINGS: RefCell<HashMap<u64, Binding>> = RefCell::new(HashMap::new());
}

/// Bindings owned by the calling OS thread, torn down when the thread exits.
#[derive(Debug)]
pub struct ThreadScopedStorage {
    key: u64,
}

impl ThreadScopedStorage {
    /// Storage keyed by a lease's process-unique id.
    #[must_use]
    pub const fn new(key: u64) -> Self {
        Self { key }
    }
}

impl WorkerLocalStorage for ThreadScopedStorage {
    fn scope(&self) -> WorkerScope {
        WorkerScope::Thread
    }

    fn current(&self) -> Option<BindingInfo> {
        THREAD_BINDINGS
            .try_with(|map| map.borrow().get(&self.key).map(Binding::info))
            .ok()
            .flatten()
    }

    fn retain(&self) -> Option<BindingInfo> {
        THREAD_BINDINGS
            .try_with(|map| {
                map.borrow_mut().get_mut(&self.key).map(|binding| {
                    binding.ref_count += 1;
                    binding.info()
                })
            })
            .ok()
            .flatten()
    }

    fn store(&self, binding: Binding) -> Result<(), Binding> {
        let mut pending = Some(binding);
        let replaced = THREAD_BINDINGS
            .try_with(|map| {
                pending
                    .take()
                    .and_then(|binding| map.borrow_mut().insert(self.key, binding))
            })
            .ok()
            .flatten();
        drop(replaced);
        // Still pending only if the map was already destroyed.
        pending.map_or(Ok(()), Err)
    }

    fn release(&self, force: bool) -> ReleaseOutcome {
        THREAD_BINDINGS
            .try_with(|map| {
                let mut map = map.borrow_mut();
                let mut slot = map.remove(&self.key);
                let outcome = decrement(&mut slot, force);
                if let Some(binding) = slot {
                    map.insert(self.key, binding);
                }
                outcome
            })
            .unwrap_or(ReleaseOutcome::NotHeld)
    }
}

/// One binding shared by every thread of the process.
#[derive(Debug, Default)]
pub struct ProcessScopedStorage {
    binding: Mutex<Option<Binding>>,
}

impl ProcessScopedStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerLocalStorage for ProcessScopedStorage {
    fn scope(&self) -> WorkerScope {
        WorkerScope::Process
    }

    fn current(&self) -> Option<BindingInfo> {
        self.binding.lock().as_ref().map(Binding::info)
    }

    fn retain(&self) -> Option<BindingInfo> {
        self.binding.lock().as_mut().map(|binding| {
            binding.ref_count += 1;
            binding.info()
        })
    }

    fn store(&self, binding: Binding) -> Result<(), Binding> {
        let replaced = self.binding.lock().replace(binding);
        drop(replaced);
        Ok(())
    }

    fn release(&self, force: bool) -> ReleaseOutcome {
        decrement(&mut self.binding.lock(), force)
    }
}

/// Build the storage matching `scope`.
#[must_use]
pub fn storage_for(scope: WorkerScope, key: u64) -> Box<dyn WorkerLocalStorage> {
    match scope {
        WorkerScope::Thread => Box::new(ThreadScopedStorage::new(key)),
        WorkerScope::Process => Box::new(ProcessScopedStorage::new()),
    }
}
