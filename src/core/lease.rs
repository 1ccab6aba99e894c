//! Named pools of exclusive slots shared between workers.
//!
//! A [`Lease`] hands each worker one of `slots × repeat` bindings and keeps it
//! for the worker's lifetime. Bindings are backed by lock files under
//!
//! ```text
//! {processing_root}/.resource.locks/{hostname}/{owner_pid}/{name}/{slot}.{repeat}.lock
//! ```
//!
//! so that independent OS processes spawned from the same owner see each
//! other's claims. The lock files are the only state shared across processes.
//!
//! # Example
//!
//! ```rust,ignore
//! use prometheus_lease_executor::core::{Lease, LeaseOptions};
//!
//! // Two GPUs, two workers per GPU.
//! let gpus = Lease::new("gpu", 2, 2, LeaseOptions::new("/var/run/app"))?;
//! let gpu = gpus.acquire()?;      // held until release or worker exit
//! assert_eq!(gpus.acquire()?, gpu); // idempotent
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::executor::Executor;
use crate::core::storage::{storage_for, Binding, ReleaseOutcome, WorkerLocalStorage, WorkerScope};
use crate::core::LeaseError;
use crate::infra::lockfile::{
    probe_hard_lock_support, read_holder_pid, remove_dir_if_empty, LockFile, LockKind,
};
use crate::util::{current_pid, hostname, process_alive};

/// Directory under the processing root that holds every lease's lock files.
pub const LOCKS_DIR_NAME: &str = ".resource.locks";

/// Environment variable carrying the owner pid into child processes.
pub const OWNER_PID_ENV: &str = "LEASE_OWNER_PID";

/// Environment variable carrying the processing root into child processes.
pub const PROCESSING_ROOT_ENV: &str = "LEASE_PROCESSING_ROOT";

static NEXT_LEASE_ID: AtomicU64 = AtomicU64::new(1);

/// Non-owning table of every lease alive in this process.
static LIVE_LEASES: Mutex<Vec<Weak<LeaseInner>>> = parking_lot::const_mutex(Vec::new());

/// Identifier of one slot in a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotId {
    /// Positional slot, produced by the integer shorthand.
    Index(usize),
    /// Caller-supplied identifier.
    Named(String),
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl From<usize> for SlotId {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

impl From<&str> for SlotId {
    fn from(value: &str) -> Self {
        Self::Named(value.to_string())
    }
}

impl From<String> for SlotId {
    fn from(value: String) -> Self {
        Self::Named(value)
    }
}

/// Ordered slot identifiers of a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slots(Vec<SlotId>);

impl Slots {
    /// The identifiers in order.
    #[must_use]
    pub fn as_slice(&self) -> &[SlotId] {
        &self.0
    }
}

impl From<usize> for Slots {
    fn from(count: usize) -> Self {
        Self((0..count).map(SlotId::Index).collect())
    }
}

impl From<Vec<SlotId>> for Slots {
    fn from(ids: Vec<SlotId>) -> Self {
        Self(ids)
    }
}

impl From<Vec<String>> for Slots {
    fn from(ids: Vec<String>) -> Self {
        Self(ids.into_iter().map(SlotId::Named).collect())
    }
}

impl From<Vec<&str>> for Slots {
    fn from(ids: Vec<&str>) -> Self {
        Self(ids.into_iter().map(SlotId::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Slots {
    fn from(ids: [&str; N]) -> Self {
        Self(ids.into_iter().map(SlotId::from).collect())
    }
}

/// How the lock kind is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Probe the lock directory and fall back to soft locks if needed.
    #[default]
    Auto,
    /// Always use OS-level locks.
    Hard,
    /// Always use marker files.
    Soft,
}

/// Construction parameters of a [`Lease`].
#[derive(Debug, Clone)]
pub struct LeaseOptions {
    /// Base directory for lock files.
    pub processing_root: PathBuf,
    /// Lock kind selection.
    pub lock_mode: LockMode,
    /// Unit of ownership for bindings.
    pub scope: WorkerScope,
    /// Pid naming the lock directory; defaults to the current process.
    pub owner_pid: Option<u32>,
    /// Host naming the lock directory; defaults to the machine's hostname.
    pub hostname: Option<String>,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl LeaseOptions {
    /// Options rooted at `processing_root` with automatic lock detection and
    /// thread scope.
    pub fn new(processing_root: impl Into<PathBuf>) -> Self {
        Self {
            processing_root: processing_root.into(),
            lock_mode: LockMode::Auto,
            scope: WorkerScope::Thread,
            owner_pid: None,
            hostname: None,
        }
    }

    /// Options for a worker process spawned by a process pool.
    ///
    /// Reads [`PROCESSING_ROOT_ENV`] and [`OWNER_PID_ENV`] so the child joins
    /// its parent's lock directory, and selects process scope. Missing or
    /// malformed variables fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut options = std::env::var_os(PROCESSING_ROOT_ENV)
            .map_or_else(Self::default, Self::new)
            .with_scope(WorkerScope::Process);
        options.owner_pid = std::env::var(OWNER_PID_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse().ok());
        options
    }

    /// Set the lock mode.
    #[must_use]
    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    /// Set the worker scope.
    #[must_use]
    pub fn with_scope(mut self, scope: WorkerScope) -> Self {
        self.scope = scope;
        self
    }

    /// Join the lock directory of another process.
    #[must_use]
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.owner_pid = Some(pid);
        self
    }

    /// Override the hostname path component.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

struct LeaseInner {
    id: u64,
    name: String,
    slots: Vec<SlotId>,
    repeat: usize,
    lock_dir: PathBuf,
    lock_kind: LockKind,
    storage: Box<dyn WorkerLocalStorage>,
}

/// A named, fixed-size pool of interchangeable slots.
///
/// Cloning is cheap and clones share bindings. See the [module docs](self).
#[derive(Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("slots", &self.inner.slots)
            .field("repeat", &self.inner.repeat)
            .field("lock_dir", &self.inner.lock_dir)
            .field("lock_kind", &self.inner.lock_kind)
            .field("scope", &self.inner.storage.scope())
            .finish()
    }
}

impl Lease {
    /// Create a lease of `slots × repeat` bindings.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::InvalidSpec`] for an unusable name, no slots or a zero
    ///   repeat factor
    /// - [`LeaseError::LockDir`] if the lock directory cannot be created
    pub fn new(
        name: impl Into<String>,
        slots: impl Into<Slots>,
        repeat: usize,
        options: LeaseOptions,
    ) -> Result<Self, LeaseError> {
        let name = name.into();
        let Slots(slots) = slots.into();
        validate(&name, &slots, repeat)?;

        let owner_pid = options.owner_pid.unwrap_or_else(current_pid);
        let host = options.hostname.clone().unwrap_or_else(hostname);
        let lock_dir = options
            .processing_root
            .join(LOCKS_DIR_NAME)
            .join(host)
            .join(owner_pid.to_string())
            .join(&name);

        let lock_kind = match options.lock_mode {
            LockMode::Hard => LockKind::Hard,
            LockMode::Soft => LockKind::Soft,
            LockMode::Auto => detect_lock_kind(&name, &lock_dir)?,
        };

        // Soft locks cannot tell a live marker from one left by a crashed
        // run. Only the owning process clears them; joining children must not.
        if lock_kind == LockKind::Soft && owner_pid == current_pid() {
            purge_leftover_locks(&name, &lock_dir)?;
        }

        let id = NEXT_LEASE_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(LeaseInner {
            id,
            storage: storage_for(options.scope, id),
            name,
            slots,
            repeat,
            lock_dir,
            lock_kind,
        });

        {
            let mut live = LIVE_LEASES.lock();
            live.retain(|lease| lease.strong_count() > 0);
            live.push(Arc::downgrade(&inner));
        }

        info!(
            lease = %inner.name,
            capacity = inner.slots.len() * inner.repeat,
            kind = ?inner.lock_kind,
            scope = ?options.scope,
            dir = %inner.lock_dir.display(),
            "lease created"
        );
        Ok(Self { inner })
    }

    /// Create a lease whose worker scope follows `executor`'s concurrency
    /// model. `options.scope` is overridden.
    ///
    /// # Errors
    ///
    /// Same as [`Lease::new`].
    pub fn for_executor<E>(
        name: impl Into<String>,
        slots: impl Into<Slots>,
        repeat: usize,
        executor: &E,
        options: LeaseOptions,
    ) -> Result<Self, LeaseError>
    where
        E: Executor + ?Sized,
    {
        let scope = executor.concurrency().worker_scope();
        Self::new(name, slots, repeat, options.with_scope(scope))
    }

    /// Bind the calling worker to a free slot and return its identifier.
    ///
    /// A worker that already holds a binding gets the same identifier back
    /// and its reference count goes up; no new lock is taken. Otherwise every
    /// `(slot, repeat)` pair is probed once, repeat-major, without blocking.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::ResourceExhausted`] if every pair is held
    /// - [`LeaseError::LockDir`] / [`LeaseError::LockFile`] on I/O failure
    /// - [`LeaseError::WorkerExiting`] if called while the calling thread
    ///   tears down its locals
    pub fn acquire(&self) -> Result<SlotId, LeaseError> {
        let inner = &*self.inner;
        if let Some(held) = inner.storage.retain() {
            debug!(
                lease = %inner.name,
                slot = held.slot,
                repeat = held.repeat,
                refs = held.ref_count,
                "reusing existing binding"
            );
            return Ok(inner.slots[held.slot].clone());
        }

        fs::create_dir_all(&inner.lock_dir).map_err(|source| LeaseError::LockDir {
            path: inner.lock_dir.clone(),
            source,
        })?;

        let pid = current_pid();
        for repeat in 0..inner.repeat {
            for slot in 0..inner.slots.len() {
                let Some(lock) = self.try_lock(slot, repeat)? else {
                    continue;
                };
                if let Err(source) = lock.record_holder(pid) {
                    let path = lock.path().to_path_buf();
                    if let Err(e) = lock.release() {
                        warn!(lease = %inner.name, error = %e, "failed to give back lock after write error");
                    }
                    return Err(LeaseError::LockFile { path, source });
                }
                let binding = Binding::new(
                    inner.name.clone(),
                    slot,
                    repeat,
                    lock,
                    inner.lock_dir.clone(),
                );
                if let Err(binding) = inner.storage.store(binding) {
                    // Dropping the binding gives the lock back.
                    drop(binding);
                    warn!(lease = %inner.name, slot, repeat, "caller is exiting, binding not kept");
                    return Err(LeaseError::WorkerExiting(inner.name.clone()));
                }
                debug!(lease = %inner.name, slot, repeat, pid, "binding acquired");
                return Ok(inner.slots[slot].clone());
            }
        }

        warn!(lease = %inner.name, capacity = self.capacity(), "no free slot");
        Err(LeaseError::ResourceExhausted {
            name: inner.name.clone(),
            capacity: self.capacity(),
        })
    }

    fn try_lock(&self, slot: usize, repeat: usize) -> Result<Option<LockFile>, LeaseError> {
        let inner = &*self.inner;
        let path = self.lock_file_path(slot, repeat);
        let attempt = || {
            LockFile::try_acquire(inner.lock_kind, &path).map_err(|source| LeaseError::LockFile {
                path: path.clone(),
                source,
            })
        };

        if let Some(lock) = attempt()? {
            return Ok(Some(lock));
        }

        // Only a soft lock can outlive its holder, and only another process
        // can be the dead holder.
        if inner.lock_kind != LockKind::Soft || inner.storage.scope() != WorkerScope::Process {
            return Ok(None);
        }
        let Some(holder) = read_holder_pid(&path) else {
            return Ok(None);
        };
        if process_alive(holder) {
            return Ok(None);
        }

        // Reclaimers of one file take turns behind a guard file.
        let guard_path = inner.lock_dir.join(format!("{slot}.{repeat}.lock.reclaim"));
        let guard = LockFile::try_acquire(LockKind::Soft, &guard_path).map_err(|source| {
            LeaseError::LockFile {
                path: guard_path.clone(),
                source,
            }
        })?;
        let Some(guard) = guard else {
            return Ok(None);
        };
        let reclaimed = reclaim_stale_lock(&inner.name, &path, holder);
        if let Err(source) = guard.release() {
            return Err(LeaseError::LockFile {
                path: guard_path,
                source,
            });
        }
        if !reclaimed.map_err(|source| LeaseError::LockFile {
            path: path.clone(),
            source,
        })? {
            return Ok(None);
        }
        attempt()
    }

    /// Drop one reference to the caller's binding, freeing the slot when the
    /// count reaches zero.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotHeld`] if the caller holds no binding
    /// - [`LeaseError::LockFile`] if the lock file cannot be removed
    pub fn release(&self) -> Result<(), LeaseError> {
        self.release_binding(false)
    }

    /// Free the caller's binding regardless of its reference count.
    ///
    /// # Errors
    ///
    /// Same as [`Lease::release`].
    pub fn force_release(&self) -> Result<(), LeaseError> {
        self.release_binding(true)
    }

    fn release_binding(&self, force: bool) -> Result<(), LeaseError> {
        let inner = &*self.inner;
        match inner.storage.release(force) {
            ReleaseOutcome::NotHeld => Err(LeaseError::NotHeld(inner.name.clone())),
            ReleaseOutcome::Retained { remaining } => {
                debug!(lease = %inner.name, remaining, "binding still referenced");
                Ok(())
            }
            ReleaseOutcome::Freed(binding) => binding.teardown(),
        }
    }

    /// Acquire (idempotently) and run `f` with the slot.
    ///
    /// The binding outlives the call: bindings belong to the worker, not to
    /// the block, and only [`Lease::release`] or worker teardown frees them.
    ///
    /// # Errors
    ///
    /// Same as [`Lease::acquire`].
    pub fn with_slot<R>(&self, f: impl FnOnce(&SlotId) -> R) -> Result<R, LeaseError> {
        if let Some(held) = self.inner.storage.current() {
            return Ok(f(&self.inner.slots[held.slot]));
        }
        let slot = self.acquire()?;
        Ok(f(&slot))
    }

    /// The caller's slot, if it holds a binding.
    #[must_use]
    pub fn current(&self) -> Option<SlotId> {
        self.inner
            .storage
            .current()
            .map(|held| self.inner.slots[held.slot].clone())
    }

    /// Outstanding references on the caller's binding (0 if none).
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.inner.storage.current().map_or(0, |held| held.ref_count)
    }

    /// Path of the lock file for `(slot, repeat)`.
    #[must_use]
    pub fn lock_file_path(&self, slot: usize, repeat: usize) -> PathBuf {
        self.inner.lock_dir.join(format!("{slot}.{repeat}.lock"))
    }

    /// Lease name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Slot identifiers in probe order.
    #[must_use]
    pub fn slots(&self) -> &[SlotId] {
        &self.inner.slots
    }

    /// Concurrent holders allowed per slot.
    #[must_use]
    pub fn repeat(&self) -> usize {
        self.inner.repeat
    }

    /// Total number of concurrent bindings.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.slots.len() * self.inner.repeat
    }

    /// Directory holding this lease's lock files.
    #[must_use]
    pub fn lock_dir(&self) -> &Path {
        &self.inner.lock_dir
    }

    /// Lock mechanism in use.
    #[must_use]
    pub fn lock_kind(&self) -> LockKind {
        self.inner.lock_kind
    }

    /// Unit of ownership for bindings.
    #[must_use]
    pub fn scope(&self) -> WorkerScope {
        self.inner.storage.scope()
    }

    /// Whether two handles refer to the same lease instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn validate(name: &str, slots: &[SlotId], repeat: usize) -> Result<(), LeaseError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(LeaseError::InvalidSpec(format!(
            "lease name `{name}` is not a valid directory name"
        )));
    }
    if slots.is_empty() {
        return Err(LeaseError::InvalidSpec(format!("lease `{name}` has no slots")));
    }
    if repeat == 0 {
        return Err(LeaseError::InvalidSpec(format!(
            "lease `{name}` must allow at least one holder per slot"
        )));
    }
    Ok(())
}

fn detect_lock_kind(name: &str, lock_dir: &Path) -> Result<LockKind, LeaseError> {
    fs::create_dir_all(lock_dir).map_err(|source| LeaseError::LockDir {
        path: lock_dir.to_path_buf(),
        source,
    })?;
    let hard = probe_hard_lock_support(lock_dir);
    remove_dir_if_empty(lock_dir);
    if hard {
        Ok(LockKind::Hard)
    } else {
        warn!(lease = %name, dir = %lock_dir.display(), "filesystem does not enforce file locks, using soft locks");
        Ok(LockKind::Soft)
    }
}

/// Delete `path` if it still records the dead `holder`. Returns whether the
/// file is gone. Must be called with the reclaim guard held.
fn reclaim_stale_lock(name: &str, path: &Path, holder: u32) -> io::Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    // An empty file is a fresh claim whose pid is not written yet.
    if read_holder_pid(path) != Some(holder) || process_alive(holder) {
        return Ok(false);
    }
    warn!(lease = %name, holder, path = %path.display(), "reclaiming soft lock left by a dead process");
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

fn purge_leftover_locks(name: &str, lock_dir: &Path) -> Result<(), LeaseError> {
    let populated = fs::read_dir(lock_dir).is_ok_and(|mut entries| entries.next().is_some());
    if !populated {
        return Ok(());
    }
    warn!(lease = %name, dir = %lock_dir.display(), "lock directory is not empty, deleting it now");
    fs::remove_dir_all(lock_dir).map_err(|source| LeaseError::LockDir {
        path: lock_dir.to_path_buf(),
        source,
    })
}

/// Force-release every binding the calling thread or process still holds on
/// any live lease. Returns how many bindings were released.
///
/// Thread-scoped bindings held by *other* threads are not visible here; they
/// are released when those threads exit.
pub fn release_all_live_leases() -> usize {
    let live: Vec<Lease> = {
        let mut table = LIVE_LEASES.lock();
        table.retain(|lease| lease.strong_count() > 0);
        table
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Lease { inner })
            .collect()
    };

    let mut released = 0;
    for lease in live {
        if lease.inner.storage.current().is_none() {
            continue;
        }
        match lease.force_release() {
            Ok(()) => released += 1,
            Err(e) => warn!(lease = %lease.name(), error = %e, "failed to release binding at exit"),
        }
    }
    released
}

/// Releases outstanding bindings when dropped; hold one in `main`.
#[must_use = "bindings are released when the guard is dropped"]
#[derive(Debug)]
pub struct ExitGuard {
    _private: (),
}

/// Install a guard that force-releases held bindings at process exit.
pub fn install_exit_guard() -> ExitGuard {
    ExitGuard { _private: () }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let released = release_all_live_leases();
        if released > 0 {
            info!(released, "released outstanding lease bindings at exit");
        }
    }
}
