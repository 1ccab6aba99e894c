//! Integration tests for leases
//!
//! These tests exercise real lock files under a unique temporary root:
//! - Capacity limits across concurrent workers
//! - Idempotent acquire and reference counting
//! - Release and worker teardown returning slots
//! - Crash recovery for soft locks
//! - Lock-directory sharing between processes with the same owner

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;

use prometheus_lease_executor::core::{
    Lease, LeaseError, LeaseOptions, LeaseRegistry, LockKind, LockMode, SlotId, WorkerScope,
};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn scratch_root() -> PathBuf {
    std::env::temp_dir().join(format!("lease-it-{}", uuid::Uuid::new_v4()))
}

fn hard_options(root: &Path) -> LeaseOptions {
    LeaseOptions::new(root).with_lock_mode(LockMode::Hard)
}

/// Pid of a process that has already exited and been reaped.
fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

/// Run `workers` threads that each acquire once, hold until all have tried,
/// then exit. Returns every outcome.
fn contend(lease: &Lease, workers: usize) -> Vec<Result<SlotId, LeaseError>> {
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let lease = lease.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let outcome = lease.acquire();
                barrier.wait();
                outcome
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

// ============================================================================
// CAPACITY
// ============================================================================

#[test]
fn test_two_slots_three_workers() {
    let root = scratch_root();
    let lease = Lease::new("gpu", 2, 1, hard_options(&root)).unwrap();

    let outcomes = contend(&lease, 3);
    let mut granted: Vec<SlotId> = outcomes.iter().filter_map(|o| o.as_ref().ok().cloned()).collect();
    granted.sort_by_key(ToString::to_string);
    assert_eq!(granted, vec![SlotId::Index(0), SlotId::Index(1)]);

    let failures: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().err()).collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0],
        LeaseError::ResourceExhausted { name, capacity: 2 } if name == "gpu"
    ));

    // Worker threads exited, so their bindings are gone.
    assert!(!lease.lock_file_path(0, 0).exists());
    assert!(!lease.lock_file_path(1, 0).exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_named_slots_with_repeat() {
    let root = scratch_root();
    let lease = Lease::new("slot", ["a", "b"], 2, hard_options(&root)).unwrap();
    assert_eq!(lease.capacity(), 4);

    let outcomes = contend(&lease, 5);
    let mut per_slot: HashMap<String, usize> = HashMap::new();
    for slot in outcomes.iter().filter_map(|o| o.as_ref().ok()) {
        *per_slot.entry(slot.to_string()).or_default() += 1;
    }
    assert_eq!(per_slot.get("a"), Some(&2));
    assert_eq!(per_slot.get("b"), Some(&2));
    assert_eq!(outcomes.iter().filter(|o| o.is_err()).count(), 1);
    let _ = fs::remove_dir_all(root);
}

// ============================================================================
// WORKER-LIFETIME SEMANTICS
// ============================================================================

#[test]
fn test_acquire_is_idempotent_and_refcounted() {
    let root = scratch_root();
    let lease = Lease::new("gpu", 2, 1, hard_options(&root)).unwrap();

    let first = lease.acquire().unwrap();
    let second = lease.acquire().unwrap();
    assert_eq!(first, second);
    assert_eq!(lease.ref_count(), 2);
    assert_eq!(lease.current(), Some(first.clone()));

    let SlotId::Index(index) = first else {
        panic!("integer slots are indices");
    };
    let path = lease.lock_file_path(index, 0);
    assert!(path.exists());
    assert_eq!(fs::read_to_string(&path).unwrap(), std::process::id().to_string());

    lease.release().unwrap();
    assert_eq!(lease.ref_count(), 1);
    assert!(path.exists());

    lease.release().unwrap();
    assert_eq!(lease.current(), None);
    assert!(!path.exists());
    assert!(!lease.lock_dir().exists());

    assert!(matches!(lease.release(), Err(LeaseError::NotHeld(name)) if name == "gpu"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_release_lets_another_worker_in() {
    let root = scratch_root();
    let lease = Lease::new("solo", 1, 1, hard_options(&root)).unwrap();
    lease.acquire().unwrap();

    let contender = lease.clone();
    let blocked = thread::spawn(move || contender.acquire().is_err()).join().unwrap();
    assert!(blocked);

    lease.release().unwrap();
    let contender = lease.clone();
    let got = thread::spawn(move || contender.acquire()).join().unwrap();
    assert_eq!(got.unwrap(), SlotId::Index(0));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_force_release_ignores_refcount() {
    let root = scratch_root();
    let lease = Lease::new("gpu", 1, 1, hard_options(&root)).unwrap();
    lease.acquire().unwrap();
    lease.acquire().unwrap();
    lease.acquire().unwrap();

    lease.force_release().unwrap();
    assert_eq!(lease.ref_count(), 0);
    assert!(!lease.lock_file_path(0, 0).exists());
    let _ = fs::remove_dir_all(root);
}

/// Acquires its lease when the owning thread destroys its locals.
struct AcquireAtExit {
    lease: Lease,
    outcome: mpsc::Sender<Result<SlotId, LeaseError>>,
}

impl Drop for AcquireAtExit {
    fn drop(&mut self) {
        self.outcome.send(self.lease.acquire()).ok();
    }
}

thread_local! {
    static AT_EXIT: RefCell<Option<AcquireAtExit>> = const { RefCell::new(None) };
}

#[test]
fn test_acquire_during_thread_teardown_is_refused() {
    let root = scratch_root();
    let lease = Lease::new("gpu", 1, 1, hard_options(&root)).unwrap();
    let (tx, rx) = mpsc::channel();

    let worker_lease = lease.clone();
    thread::spawn(move || {
        // Registered before the lease's own thread-locals, so it is torn
        // down after them.
        AT_EXIT.with(|slot| {
            *slot.borrow_mut() = Some(AcquireAtExit {
                lease: worker_lease.clone(),
                outcome: tx,
            });
        });
        worker_lease.acquire().unwrap();
        worker_lease.release().unwrap();
    })
    .join()
    .unwrap();

    let outcome = rx.recv().unwrap();
    assert!(
        matches!(outcome, Err(LeaseError::WorkerExiting(ref name)) if name == "gpu"),
        "{outcome:?}"
    );
    // The lock taken for the refused binding was given back.
    assert!(!lease.lock_file_path(0, 0).exists());
    assert_eq!(lease.acquire().unwrap(), SlotId::Index(0));
    lease.release().unwrap();
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_with_slot_keeps_binding() {
    let root = scratch_root();
    let lease = Lease::new("gpu", ["cuda:0"], 1, hard_options(&root)).unwrap();
    let name = lease.with_slot(ToString::to_string).unwrap();
    assert_eq!(name, "cuda:0");
    assert_eq!(lease.ref_count(), 1);
    lease.with_slot(|_| ()).unwrap();
    assert_eq!(lease.ref_count(), 1);
    lease.release().unwrap();
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_process_scope_shares_binding_across_threads() {
    let root = scratch_root();
    let lease = Lease::new(
        "shared",
        2,
        1,
        hard_options(&root).with_scope(WorkerScope::Process),
    )
    .unwrap();
    assert_eq!(lease.scope(), WorkerScope::Process);

    let here = lease.acquire().unwrap();
    let other = lease.clone();
    let there = thread::spawn(move || other.acquire().unwrap()).join().unwrap();
    assert_eq!(here, there);
    assert_eq!(lease.ref_count(), 2);

    lease.force_release().unwrap();
    let _ = fs::remove_dir_all(root);
}

// ============================================================================
// CROSS-PROCESS BEHAVIOUR
// ============================================================================

#[test]
fn test_owner_pid_sharing() {
    let root = scratch_root();
    // Two "processes" joining the same owner's lock directory.
    let options = hard_options(&root)
        .with_scope(WorkerScope::Process)
        .with_owner_pid(4_000_000);
    let parent_view = Lease::new("gpu", 1, 1, options.clone()).unwrap();
    let child_view = Lease::new("gpu", 1, 1, options).unwrap();
    assert_eq!(parent_view.lock_dir(), child_view.lock_dir());
    assert!(parent_view.lock_dir().ends_with("4000000/gpu"));

    parent_view.acquire().unwrap();
    assert!(matches!(
        child_view.acquire(),
        Err(LeaseError::ResourceExhausted { .. })
    ));

    parent_view.release().unwrap();
    assert_eq!(child_view.acquire().unwrap(), SlotId::Index(0));
    child_view.release().unwrap();
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_soft_lock_crash_recovery() {
    let root = scratch_root();
    let lease = Lease::new(
        "gpu",
        1,
        1,
        LeaseOptions::new(&root)
            .with_lock_mode(LockMode::Soft)
            .with_scope(WorkerScope::Process),
    )
    .unwrap();
    assert_eq!(lease.lock_kind(), LockKind::Soft);

    // A holder that died without cleaning up.
    let stale = lease.lock_file_path(0, 0);
    fs::create_dir_all(lease.lock_dir()).unwrap();
    fs::write(&stale, dead_pid().to_string()).unwrap();

    assert_eq!(lease.acquire().unwrap(), SlotId::Index(0));
    assert_eq!(fs::read_to_string(&stale).unwrap(), std::process::id().to_string());
    lease.release().unwrap();
    assert!(!stale.exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_concurrent_reclaimers_respect_capacity() {
    let root = scratch_root();
    // Eight "processes" joining one owner's directory, each with its own view.
    let options = LeaseOptions::new(&root)
        .with_lock_mode(LockMode::Soft)
        .with_scope(WorkerScope::Process)
        .with_owner_pid(4_000_001);
    let leases: Vec<Lease> = (0..8)
        .map(|_| Lease::new("gpu", 1, 1, options.clone()).unwrap())
        .collect();
    let stale = leases[0].lock_file_path(0, 0);
    let dead = dead_pid();

    for round in 0..100 {
        // Releasing the last binding removes the empty directory.
        fs::create_dir_all(leases[0].lock_dir()).unwrap();
        fs::write(&stale, dead.to_string()).unwrap();
        let barrier = Arc::new(Barrier::new(leases.len()));
        let handles: Vec<_> = leases
            .iter()
            .cloned()
            .map(|lease| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    lease.acquire().is_ok()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(granted, 1, "round {round}: capacity-1 lease granted {granted} times");

        for lease in &leases {
            if lease.current().is_some() {
                lease.release().unwrap();
            }
        }
        assert!(!stale.exists());
        assert!(!leases[0].lock_dir().join("0.0.lock.reclaim").exists());
    }
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_soft_lock_held_by_live_process_is_respected() {
    let root = scratch_root();
    let lease = Lease::new(
        "gpu",
        1,
        1,
        LeaseOptions::new(&root)
            .with_lock_mode(LockMode::Soft)
            .with_scope(WorkerScope::Process),
    )
    .unwrap();

    let held = lease.lock_file_path(0, 0);
    fs::create_dir_all(lease.lock_dir()).unwrap();
    // Our own pid is certainly alive.
    fs::write(&held, std::process::id().to_string()).unwrap();

    assert!(matches!(
        lease.acquire(),
        Err(LeaseError::ResourceExhausted { .. })
    ));
    assert!(held.exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_dropping_process_scoped_lease_frees_slot() {
    let root = scratch_root();
    let options = hard_options(&root).with_scope(WorkerScope::Process);
    let first = Lease::new("gpu", 1, 1, options.clone()).unwrap();
    first.acquire().unwrap();
    let path = first.lock_file_path(0, 0);
    assert!(path.exists());

    drop(first);
    assert!(!path.exists());

    let second = Lease::new("gpu", 1, 1, options).unwrap();
    assert_eq!(second.acquire().unwrap(), SlotId::Index(0));
    second.release().unwrap();
    let _ = fs::remove_dir_all(root);
}

// ============================================================================
// REGISTRY
// ============================================================================

#[test]
fn test_registry_hands_out_shared_lease() {
    let root = scratch_root();
    let registry = Arc::new(LeaseRegistry::new());
    registry.register("gpu", 1, 1, hard_options(&root)).unwrap();

    let worker_registry = Arc::clone(&registry);
    let held_by_worker = thread::spawn(move || {
        let lease = worker_registry.get("gpu").unwrap();
        let slot = lease.acquire().unwrap();
        // Same worker, same binding through a second lookup.
        assert_eq!(worker_registry.get("gpu").unwrap().acquire().unwrap(), slot);
        lease.ref_count()
    })
    .join()
    .unwrap();
    assert_eq!(held_by_worker, 2);

    assert!(matches!(
        registry.register("gpu", 2, 1, hard_options(&root)),
        Err(LeaseError::AlreadyRegistered(_))
    ));
    let _ = fs::remove_dir_all(root);
}
