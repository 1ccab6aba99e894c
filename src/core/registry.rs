//! Directory of leases by name.
//!
//! Populate the registry before creating any executor whose workers look
//! leases up: bindings are resolved per worker at acquire time, and a lease
//! registered while a pool is already running is only seen by workers that
//! look it up afterwards.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;
use tracing::debug;

use crate::core::lease::{Lease, LeaseOptions, Slots};
use crate::core::LeaseError;

/// Name → [`Lease`] map, write-once per name.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    leases: RwLock<HashMap<String, Lease>>,
}

impl LeaseRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default registry.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<LeaseRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Build a lease and register it under `name`.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::AlreadyRegistered`] if `name` is taken
    /// - any error from [`Lease::new`]
    pub fn register(
        &self,
        name: &str,
        slots: impl Into<Slots>,
        repeat: usize,
        options: LeaseOptions,
    ) -> Result<Lease, LeaseError> {
        // Hold the write lock across construction so two registrations of the
        // same name cannot both build a lease.
        let mut leases = self.leases.write();
        if leases.contains_key(name) {
            return Err(LeaseError::AlreadyRegistered(name.to_string()));
        }
        let lease = Lease::new(name, slots, repeat, options)?;
        leases.insert(name.to_string(), lease.clone());
        debug!(lease = %name, "lease registered");
        Ok(lease)
    }

    /// Register an already-built lease under its own name.
    ///
    /// # Errors
    ///
    /// [`LeaseError::AlreadyRegistered`] if the name is taken.
    pub fn insert(&self, lease: Lease) -> Result<(), LeaseError> {
        let mut leases = self.leases.write();
        if leases.contains_key(lease.name()) {
            return Err(LeaseError::AlreadyRegistered(lease.name().to_string()));
        }
        leases.insert(lease.name().to_string(), lease);
        Ok(())
    }

    /// Look up a lease.
    ///
    /// # Errors
    ///
    /// [`LeaseError::NotFound`] if nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Lease, LeaseError> {
        self.leases
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LeaseError::NotFound(name.to_string()))
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.leases.read().contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.leases.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered leases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.leases.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leases.read().is_empty()
    }

    /// Unregister a lease, returning it.
    ///
    /// Handles already given out stay valid; bindings they hold are not
    /// released.
    pub fn remove(&self, name: &str) -> Option<Lease> {
        self.leases.write().remove(name)
    }
}
