//! Build lease registries from configuration.

use tracing::info;

use crate::config::Settings;
use crate::core::{LeaseError, LeaseRegistry, Slots};

/// Register every lease declared in `settings` into `registry`.
///
/// Leases without an explicit scope follow the configured executor kind.
/// Call this before building the executor whose workers use the leases.
///
/// # Errors
///
/// - [`LeaseError::InvalidSpec`] if the settings fail validation
/// - any error from [`LeaseRegistry::register`]
pub fn register_leases(registry: &LeaseRegistry, settings: &Settings) -> Result<(), LeaseError> {
    settings
        .validate()
        .map_err(|e| LeaseError::InvalidSpec(format!("config invalid: {e}")))?;

    let scope = settings.default_scope();
    for lease in &settings.leases {
        registry.register(
            &lease.name,
            Slots::from(&lease.slots),
            lease.repeat,
            lease.options(&settings.processing_root, scope),
        )?;
    }
    info!(
        leases = settings.leases.len(),
        root = %settings.processing_root.display(),
        "leases registered from configuration"
    );
    Ok(())
}

/// A fresh registry holding the leases declared in `settings`.
///
/// # Errors
///
/// As [`register_leases`].
pub fn build_registry(settings: &Settings) -> Result<LeaseRegistry, LeaseError> {
    let registry = LeaseRegistry::new();
    register_leases(&registry, settings)?;
    Ok(registry)
}
