//! Lease and executor configuration structures.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::executor::{ConcurrencyModel, PoolOptions};
use crate::core::lease::{LeaseOptions, LockMode, SlotId, Slots, PROCESSING_ROOT_ENV};
use crate::core::remote::{MonitorMode, RemoteExecutorOptions, DEFAULT_UPDATE_DELAY};
use crate::core::storage::WorkerScope;
use crate::core::ConfigError;

/// Environment variable selecting the executor kind.
pub const EXECUTOR_ENV: &str = "LEASE_EXECUTOR";

const DEFAULT_QUEUE_DEPTH: usize = 1024;

fn default_processing_root() -> PathBuf {
    std::env::temp_dir()
}

const fn default_repeat() -> usize {
    1
}

const fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

#[allow(clippy::cast_possible_truncation)]
const fn default_update_delay_ms() -> u64 {
    DEFAULT_UPDATE_DELAY.as_millis() as u64
}

/// Slots of a lease: a count or explicit identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotsConfig {
    /// Slots `0..count`.
    Count(usize),
    /// Explicit identifiers, e.g. device names.
    List(Vec<SlotId>),
}

impl SlotsConfig {
    fn is_empty(&self) -> bool {
        match self {
            Self::Count(count) => *count == 0,
            Self::List(list) => list.is_empty(),
        }
    }
}

impl From<&SlotsConfig> for Slots {
    fn from(cfg: &SlotsConfig) -> Self {
        match cfg {
            SlotsConfig::Count(count) => Self::from(*count),
            SlotsConfig::List(list) => Self::from(list.clone()),
        }
    }
}

/// One lease definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease name, used as a directory name.
    pub name: String,
    /// Slots to hand out.
    pub slots: SlotsConfig,
    /// Holders per slot.
    #[serde(default = "default_repeat")]
    pub repeat: usize,
    /// Lock kind selection.
    #[serde(default)]
    pub lock_mode: LockMode,
    /// Worker scope; follows the executor kind when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<WorkerScope>,
}

impl LeaseConfig {
    /// Validate one lease definition.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("lease name must not be empty".into()));
        }
        if self.slots.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "lease `{}` must have at least one slot",
                self.name
            )));
        }
        if self.repeat == 0 {
            return Err(ConfigError::Invalid(format!(
                "lease `{}` repeat must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }

    /// Options for building this lease under `processing_root`, with the
    /// scope defaulting to `fallback`.
    #[must_use]
    pub fn options(&self, processing_root: &std::path::Path, fallback: WorkerScope) -> LeaseOptions {
        LeaseOptions::new(processing_root)
            .with_lock_mode(self.lock_mode)
            .with_scope(self.scope.unwrap_or(fallback))
    }
}

/// Executor selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// [`InlineExecutor`](crate::core::InlineExecutor).
    Inline,
    /// [`SyncExecutor`](crate::core::SyncExecutor).
    Sync,
    /// [`ThreadPoolExecutor`](crate::core::ThreadPoolExecutor).
    #[default]
    ThreadPool,
    /// [`ProcessPoolExecutor`](crate::core::ProcessPoolExecutor).
    ProcessPool,
    /// [`RemoteExecutor`](crate::core::RemoteExecutor).
    Remote,
}

impl ExecutorKind {
    /// Concurrency model of executors of this kind.
    #[must_use]
    pub const fn concurrency(self) -> ConcurrencyModel {
        match self {
            Self::Inline | Self::Sync => ConcurrencyModel::Inline,
            Self::ThreadPool => ConcurrencyModel::Threads,
            Self::ProcessPool => ConcurrencyModel::Processes,
            Self::Remote => ConcurrencyModel::Remote,
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "inline" => Ok(Self::Inline),
            "sync" => Ok(Self::Sync),
            "thread_pool" | "threads" => Ok(Self::ThreadPool),
            "process_pool" | "processes" => Ok(Self::ProcessPool),
            "remote" => Ok(Self::Remote),
            other => Err(ConfigError::Invalid(format!("unknown executor kind `{other}`"))),
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Which executor to build.
    #[serde(default)]
    pub kind: ExecutorKind,
    /// Worker count for pool executors; defaults to the number of CPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    /// Queue depth for pool executors.
    #[serde(default = "default_queue_depth")]
    pub max_queue_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            max_workers: None,
            max_queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl ExecutorConfig {
    /// Effective worker count.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.max_workers.unwrap_or_else(num_cpus::get)
    }

    /// Pool sizing for thread and process pools.
    #[must_use]
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions::new()
            .with_max_workers(self.workers())
            .with_max_queue_depth(self.max_queue_depth)
    }

    /// Validate executor values.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if a size is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == Some(0) {
            return Err(ConfigError::Invalid("max_workers must be greater than 0".into()));
        }
        if self.max_queue_depth == 0 {
            return Err(ConfigError::Invalid("max_queue_depth must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Remote executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Monitor tick interval in milliseconds.
    #[serde(default = "default_update_delay_ms")]
    pub update_delay_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            update_delay_ms: default_update_delay_ms(),
        }
    }
}

impl RemoteConfig {
    /// Monitor tick interval.
    #[must_use]
    pub const fn update_delay(&self) -> Duration {
        Duration::from_millis(self.update_delay_ms)
    }

    /// Executor options with a background monitor.
    #[must_use]
    pub const fn options(&self) -> RemoteExecutorOptions {
        RemoteExecutorOptions {
            update_delay: self.update_delay(),
            monitor: MonitorMode::Background,
        }
    }

    /// Validate remote values.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if the tick interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_delay_ms == 0 {
            return Err(ConfigError::Invalid("update_delay_ms must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Base directory for lock files.
    #[serde(default = "default_processing_root")]
    pub processing_root: PathBuf,
    /// Leases to register.
    #[serde(default)]
    pub leases: Vec<LeaseConfig>,
    /// Executor to build.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Remote executor parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            processing_root: default_processing_root(),
            leases: Vec::new(),
            executor: ExecutorConfig::default(),
            remote: None,
        }
    }
}

impl Settings {
    /// Validate every section and ensure lease names are unique.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for lease in &self.leases {
            lease.validate()?;
            if !seen.insert(lease.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "lease `{}` is defined more than once",
                    lease.name
                )));
            }
        }
        self.executor.validate()?;
        if let Some(remote) = &self.remote {
            remote.validate()?;
        }
        Ok(())
    }

    /// Parse settings from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed JSON, [`ConfigError::Invalid`] on
    /// failed validation.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overridden by the environment, after loading `.env` if present.
    ///
    /// Reads [`PROCESSING_ROOT_ENV`] and [`EXECUTOR_ENV`].
    ///
    /// # Errors
    ///
    /// [`ConfigError::Env`] if a variable is set but unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();

        let mut settings = Self::default();
        if let Some(root) = std::env::var_os(PROCESSING_ROOT_ENV) {
            if root.is_empty() {
                return Err(ConfigError::Env {
                    key: PROCESSING_ROOT_ENV.to_string(),
                    reason: "must not be empty".into(),
                });
            }
            settings.processing_root = PathBuf::from(root);
        }
        match std::env::var(EXECUTOR_ENV) {
            Ok(raw) => {
                settings.executor.kind = raw.parse().map_err(|e: ConfigError| ConfigError::Env {
                    key: EXECUTOR_ENV.to_string(),
                    reason: e.to_string(),
                })?;
            }
            Err(std::env::VarError::NotPresent) => {}
            Err(e) => {
                return Err(ConfigError::Env {
                    key: EXECUTOR_ENV.to_string(),
                    reason: e.to_string(),
                })
            }
        }
        if settings.executor.kind == ExecutorKind::Remote && settings.remote.is_none() {
            settings.remote = Some(RemoteConfig::default());
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Scope leases get when their definition does not name one.
    #[must_use]
    pub const fn default_scope(&self) -> WorkerScope {
        self.executor.kind.concurrency().worker_scope()
    }
}
