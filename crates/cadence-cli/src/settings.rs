//! Layered settings: defaults, then a TOML file, then `CADENCE__*` env vars
//!
//! ```toml
//! [storage]
//! backend = "sqlite"
//! sqlite.url = "sqlite:/var/lib/cadence/cadence.db"
//!
//! [scheduler]
//! tick_interval_secs = 30
//!
//! [[workers]]
//! queue = "default"
//! max_concurrency = 8
//! ```
//!
//! Environment keys use `__` between sections:
//! `CADENCE__SCHEDULER__TICK_INTERVAL_SECS=30`.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cadence_persist::SqliteConfig;
use cadence_queue::WorkerConfig;
use cadence_resilience::BreakerConfig;
use cadence_runtime::ExecutorConfig;
use cadence_scheduler::SchedulerConfig;

pub const DEFAULT_FILE_NAME: &str = "cadence.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local; state is lost on exit
    Memory,
    Sqlite,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub sqlite: SqliteConfig,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite: SqliteConfig::default(),
        }
    }
}

/// Intervals of the background maintenance loops run by `serve`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub sweep_interval_ms: u64,
    pub breaker_snapshot_interval_ms: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 15_000,
            breaker_snapshot_interval_ms: 30_000,
        }
    }
}

impl MaintenanceSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }

    pub fn breaker_snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.breaker_snapshot_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub scheduler: SchedulerConfig,
    /// One pool per entry
    pub workers: Vec<WorkerConfig>,
    pub executor: ExecutorConfig,
    /// Defaults for every dependency's circuit breaker
    pub breaker: BreakerConfig,
    pub maintenance: MaintenanceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage: StorageSettings::default(),
            scheduler: SchedulerConfig::default(),
            workers: vec![WorkerConfig::default()],
            executor: ExecutorConfig::default(),
            breaker: BreakerConfig::default(),
            maintenance: MaintenanceSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `path` (required to exist) or the first default
    /// location that exists, with the process environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_file(),
        };
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Loading settings file");
        }
        Self::build(file.as_deref(), env_source())
    }

    pub fn build(file: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            if !file.exists() {
                bail!("Settings file not found: {}", file.display());
            }
            builder = builder.add_source(File::from(file).format(FileFormat::Toml));
        }
        let settings: Settings = builder
            .add_source(env)
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Invalid settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            bail!("At least one worker pool must be configured");
        }
        let mut queues = HashSet::new();
        for pool in &self.workers {
            if pool.queue.trim().is_empty() {
                bail!("Worker pool queue name must not be empty");
            }
            if pool.max_concurrency == 0 {
                bail!("Worker pool '{}' needs max_concurrency > 0", pool.queue);
            }
            if !queues.insert(pool.queue.as_str()) {
                bail!("Queue '{}' has more than one worker pool", pool.queue);
            }
        }
        if self.scheduler.tick_interval_secs == 0 {
            bail!("scheduler.tick_interval_secs must be > 0");
        }
        if self.scheduler.failure_threshold == 0 {
            bail!("scheduler.failure_threshold must be > 0");
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite.url.trim().is_empty() {
            bail!("storage.sqlite.url must be set for the sqlite backend");
        }
        Ok(())
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("CADENCE")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// `./cadence.toml`, then `<config dir>/cadence/cadence.toml`
fn default_file() -> Option<PathBuf> {
    let local = PathBuf::from(DEFAULT_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("cadence").join(DEFAULT_FILE_NAME))
        .filter(|p| p.exists())
}
