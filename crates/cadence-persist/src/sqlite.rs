//! SQLite connection setup

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use cadence_core::{SharedClock, SystemClock};

use crate::breakers::SqliteBreakerStore;
use crate::error::StorageError;
use crate::queue::SqliteQueueBackend;
use crate::schedules::SqliteScheduleStore;
use crate::workflows::SqliteWorkflowStore;

/// SQLite configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database URL (e.g. "sqlite:cadence.db" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// WAL journal lets readers proceed while a claim writes
    pub wal_mode: bool,
    pub foreign_keys: bool,
    pub busy_timeout_secs: u64,
    pub create_if_missing: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:cadence.db".to_string(),
            max_connections: 5,
            wal_mode: true,
            foreign_keys: true,
            busy_timeout_secs: 30,
            create_if_missing: true,
        }
    }
}

impl SqliteConfig {
    /// In-memory database (testing). A single connection keeps every
    /// query on the same database.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
            ..Default::default()
        }
    }

    /// Database file at `path`, created if missing
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            url: format!("sqlite:{}", path.as_ref().display()),
            ..Default::default()
        }
    }
}

/// Connection pool plus factories for every store
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    clock: SharedClock,
}

impl SqliteBackend {
    /// Connect with default options
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let config = SqliteConfig {
            url: url.to_string(),
            ..Default::default()
        };
        Self::connect(config).await
    }

    /// Open the pool, apply pragmas and run pending migrations
    pub async fn connect(config: SqliteConfig) -> Result<Self, StorageError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .create_if_missing(config.create_if_missing)
            .foreign_keys(config.foreign_keys)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        if config.wal_mode {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        info!(
            url = %config.url,
            wal = config.wal_mode,
            max_connections = config.max_connections,
            "Connected to SQLite"
        );

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        Ok(Self {
            pool,
            clock: SystemClock::shared(),
        })
    }

    /// Use `clock` for timestamps written by the stores built from here
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn is_healthy(&self) -> bool {
        !self.pool.is_closed()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn queue(&self) -> Arc<SqliteQueueBackend> {
        Arc::new(SqliteQueueBackend::with_clock(self.pool.clone(), self.clock.clone()))
    }

    pub fn schedules(&self) -> Arc<SqliteScheduleStore> {
        Arc::new(SqliteScheduleStore::new(self.pool.clone()))
    }

    pub fn workflows(&self) -> Arc<SqliteWorkflowStore> {
        Arc::new(SqliteWorkflowStore::new(self.pool.clone()))
    }

    pub fn breakers(&self) -> Arc<SqliteBreakerStore> {
        Arc::new(SqliteBreakerStore::with_clock(self.pool.clone(), self.clock.clone()))
    }
}
