//! # Cadence Persistence
//!
//! SQLite implementations of every Cadence store:
//! - [`SqliteQueueBackend`]: jobs, with atomic claims and leases
//! - [`SqliteScheduleStore`]: cron schedules
//! - [`SqliteWorkflowStore`]: workflow definitions and run history
//! - [`SqliteBreakerStore`]: circuit breaker snapshots
//!
//! [`SqliteBackend`] owns the pool, runs the embedded migrations and hands
//! out stores that share it.

pub mod breakers;
pub mod error;
pub mod queue;
pub mod schedules;
pub mod sqlite;
pub mod workflows;

pub use breakers::SqliteBreakerStore;
pub use error::StorageError;
pub use queue::SqliteQueueBackend;
pub use schedules::SqliteScheduleStore;
pub use sqlite::{SqliteBackend, SqliteConfig};
pub use workflows::SqliteWorkflowStore;
