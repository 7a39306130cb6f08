//! Storage error type and conversions into each layer's error

use cadence_core::{Classify, ErrorClass};
use cadence_queue::QueueError;
use cadence_runtime::RuntimeError;
use cadence_scheduler::ScheduleError;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    /// A stored value that no longer maps onto the domain model
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl StorageError {
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .map(|e| e.is_unique_violation())
            .unwrap_or(false)
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row".into()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Corrupt(err.to_string())
            }
            other => Self::Query(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Classify for StorageError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Connection(_) | Self::Query(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<StorageError> for QueueError {
    fn from(err: StorageError) -> Self {
        QueueError::Backend(err.to_string())
    }
}

impl From<StorageError> for ScheduleError {
    fn from(err: StorageError) -> Self {
        ScheduleError::Storage(err.to_string())
    }
}

impl From<StorageError> for RuntimeError {
    fn from(err: StorageError) -> Self {
        RuntimeError::Storage(err.to_string())
    }
}

pub(crate) fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn opt_ms(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(to_ms)
}

pub(crate) fn from_ms(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp {ms} out of range")))
}

pub(crate) fn from_opt_ms(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StorageError> {
    ms.map(from_ms).transpose()
}

pub(crate) fn parse_uuid(s: &str) -> Result<uuid::Uuid, StorageError> {
    uuid::Uuid::parse_str(s).map_err(|_| StorageError::Corrupt(format!("invalid uuid '{s}'")))
}
