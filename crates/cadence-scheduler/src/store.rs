//! Schedule persistence

use async_trait::async_trait;
use cadence_core::{Classify, ErrorClass};
use cadence_queue::QueueError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::cron::CronError;
use crate::schedule::{Schedule, ScheduleId};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Schedule not found: {0}")]
    NotFound(ScheduleId),
    #[error("Schedule already exists: {0}")]
    AlreadyExists(ScheduleId),
    #[error("Invalid cron expression: {0}")]
    InvalidCron(#[from] CronError),
    #[error("Invalid schedule: {0}")]
    Invalid(String),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Classify for ScheduleError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Storage(_) => ErrorClass::Transient,
            Self::Queue(e) => e.class(),
            _ => ErrorClass::Fatal,
        }
    }
}

/// Durable home for schedules
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert(&self, schedule: &Schedule) -> Result<(), ScheduleError>;

    async fn get(&self, id: ScheduleId) -> Result<Schedule, ScheduleError>;

    /// Ordered by creation time
    async fn list(&self) -> Result<Vec<Schedule>, ScheduleError>;

    /// Overwrite an existing schedule
    async fn update(&self, schedule: &Schedule) -> Result<(), ScheduleError>;

    async fn delete(&self, id: ScheduleId) -> Result<(), ScheduleError>;

    /// Enabled, active schedules whose `next_run_at <= now`, earliest first
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, ScheduleError> {
        let mut due: Vec<_> = self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.is_due(now))
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }
}

/// In-memory schedule store (for testing)
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    schedules: RwLock<HashMap<ScheduleId, Schedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, schedule: &Schedule) -> Result<(), ScheduleError> {
        let mut map = self.schedules.write();
        if map.contains_key(&schedule.id) {
            return Err(ScheduleError::AlreadyExists(schedule.id));
        }
        map.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get(&self, id: ScheduleId) -> Result<Schedule, ScheduleError> {
        self.schedules
            .read()
            .get(&id)
            .cloned()
            .ok_or(ScheduleError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<Schedule>, ScheduleError> {
        let mut all: Vec<_> = self.schedules.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn update(&self, schedule: &Schedule) -> Result<(), ScheduleError> {
        let mut map = self.schedules.write();
        match map.get_mut(&schedule.id) {
            Some(existing) => {
                *existing = schedule.clone();
                Ok(())
            }
            None => Err(ScheduleError::NotFound(schedule.id)),
        }
    }

    async fn delete(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        self.schedules
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(ScheduleError::NotFound(id))
    }
}
