//! Schedule records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ScheduleId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    /// Too many consecutive failures; waits for `retry`
    Failed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted recurring trigger.
///
/// `next_run_at` is set exactly when the schedule is enabled and active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: Option<String>,
    pub workflow_id: String,
    /// Five-field cron expression, evaluated in UTC
    pub cron: String,
    /// Parameters handed to every job this schedule produces
    pub payload: serde_json::Value,
    pub queue: String,
    pub status: ScheduleStatus,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub last_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Enabled, active and due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.status == ScheduleStatus::Active
            && self.next_run_at.is_some_and(|at| at <= now)
    }

    pub fn is_armed(&self) -> bool {
        self.enabled && self.status == ScheduleStatus::Active
    }
}

/// Registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub workflow_id: String,
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub queue: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl NewSchedule {
    pub fn new(workflow_id: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            cron: cron.into(),
            enabled: true,
            name: None,
            payload: serde_json::Value::Null,
            queue: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulePatch {
    pub cron: Option<String>,
    pub enabled: Option<bool>,
    pub status: Option<ScheduleStatus>,
    pub name: Option<String>,
    pub workflow_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub queue: Option<String>,
}

impl SchedulePatch {
    pub fn is_empty(&self) -> bool {
        self.cron.is_none()
            && self.enabled.is_none()
            && self.status.is_none()
            && self.name.is_none()
            && self.workflow_id.is_none()
            && self.payload.is_none()
            && self.queue.is_none()
    }
}
