//! Job definitions and state transitions

use cadence_core::{Classify, ErrorClass};
use cadence_resilience::RetryPolicy;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Job Identifier
pub type JobId = Uuid;

/// Queue used when a submission does not name one
pub const DEFAULT_QUEUE: &str = "default";

/// Upper bound on the backoff between job attempts
pub const MAX_JOB_BACKOFF_MS: u64 = 60 * 60 * 1_000;

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in queue (possibly not yet visible)
    Queued,
    /// Claimed by exactly one worker
    Running,
    /// Successfully completed
    Completed,
    /// Fatal failure, never retried
    Failed,
    /// Retry budget exhausted
    DeadLettered,
    /// Cancelled by an operator
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "dead_lettered" | "dead_letter" => Some(Self::DeadLettered),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::DeadLettered | Self::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub workflow_id: String,
    pub payload: serde_json::Value,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Duplicate submissions with the same key coalesce onto one job
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub schedule_id: Option<Uuid>,
    /// Not claimable before this instant
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

impl NewJob {
    pub fn new(workflow_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            payload,
            queue: default_queue(),
            priority: 0,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            idempotency_key: None,
            schedule_id: None,
            run_at: None,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff_base_ms(mut self, backoff_base_ms: u64) -> Self {
        self.backoff_base_ms = backoff_base_ms;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn for_schedule(mut self, schedule_id: Uuid) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn into_entry(self, id: JobId, now: DateTime<Utc>) -> JobEntry {
        JobEntry {
            id,
            workflow_id: self.workflow_id,
            queue: self.queue,
            payload: self.payload,
            priority: self.priority,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: self.max_attempts.max(1),
            backoff_base_ms: self.backoff_base_ms,
            progress: 0,
            created_at: now,
            updated_at: now,
            visible_after: self.run_at.unwrap_or(now).max(now),
            started_at: None,
            completed_at: None,
            owner: None,
            lease_expires_at: None,
            last_error: None,
            error_history: Vec::new(),
            result: None,
            idempotency_key: self.idempotency_key,
            schedule_id: self.schedule_id,
            cancel_requested: false,
        }
    }
}

/// One recorded failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub attempt: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// A persisted job entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: JobId,
    pub workflow_id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: JobStatus,
    /// Failed (or abandoned) executions so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub visible_after: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_history: Vec<JobFailure>,
    pub result: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub schedule_id: Option<Uuid>,
    pub cancel_requested: bool,
}

impl JobEntry {
    /// Whether `worker_id` currently holds the claim
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.owner.as_deref() == Some(worker_id)
    }

    /// Backoff before the next attempt, from the retry policy formula
    pub fn retry_delay(&self) -> Duration {
        RetryPolicy {
            base_delay_ms: self.backoff_base_ms,
            max_delay_ms: MAX_JOB_BACKOFF_MS,
            jitter_ratio: 0.1,
            ..Default::default()
        }
        .delay_for(self.attempts)
    }

    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>, lease: Duration) {
        self.status = JobStatus::Running;
        self.owner = Some(worker_id.to_string());
        self.started_at = Some(now);
        self.lease_expires_at = Some(deadline_after(now, lease));
        self.updated_at = now;
    }

    pub fn complete(&mut self, now: DateTime<Utc>, result: Option<serde_json::Value>) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = result;
        self.completed_at = Some(now);
        self.release(now);
    }

    /// Record a failed attempt.
    ///
    /// Fatal errors end the job as `Failed`. Retryable ones requeue it with
    /// backoff until `attempts` reaches `max_attempts`, then dead-letter it.
    pub fn fail(&mut self, now: DateTime<Utc>, error: &str, retryable: bool) {
        self.record_attempt(now, error);
        if !retryable {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
        } else if self.attempts >= self.max_attempts {
            self.status = JobStatus::DeadLettered;
            self.completed_at = Some(now);
        } else {
            self.status = JobStatus::Queued;
            self.visible_after = deadline_after(now, self.retry_delay());
        }
        self.release(now);
    }

    /// Requeue a job whose worker vanished (crash or lease expiry).
    /// Counts as a failed attempt but becomes visible immediately.
    pub fn requeue_abandoned(&mut self, now: DateTime<Utc>, reason: &str) {
        self.record_attempt(now, reason);
        if self.attempts >= self.max_attempts {
            self.status = JobStatus::DeadLettered;
            self.completed_at = Some(now);
        } else {
            self.status = JobStatus::Queued;
            self.visible_after = now;
        }
        self.release(now);
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.cancel_requested = true;
        self.release(now);
    }

    fn record_attempt(&mut self, now: DateTime<Utc>, error: &str) {
        self.attempts += 1;
        self.last_error = Some(error.to_string());
        self.error_history.push(JobFailure {
            attempt: self.attempts,
            error: error.to_string(),
            at: now,
        });
    }

    fn release(&mut self, now: DateTime<Utc>) {
        self.owner = None;
        self.lease_expires_at = None;
        self.updated_at = now;
    }
}

/// Outcome a handler reports for a failed job
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn message(&self) -> String {
        match self {
            Self::Retryable(m) | Self::Fatal(m) => m.clone(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

impl Classify for JobError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Retryable(_) => ErrorClass::Transient,
            Self::Fatal(_) | Self::Cancelled => ErrorClass::Fatal,
        }
    }
}

/// Listing filter for introspection
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub workflow_id: Option<String>,
    pub queue: Option<String>,
    pub schedule_id: Option<Uuid>,
    /// 0 means no limit
    pub limit: usize,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &JobEntry) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.workflow_id.as_deref().map_or(true, |w| job.workflow_id == w)
            && self.queue.as_deref().map_or(true, |q| job.queue == q)
            && self.schedule_id.map_or(true, |s| job.schedule_id == Some(s))
    }
}

/// `now + d`, saturating at the latest representable instant
pub fn deadline_after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(max_attempts: u32) -> JobEntry {
        NewJob::new("wf", json!({}))
            .with_max_attempts(max_attempts)
            .with_backoff_base_ms(1_000)
            .into_entry(Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn test_retryable_failures_dead_letter_at_max_attempts() {
        let now = Utc::now();
        let mut job = entry(3);

        for expected in 1..=2 {
            job.claim("w", now, Duration::from_secs(30));
            job.fail(now, "boom", true);
            assert_eq!(job.status, JobStatus::Queued);
            assert_eq!(job.attempts, expected);
            assert!(job.visible_after > now);
            assert!(job.owner.is_none());
        }

        job.claim("w", now, Duration::from_secs(30));
        job.fail(now, "boom", true);
        assert_eq!(job.status, JobStatus::DeadLettered);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error_history.len(), 3);
    }

    #[test]
    fn test_fatal_failure_is_terminal_immediately() {
        let now = Utc::now();
        let mut job = entry(5);
        job.claim("w", now, Duration::from_secs(30));
        job.fail(now, "invalid payload", false);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("invalid payload"));
    }

    #[test]
    fn test_abandoned_job_is_visible_immediately() {
        let now = Utc::now();
        let mut job = entry(3);
        job.claim("w", now, Duration::from_secs(30));
        job.requeue_abandoned(now, "worker lost");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.visible_after, now);
    }

    #[test]
    fn test_absurd_lease_saturates() {
        let now = Utc::now();
        let mut job = entry(3);
        job.claim("w", now, Duration::MAX);
        assert_eq!(job.lease_expires_at, Some(DateTime::<Utc>::MAX_UTC));
        assert_eq!(
            deadline_after(now, Duration::from_secs(90)),
            now + ChronoDuration::seconds(90)
        );
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::DeadLettered,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_job_backoff_grows() {
        let mut job = entry(10);
        job.attempts = 1;
        let first = job.retry_delay();
        job.attempts = 4;
        let fourth = job.retry_delay();
        assert!(first <= Duration::from_millis(1_100));
        assert!(fourth >= Duration::from_millis(7_200));
    }
}
