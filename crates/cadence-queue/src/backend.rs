//! Queue Backend Trait

use crate::job::{JobEntry, JobFilter, JobId, JobStatus, NewJob};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found: {0}")]
    NotFound(JobId),
    /// The caller no longer owns the job (lease expired and it was reclaimed)
    #[error("Lease lost on job {id} for worker {worker_id}")]
    LeaseLost { id: JobId, worker_id: String },
    #[error("Job {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl cadence_core::Classify for QueueError {
    fn class(&self) -> cadence_core::ErrorClass {
        match self {
            Self::Backend(_) => cadence_core::ErrorClass::Transient,
            _ => cadence_core::ErrorClass::Fatal,
        }
    }
}

/// Result of an enqueue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub id: JobId,
    /// True when an existing job with the same idempotency key was returned
    pub deduplicated: bool,
}

/// Durable job storage.
///
/// Every state change is a conditional transition: a job is claimed only
/// while `queued` and visible, and only the worker named in `owner` can
/// settle a `running` job. Implementations must make claims atomic so
/// concurrent pollers never receive the same job.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a job. A repeated idempotency key returns the existing job.
    async fn enqueue(&self, job: NewJob) -> Result<Enqueued, QueueError>;

    /// Claim the best visible job on `queue`: highest priority first, then
    /// earliest visibility, then insertion order.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobEntry>, QueueError>;

    async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<JobEntry, QueueError>;

    /// Record a failed attempt (requeue with backoff, dead-letter or fail)
    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<JobEntry, QueueError>;

    /// Operator cancellation. Queued jobs are cancelled at once, running
    /// jobs get `cancel_requested` and stop at their next checkpoint.
    async fn cancel(&self, id: JobId) -> Result<JobEntry, QueueError>;

    /// Worker acknowledgement that it stopped a job after a cancel request
    async fn mark_cancelled(&self, id: JobId, worker_id: &str) -> Result<JobEntry, QueueError>;

    async fn is_cancel_requested(&self, id: JobId) -> Result<bool, QueueError>;

    /// Heartbeat: push the lease expiry forward
    async fn extend_lease(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), QueueError>;

    async fn set_progress(&self, id: JobId, worker_id: &str, progress: u8)
        -> Result<(), QueueError>;

    /// Requeue running jobs whose lease expired. Returns the updated entries.
    async fn reclaim_expired(&self) -> Result<Vec<JobEntry>, QueueError>;

    /// Startup recovery: every job still `running` belongs to a dead
    /// process and is requeued. Only safe before workers start.
    async fn recover_abandoned(&self) -> Result<Vec<JobEntry>, QueueError>;

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError>;

    /// Newest first
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobEntry>, QueueError>;

    async fn get_status(&self, id: JobId) -> Result<JobStatus, QueueError> {
        Ok(self.get_job(id).await?.status)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<JobEntry>, QueueError> {
        let filter = JobFilter {
            limit,
            ..JobFilter::with_status(JobStatus::DeadLettered)
        };
        self.list_jobs(&filter).await
    }

    /// Wakes idle pollers on enqueue, when the backend supports it
    fn notifier(&self) -> Option<Arc<Notify>> {
        None
    }
}
