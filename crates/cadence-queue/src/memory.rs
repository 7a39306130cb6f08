//! In-memory queue implementation with priority scheduling

use async_trait::async_trait;
use cadence_core::{Clock, SharedClock, SystemClock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use crate::backend::{Enqueued, QueueBackend, QueueError};
use crate::job::{JobEntry, JobFilter, JobId, JobStatus, NewJob};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, JobEntry>,
    /// Insertion order, used as the final tie-break when claiming
    sequence: HashMap<JobId, u64>,
    idempotency: HashMap<String, JobId>,
    next_seq: u64,
}

impl State {
    fn owned_mut(&mut self, id: JobId, worker_id: &str) -> Result<&mut JobEntry, QueueError> {
        let job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if !job.is_owned_by(worker_id) {
            return Err(QueueError::LeaseLost {
                id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(job)
    }
}

/// Process-local backend. State is lost on restart; use the SQLite backend
/// for durability.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    state: Arc<RwLock<State>>,
    clock: SharedClock,
    notify: Arc<Notify>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_clock(SystemClock::shared())
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            clock,
            notify: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Enqueued, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = state.idempotency.get(key) {
                tracing::debug!(job_id = %existing, idempotency_key = %key, "Coalesced duplicate submission");
                return Ok(Enqueued {
                    id: *existing,
                    deduplicated: true,
                });
            }
        }

        let id = Uuid::new_v4();
        let entry = job.into_entry(id, now);
        if let Some(key) = &entry.idempotency_key {
            state.idempotency.insert(key.clone(), id);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.sequence.insert(id, seq);
        state.jobs.insert(id, entry);
        drop(state);

        self.notify.notify_waiters();
        Ok(Enqueued {
            id,
            deduplicated: false,
        })
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobEntry>, QueueError> {
        let now = self.clock.now();
        // The write lock makes select-and-mark a single step
        let mut state = self.state.write().await;

        let candidate = state
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.status == JobStatus::Queued && j.visible_after <= now)
            .min_by_key(|j| {
                (
                    std::cmp::Reverse(j.priority),
                    j.visible_after,
                    state.sequence.get(&j.id).copied().unwrap_or(u64::MAX),
                )
            })
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.claim(worker_id, now, lease);
        Ok(Some(job.clone()))
    }

    async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<JobEntry, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let job = state.owned_mut(id, worker_id)?;
        job.complete(now, result);
        Ok(job.clone())
    }

    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<JobEntry, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let job = state.owned_mut(id, worker_id)?;
        job.fail(now, error, retryable);
        Ok(job.clone())
    }

    async fn cancel(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        match job.status {
            JobStatus::Queued => job.cancel(now),
            JobStatus::Running => {
                job.cancel_requested = true;
                job.updated_at = now;
            }
            from => {
                return Err(QueueError::InvalidTransition {
                    id,
                    from,
                    to: JobStatus::Cancelled,
                })
            }
        }
        Ok(job.clone())
    }

    async fn mark_cancelled(&self, id: JobId, worker_id: &str) -> Result<JobEntry, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let job = state.owned_mut(id, worker_id)?;
        job.cancel(now);
        Ok(job.clone())
    }

    async fn is_cancel_requested(&self, id: JobId) -> Result<bool, QueueError> {
        let state = self.state.read().await;
        let job = state.jobs.get(&id).ok_or(QueueError::NotFound(id))?;
        Ok(job.cancel_requested)
    }

    async fn extend_lease(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let job = state.owned_mut(id, worker_id)?;
        job.lease_expires_at = Some(crate::job::deadline_after(now, lease));
        job.updated_at = now;
        Ok(())
    }

    async fn set_progress(
        &self,
        id: JobId,
        worker_id: &str,
        progress: u8,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let job = state.owned_mut(id, worker_id)?;
        job.progress = progress.min(100);
        job.updated_at = now;
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<Vec<JobEntry>, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let mut reclaimed = Vec::new();
        for job in state.jobs.values_mut() {
            let expired = job.status == JobStatus::Running
                && job.lease_expires_at.map_or(true, |at| at <= now);
            if expired {
                job.requeue_abandoned(now, "lease expired");
                reclaimed.push(job.clone());
            }
        }
        drop(state);
        if !reclaimed.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn recover_abandoned(&self) -> Result<Vec<JobEntry>, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let mut recovered = Vec::new();
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Running {
                job.requeue_abandoned(now, "worker did not finish before restart");
                recovered.push(job.clone());
            }
        }
        Ok(recovered)
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let state = self.state.read().await;
        state.jobs.get(&id).cloned().ok_or(QueueError::NotFound(id))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobEntry>, QueueError> {
        let state = self.state.read().await;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.created_at.cmp(&a.created_at).then_with(|| {
                let seq = |id: &JobId| state.sequence.get(id).copied().unwrap_or(0);
                seq(&b.id).cmp(&seq(&a.id))
            })
        });
        if filter.limit > 0 {
            jobs.truncate(filter.limit);
        }
        Ok(jobs)
    }

    fn notifier(&self) -> Option<Arc<Notify>> {
        Some(self.notify.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{Clock, ManualClock};
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    fn queue() -> (MemoryQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (MemoryQueue::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_enqueue_claim() {
        let (queue, _) = queue();
        let enqueued = queue
            .enqueue(NewJob::new("lead-import", json!({ "foo": "bar" })))
            .await
            .unwrap();
        assert_eq!(queue.get_status(enqueued.id).await.unwrap(), JobStatus::Queued);

        let job = queue
            .claim_next("default", "w-1", LEASE)
            .await
            .unwrap()
            .expect("Should have job");
        assert_eq!(job.id, enqueued.id);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.owner.as_deref(), Some("w-1"));

        assert!(queue.claim_next("default", "w-2", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_job_is_invisible_until_due() {
        let (queue, clock) = queue();
        let at = clock.now() + chrono::Duration::seconds(5);
        let enqueued = queue
            .enqueue(NewJob::new("delayed", json!({})).run_at(at))
            .await
            .unwrap();

        assert!(queue.claim_next("default", "w", LEASE).await.unwrap().is_none());
        clock.advance(chrono::Duration::seconds(5));
        let job = queue.claim_next("default", "w", LEASE).await.unwrap().unwrap();
        assert_eq!(job.id, enqueued.id);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let (queue, _) = queue();
        let low = queue.enqueue(NewJob::new("a", json!(1))).await.unwrap().id;
        let high = queue
            .enqueue(NewJob::new("b", json!(2)).with_priority(10))
            .await
            .unwrap()
            .id;
        let low_second = queue.enqueue(NewJob::new("c", json!(3))).await.unwrap().id;

        let order: Vec<_> = [
            queue.claim_next("default", "w", LEASE).await.unwrap().unwrap().id,
            queue.claim_next("default", "w", LEASE).await.unwrap().unwrap().id,
            queue.claim_next("default", "w", LEASE).await.unwrap().unwrap().id,
        ]
        .to_vec();
        assert_eq!(order, vec![high, low, low_second]);
    }

    #[tokio::test]
    async fn test_idempotency_key_coalesces() {
        let (queue, _) = queue();
        let first = queue
            .enqueue(NewJob::new("wf", json!({})).with_idempotency_key("schedule:1:100"))
            .await
            .unwrap();
        let second = queue
            .enqueue(NewJob::new("wf", json!({})).with_idempotency_key("schedule:1:100"))
            .await
            .unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.id, second.id);
        assert_eq!(queue.list_jobs(&JobFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_only_owner_can_settle() {
        let (queue, _) = queue();
        let id = queue.enqueue(NewJob::new("wf", json!({}))).await.unwrap().id;
        queue.claim_next("default", "w-1", LEASE).await.unwrap();

        let err = queue.complete(id, "w-2", None).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { .. }));

        let done = queue.complete(id, "w-1", Some(json!("ok"))).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_and_stale_worker_rejected() {
        let (queue, clock) = queue();
        let id = queue.enqueue(NewJob::new("wf", json!({}))).await.unwrap().id;
        queue.claim_next("default", "w-1", LEASE).await.unwrap();

        clock.advance(chrono::Duration::seconds(10));
        queue.extend_lease(id, "w-1", LEASE).await.unwrap();
        clock.advance(chrono::Duration::seconds(29));
        assert!(queue.reclaim_expired().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(2));
        let reclaimed = queue.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, JobStatus::Queued);
        assert_eq!(reclaimed[0].attempts, 1);

        let again = queue.claim_next("default", "w-2", LEASE).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert!(matches!(
            queue.complete(id, "w-1", None).await,
            Err(QueueError::LeaseLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_absurd_lease_never_expires() {
        let (queue, clock) = queue();
        let id = queue.enqueue(NewJob::new("wf", json!({}))).await.unwrap().id;
        let claimed = queue
            .claim_next("default", "w-1", Duration::MAX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.lease_expires_at, Some(chrono::DateTime::<chrono::Utc>::MAX_UTC));

        queue.extend_lease(id, "w-1", Duration::from_secs(u64::MAX)).await.unwrap();
        clock.advance(chrono::Duration::days(365 * 100));
        assert!(queue.reclaim_expired().await.unwrap().is_empty());
        queue.complete(id, "w-1", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let (queue, _) = queue();
        let queued = queue.enqueue(NewJob::new("wf", json!({}))).await.unwrap().id;
        let cancelled = queue.cancel(queued).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(queue.claim_next("default", "w", LEASE).await.unwrap().is_none());

        let running = queue.enqueue(NewJob::new("wf", json!({}))).await.unwrap().id;
        queue.claim_next("default", "w", LEASE).await.unwrap();
        let requested = queue.cancel(running).await.unwrap();
        assert_eq!(requested.status, JobStatus::Running);
        assert!(queue.is_cancel_requested(running).await.unwrap());

        let stopped = queue.mark_cancelled(running, "w").await.unwrap();
        assert_eq!(stopped.status, JobStatus::Cancelled);
        assert!(matches!(
            queue.cancel(running).await,
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_abandoned_requeues_running() {
        let (queue, _) = queue();
        let id = queue
            .enqueue(NewJob::new("wf", json!({})).with_max_attempts(1))
            .await
            .unwrap()
            .id;
        let other = queue.enqueue(NewJob::new("wf", json!({}))).await.unwrap().id;
        queue.claim_next("default", "w", LEASE).await.unwrap();
        queue.claim_next("default", "w", LEASE).await.unwrap();

        let recovered = queue.recover_abandoned().await.unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(queue.get_status(id).await.unwrap(), JobStatus::DeadLettered);
        assert_eq!(queue.get_status(other).await.unwrap(), JobStatus::Queued);
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);
    }
}
