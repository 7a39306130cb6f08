//! Durable queue backend using SQLite
//!
//! Claims are a single `UPDATE … RETURNING` statement, so two pollers can
//! never win the same row. Every other transition loads the job, applies
//! the state machine from `cadence-queue`, and writes it back guarded by a
//! `version` column; a lost race is re-read and re-checked.

use async_trait::async_trait;
use cadence_core::{Clock, SharedClock, SystemClock};
use cadence_queue::{
    deadline_after, Enqueued, JobEntry, JobFailure, JobFilter, JobId, JobStatus, NewJob,
    QueueBackend, QueueError,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::error::{from_ms, from_opt_ms, opt_ms, parse_uuid, to_ms, StorageError};

/// Optimistic write attempts before giving up on a hot row
const MAX_CAS_ATTEMPTS: usize = 8;

pub struct SqliteQueueBackend {
    pool: SqlitePool,
    clock: SharedClock,
    notify: Arc<Notify>,
}

impl SqliteQueueBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, SystemClock::shared())
    }

    pub fn with_clock(pool: SqlitePool, clock: SharedClock) -> Self {
        Self {
            pool,
            clock,
            notify: Arc::new(Notify::new()),
        }
    }

    async fn fetch(&self, id: JobId) -> Result<(JobEntry, i64), QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?
            .ok_or(QueueError::NotFound(id))?;
        let version: i64 = row.try_get("version").map_err(StorageError::from)?;
        Ok((job_from_row(&row)?, version))
    }

    /// Write back `job` if nobody changed the row since `version` was read
    async fn write_back(&self, job: &JobEntry, version: i64) -> Result<bool, QueueError> {
        let history = serde_json::to_string(&job.error_history)?;
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, attempts = ?, progress = ?, updated_at = ?, visible_after = ?,
                started_at = ?, completed_at = ?, owner = ?, lease_expires_at = ?,
                last_error = ?, error_history = ?, result = ?, cancel_requested = ?,
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.attempts as i64)
        .bind(job.progress as i64)
        .bind(to_ms(job.updated_at))
        .bind(to_ms(job.visible_after))
        .bind(opt_ms(job.started_at))
        .bind(opt_ms(job.completed_at))
        .bind(job.owner.as_deref())
        .bind(opt_ms(job.lease_expires_at))
        .bind(job.last_error.as_deref())
        .bind(history)
        .bind(result)
        .bind(job.cancel_requested)
        .bind(job.id.to_string())
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(done.rows_affected() == 1)
    }

    /// Apply `change` with compare-and-swap. `change` returns false to leave
    /// the row untouched. With `owner` set, the caller must hold the claim.
    async fn transition<F>(
        &self,
        id: JobId,
        owner: Option<&str>,
        mut change: F,
    ) -> Result<(JobEntry, bool), QueueError>
    where
        F: FnMut(&mut JobEntry, DateTime<Utc>) -> Result<bool, QueueError>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut job, version) = self.fetch(id).await?;
            if let Some(worker_id) = owner {
                if !job.is_owned_by(worker_id) {
                    return Err(QueueError::LeaseLost {
                        id,
                        worker_id: worker_id.to_string(),
                    });
                }
            }
            if !change(&mut job, self.clock.now())? {
                return Ok((job, false));
            }
            if self.write_back(&job, version).await? {
                return Ok((job, true));
            }
            debug!(job_id = %id, "Concurrent update, retrying transition");
        }
        Err(QueueError::Backend(format!(
            "job {id} kept changing under concurrent updates"
        )))
    }

    /// Ids of running jobs, optionally only those whose lease ended by `expired_at`
    async fn running_ids(&self, expired_at: Option<i64>) -> Result<Vec<JobId>, QueueError> {
        let rows = match expired_at {
            Some(now) => {
                sqlx::query(
                    "SELECT id FROM jobs WHERE status = 'running' \
                     AND (lease_expires_at IS NULL OR lease_expires_at <= ?)",
                )
                .bind(now)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT id FROM jobs WHERE status = 'running'")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(StorageError::from)?;

        rows.iter()
            .map(|r| -> Result<JobId, QueueError> {
                let id: String = r.try_get("id").map_err(StorageError::from)?;
                Ok(parse_uuid(&id)?)
            })
            .collect()
    }
}

fn job_from_row(row: &SqliteRow) -> Result<JobEntry, StorageError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    let history: String = row.try_get("error_history")?;
    let result: Option<String> = row.try_get("result")?;
    let schedule_id: Option<String> = row.try_get("schedule_id")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    let backoff: i64 = row.try_get("backoff_base_ms")?;
    let progress: i64 = row.try_get("progress")?;
    let priority: i64 = row.try_get("priority")?;
    let cancel_requested: i64 = row.try_get("cancel_requested")?;

    Ok(JobEntry {
        id: parse_uuid(&id)?,
        workflow_id: row.try_get("workflow_id")?,
        queue: row.try_get("queue")?,
        payload: serde_json::from_str(&payload)?,
        priority: priority as i32,
        status: JobStatus::parse(&status)
            .ok_or_else(|| StorageError::Corrupt(format!("job status '{status}'")))?,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        backoff_base_ms: backoff as u64,
        progress: progress.clamp(0, 100) as u8,
        created_at: from_ms(row.try_get("created_at")?)?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
        visible_after: from_ms(row.try_get("visible_after")?)?,
        started_at: from_opt_ms(row.try_get("started_at")?)?,
        completed_at: from_opt_ms(row.try_get("completed_at")?)?,
        owner: row.try_get("owner")?,
        lease_expires_at: from_opt_ms(row.try_get("lease_expires_at")?)?,
        last_error: row.try_get("last_error")?,
        error_history: serde_json::from_str::<Vec<JobFailure>>(&history)?,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        idempotency_key: row.try_get("idempotency_key")?,
        schedule_id: schedule_id.as_deref().map(parse_uuid).transpose()?,
        cancel_requested: cancel_requested != 0,
    })
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn enqueue(&self, job: NewJob) -> Result<Enqueued, QueueError> {
        let id = Uuid::new_v4();
        let entry = job.into_entry(id, self.clock.now());

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, workflow_id, queue, payload, priority, status, attempts, max_attempts,
                backoff_base_ms, progress, created_at, updated_at, visible_after,
                error_history, idempotency_key, schedule_id
            )
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, 0, ?, ?, ?, '[]', ?, ?)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(&entry.workflow_id)
        .bind(&entry.queue)
        .bind(serde_json::to_string(&entry.payload)?)
        .bind(entry.priority as i64)
        .bind(entry.status.as_str())
        .bind(entry.max_attempts as i64)
        .bind(entry.backoff_base_ms as i64)
        .bind(to_ms(entry.created_at))
        .bind(to_ms(entry.updated_at))
        .bind(to_ms(entry.visible_after))
        .bind(entry.idempotency_key.as_deref())
        .bind(entry.schedule_id.map(|s| s.to_string()))
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;

        if inserted.rows_affected() == 0 {
            let key = entry.idempotency_key.as_deref().unwrap_or_default();
            let row = sqlx::query("SELECT id FROM jobs WHERE idempotency_key = ?")
                .bind(key)
                .fetch_one(&self.pool)
                .await
                .map_err(StorageError::from)?;
            let existing: String = row.try_get("id").map_err(StorageError::from)?;
            let existing = parse_uuid(&existing)?;
            debug!(job_id = %existing, idempotency_key = %key, "Coalesced duplicate submission");
            return Ok(Enqueued {
                id: existing,
                deduplicated: true,
            });
        }

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
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running',
                owner = ?1,
                started_at = ?2,
                lease_expires_at = ?3,
                updated_at = ?2,
                version = version + 1
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE queue = ?4 AND status = 'queued' AND visible_after <= ?2
                ORDER BY priority DESC, visible_after ASC, seq ASC
                LIMIT 1
            )
            AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(to_ms(now))
        .bind(to_ms(deadline_after(now, lease)))
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;

        row.map(|r| job_from_row(&r).map_err(QueueError::from))
            .transpose()
    }

    async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<JobEntry, QueueError> {
        let (job, _) = self
            .transition(id, Some(worker_id), |job, now| {
                job.complete(now, result.clone());
                Ok(true)
            })
            .await?;
        Ok(job)
    }

    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<JobEntry, QueueError> {
        let (job, _) = self
            .transition(id, Some(worker_id), |job, now| {
                job.fail(now, error, retryable);
                Ok(true)
            })
            .await?;
        Ok(job)
    }

    async fn cancel(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let (job, _) = self
            .transition(id, None, |job, now| {
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
                Ok(true)
            })
            .await?;
        Ok(job)
    }

    async fn mark_cancelled(&self, id: JobId, worker_id: &str) -> Result<JobEntry, QueueError> {
        let (job, _) = self
            .transition(id, Some(worker_id), |job, now| {
                job.cancel(now);
                Ok(true)
            })
            .await?;
        Ok(job)
    }

    async fn is_cancel_requested(&self, id: JobId) -> Result<bool, QueueError> {
        let row = sqlx::query("SELECT cancel_requested FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?
            .ok_or(QueueError::NotFound(id))?;
        let flag: i64 = row.try_get("cancel_requested").map_err(StorageError::from)?;
        Ok(flag != 0)
    }

    async fn extend_lease(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), QueueError> {
        self.transition(id, Some(worker_id), |job, now| {
            job.lease_expires_at = Some(deadline_after(now, lease));
            job.updated_at = now;
            Ok(true)
        })
        .await?;
        Ok(())
    }

    async fn set_progress(
        &self,
        id: JobId,
        worker_id: &str,
        progress: u8,
    ) -> Result<(), QueueError> {
        self.transition(id, Some(worker_id), |job, now| {
            job.progress = progress.min(100);
            job.updated_at = now;
            Ok(true)
        })
        .await?;
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<Vec<JobEntry>, QueueError> {
        let now = to_ms(self.clock.now());
        let ids = self.running_ids(Some(now)).await?;

        let mut reclaimed = Vec::new();
        for id in ids {
            let (job, changed) = self
                .transition(id, None, |job, now| {
                    let expired = job.status == JobStatus::Running
                        && job.lease_expires_at.map_or(true, |at| at <= now);
                    if expired {
                        job.requeue_abandoned(now, "lease expired");
                    }
                    Ok(expired)
                })
                .await?;
            if changed {
                reclaimed.push(job);
            }
        }
        if !reclaimed.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn recover_abandoned(&self) -> Result<Vec<JobEntry>, QueueError> {
        let ids = self.running_ids(None).await?;

        let mut recovered = Vec::new();
        for id in ids {
            let (job, changed) = self
                .transition(id, None, |job, now| {
                    let running = job.status == JobStatus::Running;
                    if running {
                        job.requeue_abandoned(now, "worker did not finish before restart");
                    }
                    Ok(running)
                })
                .await?;
            if changed {
                recovered.push(job);
            }
        }
        Ok(recovered)
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        Ok(self.fetch(id).await?.0)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobEntry>, QueueError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM jobs WHERE 1 = 1");
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(workflow_id) = &filter.workflow_id {
            query.push(" AND workflow_id = ").push_bind(workflow_id.clone());
        }
        if let Some(queue) = &filter.queue {
            query.push(" AND queue = ").push_bind(queue.clone());
        }
        if let Some(schedule_id) = filter.schedule_id {
            query.push(" AND schedule_id = ").push_bind(schedule_id.to_string());
        }
        query.push(" ORDER BY created_at DESC, seq DESC");
        if filter.limit > 0 {
            query.push(" LIMIT ").push_bind(filter.limit as i64);
        }

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;
        rows.iter()
            .map(|r| job_from_row(r).map_err(QueueError::from))
            .collect()
    }

    fn notifier(&self) -> Option<Arc<Notify>> {
        Some(self.notify.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::{SqliteBackend, SqliteConfig};
    use cadence_core::ManualClock;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    async fn queue() -> (Arc<SqliteQueueBackend>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let backend = SqliteBackend::connect(SqliteConfig::memory())
            .await
            .unwrap()
            .with_clock(clock.clone());
        (backend.queue(), clock)
    }

    #[tokio::test]
    async fn test_claim_order_and_exclusivity() {
        let (queue, _) = queue().await;
        let low = queue.enqueue(NewJob::new("wf", json!(1))).await.unwrap().id;
        let high = queue
            .enqueue(NewJob::new("wf", json!(2)).with_priority(5))
            .await
            .unwrap()
            .id;
        let other = queue
            .enqueue(NewJob::new("wf", json!(3)).on_queue("bulk"))
            .await
            .unwrap()
            .id;

        let first = queue.claim_next("default", "w-1", LEASE).await.unwrap().unwrap();
        assert_eq!(first.id, high);
        assert_eq!(first.status, JobStatus::Running);
        assert_eq!(first.owner.as_deref(), Some("w-1"));
        assert!(first.lease_expires_at.is_some());

        let second = queue.claim_next("default", "w-2", LEASE).await.unwrap().unwrap();
        assert_eq!(second.id, low);
        assert!(queue.claim_next("default", "w-3", LEASE).await.unwrap().is_none());

        let bulk = queue.claim_next("bulk", "w-4", LEASE).await.unwrap().unwrap();
        assert_eq!(bulk.id, other);
    }

    #[tokio::test]
    async fn test_idempotent_enqueue() {
        let (queue, _) = queue().await;
        let a = queue
            .enqueue(NewJob::new("wf", json!({})).with_idempotency_key("schedule:x:1"))
            .await
            .unwrap();
        let b = queue
            .enqueue(NewJob::new("wf", json!({})).with_idempotency_key("schedule:x:1"))
            .await
            .unwrap();
        assert!(!a.deduplicated);
        assert!(b.deduplicated);
        assert_eq!(a.id, b.id);
        assert_eq!(queue.list_jobs(&JobFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_backoff_then_dead_letter() {
        let (queue, clock) = queue().await;
        let id = queue
            .enqueue(
                NewJob::new("wf", json!({}))
                    .with_max_attempts(2)
                    .with_backoff_base_ms(10_000),
            )
            .await
            .unwrap()
            .id;

        queue.claim_next("default", "w", LEASE).await.unwrap().unwrap();
        let job = queue.fail(id, "w", "timeout", true).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert!(job.visible_after > clock.now());

        // Backoff hides the job
        assert!(queue.claim_next("default", "w", LEASE).await.unwrap().is_none());
        clock.advance(chrono::Duration::seconds(12));

        queue.claim_next("default", "w", LEASE).await.unwrap().unwrap();
        let job = queue.fail(id, "w", "timeout again", true).await.unwrap();
        assert_eq!(job.status, JobStatus::DeadLettered);
        assert_eq!(job.error_history.len(), 2);

        let stored = queue.get_job(id).await.unwrap();
        assert_eq!(stored.error_history[1].error, "timeout again");
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_owner_cannot_settle() {
        let (queue, clock) = queue().await;
        let id = queue.enqueue(NewJob::new("wf", json!({}))).await.unwrap().id;
        queue.claim_next("default", "w-old", LEASE).await.unwrap().unwrap();

        clock.advance(chrono::Duration::seconds(31));
        let reclaimed = queue.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempts, 1);

        queue.claim_next("default", "w-new", LEASE).await.unwrap().unwrap();
        let err = queue.complete(id, "w-old", None).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { .. }));

        let job = queue.complete(id, "w-new", Some(json!({ "ok": true }))).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(queue.get_job(id).await.unwrap().result, Some(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let (queue, _) = queue().await;
        let queued = queue.enqueue(NewJob::new("wf", json!({}))).await.unwrap().id;
        let job = queue.cancel(queued).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        let running = queue.enqueue(NewJob::new("wf", json!({}))).await.unwrap().id;
        queue.claim_next("default", "w", LEASE).await.unwrap().unwrap();
        queue.cancel(running).await.unwrap();
        assert!(queue.is_cancel_requested(running).await.unwrap());
        assert_eq!(queue.get_status(running).await.unwrap(), JobStatus::Running);

        let job = queue.mark_cancelled(running, "w").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(matches!(
            queue.cancel(running).await,
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (queue, clock) = queue().await;
        let schedule = Uuid::new_v4();
        queue.enqueue(NewJob::new("a", json!({}))).await.unwrap();
        clock.advance(chrono::Duration::milliseconds(5));
        queue
            .enqueue(NewJob::new("b", json!({})).for_schedule(schedule))
            .await
            .unwrap();

        let all = queue.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].workflow_id, "b");

        let by_schedule = JobFilter {
            schedule_id: Some(schedule),
            ..Default::default()
        };
        let jobs = queue.list_jobs(&by_schedule).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].schedule_id, Some(schedule));

        let by_workflow = JobFilter {
            workflow_id: Some("a".into()),
            limit: 1,
            ..Default::default()
        };
        assert_eq!(queue.list_jobs(&by_workflow).await.unwrap()[0].workflow_id, "a");
    }
}
