//! Scheduler service: schedule administration and the trigger loop

use async_trait::async_trait;
use cadence_core::{Clock, SharedClock, Shutdown};
use cadence_queue::{JobEntry, JobObserver, JobStatus, NewJob, QueueBackend, DEFAULT_QUEUE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cron::CronExpr;
use crate::schedule::{NewSchedule, Schedule, ScheduleId, SchedulePatch, ScheduleStatus};
use crate::store::{ScheduleError, ScheduleStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Granularity of the trigger loop
    pub tick_interval_secs: u64,
    /// Consecutive failures before a schedule is marked failed
    pub failure_threshold: u32,
    /// Retry budget for jobs produced by schedules
    pub job_max_attempts: u32,
    pub job_backoff_base_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            failure_threshold: 3,
            job_max_attempts: 3,
            job_backoff_base_ms: 1_000,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<(ScheduleId, Uuid)>,
    pub failed: Vec<ScheduleId>,
}

/// Owns all schedule bookkeeping. No global state: every instance works
/// against the store and queue it was handed.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    queue: Arc<dyn QueueBackend>,
    clock: SharedClock,
    config: SchedulerConfig,
    /// Serialises read-modify-write cycles on schedules
    write_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        queue: Arc<dyn QueueBackend>,
        clock: SharedClock,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn create(&self, new: NewSchedule) -> Result<Schedule, ScheduleError> {
        if new.workflow_id.trim().is_empty() {
            return Err(ScheduleError::Invalid("workflow_id must not be empty".into()));
        }
        let cron = CronExpr::parse(&new.cron)?;
        let now = self.clock.now();

        let mut schedule = Schedule {
            id: Uuid::new_v4(),
            name: new.name,
            workflow_id: new.workflow_id,
            cron: cron.as_str().to_string(),
            payload: new.payload,
            queue: new.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            status: ScheduleStatus::Active,
            enabled: new.enabled,
            next_run_at: None,
            last_run_at: None,
            last_error: None,
            retry_count: 0,
            last_job_id: None,
            created_at: now,
            updated_at: now,
        };
        arm(&mut schedule, &cron, now);

        self.store.insert(&schedule).await?;
        info!(
            schedule_id = %schedule.id,
            workflow_id = %schedule.workflow_id,
            cron = %schedule.cron,
            next_run_at = ?schedule.next_run_at,
            "Schedule created"
        );
        Ok(schedule)
    }

    pub async fn get(&self, id: ScheduleId) -> Result<Schedule, ScheduleError> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Schedule>, ScheduleError> {
        self.store.list().await
    }

    pub async fn update(&self, id: ScheduleId, patch: SchedulePatch) -> Result<Schedule, ScheduleError> {
        let _guard = self.write_lock.lock().await;
        let mut schedule = self.store.get(id).await?;
        let now = self.clock.now();

        let cron = match &patch.cron {
            Some(expr) => CronExpr::parse(expr)?,
            None => CronExpr::parse(&schedule.cron)?,
        };
        schedule.cron = cron.as_str().to_string();

        if let Some(workflow_id) = patch.workflow_id {
            if workflow_id.trim().is_empty() {
                return Err(ScheduleError::Invalid("workflow_id must not be empty".into()));
            }
            schedule.workflow_id = workflow_id;
        }
        if let Some(name) = patch.name {
            schedule.name = Some(name);
        }
        if let Some(payload) = patch.payload {
            schedule.payload = payload;
        }
        if let Some(queue) = patch.queue {
            schedule.queue = queue;
        }
        if let Some(enabled) = patch.enabled {
            schedule.enabled = enabled;
        }
        if let Some(status) = patch.status {
            if status == ScheduleStatus::Active && schedule.status != ScheduleStatus::Active {
                schedule.retry_count = 0;
                schedule.last_error = None;
            }
            schedule.status = status;
        }

        // Re-arm whenever the cron changed or the schedule (re)became active
        let keep_next = patch.cron.is_none() && schedule.is_armed() && schedule.next_run_at.is_some();
        if !keep_next {
            arm(&mut schedule, &cron, now);
        }
        schedule.updated_at = now;

        self.store.update(&schedule).await?;
        info!(schedule_id = %id, status = %schedule.status, enabled = schedule.enabled, "Schedule updated");
        Ok(schedule)
    }

    pub async fn delete(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        let _guard = self.write_lock.lock().await;
        self.store.delete(id).await?;
        info!(schedule_id = %id, "Schedule deleted");
        Ok(())
    }

    /// Clear the failure count and reactivate a failed (or any) schedule
    pub async fn retry(&self, id: ScheduleId) -> Result<Schedule, ScheduleError> {
        self.transition(id, |schedule| {
            schedule.status = ScheduleStatus::Active;
            schedule.retry_count = 0;
            schedule.last_error = None;
        })
        .await
    }

    pub async fn pause(&self, id: ScheduleId) -> Result<Schedule, ScheduleError> {
        self.transition(id, |schedule| schedule.status = ScheduleStatus::Paused)
            .await
    }

    pub async fn resume(&self, id: ScheduleId) -> Result<Schedule, ScheduleError> {
        self.transition(id, |schedule| {
            if schedule.status == ScheduleStatus::Paused {
                schedule.status = ScheduleStatus::Active;
            }
        })
        .await
    }

    async fn transition<F>(&self, id: ScheduleId, change: F) -> Result<Schedule, ScheduleError>
    where
        F: FnOnce(&mut Schedule),
    {
        let _guard = self.write_lock.lock().await;
        let mut schedule = self.store.get(id).await?;
        let now = self.clock.now();
        let cron = CronExpr::parse(&schedule.cron)?;
        change(&mut schedule);
        arm(&mut schedule, &cron, now);
        schedule.updated_at = now;
        self.store.update(&schedule).await?;
        info!(schedule_id = %id, status = %schedule.status, next_run_at = ?schedule.next_run_at, "Schedule status changed");
        Ok(schedule)
    }

    /// Armed schedules ordered by their next fire time
    pub async fn upcoming(&self, limit: usize) -> Result<Vec<Schedule>, ScheduleError> {
        let mut armed: Vec<_> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| s.is_armed() && s.next_run_at.is_some())
            .collect();
        armed.sort_by_key(|s| s.next_run_at);
        if limit > 0 {
            armed.truncate(limit);
        }
        Ok(armed)
    }

    /// Fire every due schedule once
    pub async fn tick(&self) -> Result<TickReport, ScheduleError> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let due = self.store.due(now).await?;
        let mut report = TickReport::default();

        for schedule in due {
            let id = schedule.id;
            match self.fire(schedule, now).await {
                Ok(job_id) => report.fired.push((id, job_id)),
                Err(e) => {
                    error!(schedule_id = %id, error = %e, "Schedule fire failed");
                    report.failed.push(id);
                }
            }
        }

        if !report.fired.is_empty() || !report.failed.is_empty() {
            debug!(fired = report.fired.len(), failed = report.failed.len(), "Tick complete");
        }
        Ok(report)
    }

    /// Enqueue one job for `schedule` and advance it.
    ///
    /// The idempotency key pins the job to the occurrence being fired, so
    /// a crash between enqueue and the schedule update cannot double-fire.
    async fn fire(&self, mut schedule: Schedule, now: DateTime<Utc>) -> Result<Uuid, ScheduleError> {
        let occurrence = schedule.next_run_at.unwrap_or(now);
        let result = self.enqueue_for(&schedule, occurrence).await;

        match result {
            Ok(job_id) => {
                let cron = CronExpr::parse(&schedule.cron)?;
                schedule.last_run_at = Some(now);
                schedule.last_job_id = Some(job_id);
                // Relative to now: missed occurrences are skipped
                schedule.next_run_at = cron.next_after(now);
                schedule.updated_at = now;
                self.store.update(&schedule).await?;
                info!(
                    schedule_id = %schedule.id,
                    job_id = %job_id,
                    workflow_id = %schedule.workflow_id,
                    next_run_at = ?schedule.next_run_at,
                    "Schedule fired"
                );
                Ok(job_id)
            }
            Err(e) => {
                self.record_failure(&mut schedule, &e.to_string(), now);
                self.store.update(&schedule).await?;
                Err(e)
            }
        }
    }

    async fn enqueue_for(&self, schedule: &Schedule, occurrence: DateTime<Utc>) -> Result<Uuid, ScheduleError> {
        // Validate before producing work
        CronExpr::parse(&schedule.cron)?;
        let job = NewJob::new(schedule.workflow_id.clone(), schedule.payload.clone())
            .on_queue(schedule.queue.clone())
            .for_schedule(schedule.id)
            .with_max_attempts(self.config.job_max_attempts)
            .with_backoff_base_ms(self.config.job_backoff_base_ms)
            .with_idempotency_key(format!(
                "schedule:{}:{}",
                schedule.id,
                occurrence.timestamp_millis()
            ));
        let enqueued = self.queue.enqueue(job).await?;
        if enqueued.deduplicated {
            warn!(schedule_id = %schedule.id, job_id = %enqueued.id, "Occurrence already enqueued, not firing twice");
        }
        Ok(enqueued.id)
    }

    fn record_failure(&self, schedule: &mut Schedule, error: &str, now: DateTime<Utc>) {
        schedule.retry_count += 1;
        schedule.last_error = Some(error.to_string());
        schedule.updated_at = now;
        if schedule.retry_count >= self.config.failure_threshold {
            schedule.status = ScheduleStatus::Failed;
            schedule.next_run_at = None;
            error!(
                schedule_id = %schedule.id,
                retry_count = schedule.retry_count,
                error,
                "Schedule failed too many times, firing stopped until retried"
            );
        } else {
            warn!(
                schedule_id = %schedule.id,
                retry_count = schedule.retry_count,
                threshold = self.config.failure_threshold,
                error,
                "Schedule failure recorded"
            );
        }
    }

    /// Startup recovery.
    ///
    /// Re-arms active schedules that lost their `next_run_at`, then fires
    /// every overdue schedule exactly once. Missed occurrences beyond the
    /// first are skipped.
    pub async fn recover(&self) -> Result<TickReport, ScheduleError> {
        {
            let _guard = self.write_lock.lock().await;
            let now = self.clock.now();
            let mut rearmed = 0;
            for mut schedule in self.store.list().await? {
                let consistent = schedule.is_armed() == schedule.next_run_at.is_some();
                if consistent {
                    continue;
                }
                match CronExpr::parse(&schedule.cron) {
                    Ok(cron) => {
                        arm(&mut schedule, &cron, now);
                        schedule.updated_at = now;
                        self.store.update(&schedule).await?;
                        rearmed += 1;
                    }
                    Err(e) => {
                        warn!(schedule_id = %schedule.id, error = %e, "Stored schedule has an invalid cron expression");
                    }
                }
            }
            if rearmed > 0 {
                info!(rearmed, "Schedules re-armed during recovery");
            }
        }

        let report = self.tick().await?;
        info!(overdue_fired = report.fired.len(), failed = report.failed.len(), "Schedule recovery complete");
        Ok(report)
    }

    /// Recover, then tick until `shutdown` fires
    pub async fn run(&self, shutdown: Shutdown) {
        if let Err(e) = self.recover().await {
            error!(error = %e, "Schedule recovery failed");
        }

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(tick_interval_secs = self.config.tick_interval_secs, "Scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "Scheduler tick failed");
            }
        }
        info!("Scheduler stopped");
    }

    /// Feed a finished job's outcome back into its schedule
    async fn observe(&self, job: &JobEntry) -> Result<(), ScheduleError> {
        let Some(schedule_id) = job.schedule_id else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let mut schedule = match self.store.get(schedule_id).await {
            Ok(s) => s,
            // Deleted while the job ran
            Err(ScheduleError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let now = self.clock.now();

        match job.status {
            JobStatus::Completed => {
                if schedule.retry_count == 0 && schedule.last_error.is_none() {
                    return Ok(());
                }
                schedule.retry_count = 0;
                schedule.last_error = None;
                schedule.updated_at = now;
            }
            JobStatus::Failed | JobStatus::DeadLettered => {
                if schedule.status == ScheduleStatus::Failed {
                    return Ok(());
                }
                let error = job
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("job {} ended {}", job.id, job.status));
                self.record_failure(&mut schedule, &error, now);
            }
            _ => return Ok(()),
        }
        self.store.update(&schedule).await
    }
}

#[async_trait]
impl JobObserver for Scheduler {
    async fn on_job_finished(&self, job: &JobEntry) {
        if let Err(e) = self.observe(job).await {
            error!(job_id = %job.id, error = %e, "Failed to record job outcome on schedule");
        }
    }
}

/// Set `next_run_at` from the cron expression when armed, clear it otherwise
fn arm(schedule: &mut Schedule, cron: &CronExpr, now: DateTime<Utc>) {
    schedule.next_run_at = if schedule.is_armed() {
        cron.next_after(now)
    } else {
        None
    };
}
