//! Worker Pool for processing jobs

use async_trait::async_trait;
use cadence_core::{Classify, Shutdown};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::{QueueBackend, QueueError};
use crate::job::{JobEntry, JobError, JobId, DEFAULT_QUEUE};

/// Executes claimed jobs.
///
/// Returning `Err(JobError::Retryable)` requeues the job with backoff,
/// `Err(JobError::Fatal)` fails it for good.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        job: &JobEntry,
        ctx: &JobContext,
    ) -> Result<Option<serde_json::Value>, JobError>;
}

/// Notified after a job reaches a terminal state
#[async_trait]
pub trait JobObserver: Send + Sync {
    async fn on_job_finished(&self, job: &JobEntry);
}

/// Handle a running job uses to talk back to the queue
#[derive(Clone)]
pub struct JobContext {
    backend: Arc<dyn QueueBackend>,
    job_id: JobId,
    worker_id: String,
}

impl JobContext {
    pub fn new(backend: Arc<dyn QueueBackend>, job_id: JobId, worker_id: impl Into<String>) -> Self {
        Self {
            backend,
            job_id,
            worker_id: worker_id.into(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Whether an operator asked to cancel this job. Backend errors read as
    /// "not cancelled" so a flaky store never aborts work on its own.
    pub async fn is_cancelled(&self) -> bool {
        match self.backend.is_cancel_requested(self.job_id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Cancel check failed");
                false
            }
        }
    }

    pub async fn report_progress(&self, progress: u8) -> Result<(), QueueError> {
        self.backend
            .set_progress(self.job_id, &self.worker_id, progress)
            .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queue this pool consumes
    pub queue: String,
    pub max_concurrency: usize,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub lease_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Per-job execution ceiling; a timeout counts as a retryable failure
    #[serde(with = "duration_ms")]
    pub handler_timeout: Duration,
    /// How long shutdown waits for in-flight jobs before abandoning them
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_concurrency: 5,
            poll_interval: Duration::from_millis(500),
            lease_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
            handler_timeout: Duration::from_secs(15 * 60),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// How a single execution ended
enum Outcome {
    Finished(Result<Option<serde_json::Value>, JobError>),
    TimedOut,
    LeaseLost,
}

struct Shared {
    backend: Arc<dyn QueueBackend>,
    handler: Arc<dyn JobHandler>,
    observer: Option<Arc<dyn JobObserver>>,
    config: WorkerConfig,
}

/// Bounded pool of concurrent job executions on one queue
pub struct WorkerPool {
    id: String,
    shared: Arc<Shared>,
    claims: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Self {
        let short = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}-{}", config.queue, &short[..8]),
            shared: Arc::new(Shared {
                backend,
                handler,
                observer: None,
                config,
            }),
            claims: AtomicU64::new(0),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.observer = Some(observer);
        }
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Each claim gets its own owner id so a straggling task can never
    /// settle a job that was reclaimed and handed to someone else.
    fn next_worker_id(&self) -> String {
        let n = self.claims.fetch_add(1, Ordering::Relaxed);
        format!("{}/{}", self.id, n)
    }

    /// Claim and run jobs until `shutdown` fires, then drain in-flight work
    pub async fn run(&self, shutdown: Shutdown) {
        let config = &self.shared.config;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let notify = self.shared.backend.notifier();
        let mut tasks = JoinSet::new();

        info!(
            pool = %self.id,
            queue = %config.queue,
            concurrency = config.max_concurrency,
            "Worker pool started"
        );

        loop {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.wait() => break,
            };

            let worker_id = self.next_worker_id();
            match self
                .shared
                .backend
                .claim_next(&config.queue, &worker_id, config.lease_timeout)
                .await
            {
                Ok(Some(job)) => {
                    let shared = self.shared.clone();
                    tasks.spawn(async move {
                        execute(shared, job, worker_id).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    // Queue empty: wait for a new job, the poll interval or shutdown
                    let wake = async {
                        match &notify {
                            Some(n) => n.notified().await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        _ = wake => {}
                        _ = tokio::time::sleep(config.poll_interval) => {}
                        _ = shutdown.wait() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(pool = %self.id, error = %e, "Queue error");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.wait() => break,
                    }
                }
            }

            while let Some(res) = tasks.try_join_next() {
                if let Err(e) = res {
                    error!(pool = %self.id, error = %e, "Job task panicked");
                }
            }
        }

        let in_flight = tasks.len();
        info!(pool = %self.id, in_flight, "Worker pool draining");
        let drained = tokio::time::timeout(config.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                pool = %self.id,
                abandoned = tasks.len(),
                "Drain timeout reached; remaining jobs will be reclaimed after their lease"
            );
            tasks.abort_all();
        }
        info!(pool = %self.id, "Worker pool stopped");
    }
}

async fn execute(shared: Arc<Shared>, job: JobEntry, worker_id: String) {
    let config = &shared.config;
    let ctx = JobContext::new(shared.backend.clone(), job.id, worker_id.clone());

    info!(
        job_id = %job.id,
        workflow_id = %job.workflow_id,
        attempt = job.attempts + 1,
        worker_id = %worker_id,
        "Processing job"
    );

    let outcome = {
        let run = tokio::time::timeout(config.handler_timeout, shared.handler.handle(&job, &ctx));
        tokio::select! {
            res = run => match res {
                Ok(result) => Outcome::Finished(result),
                Err(_) => Outcome::TimedOut,
            },
            _ = heartbeat(&shared, job.id, &worker_id) => Outcome::LeaseLost,
        }
    };

    let settled = match outcome {
        Outcome::Finished(Ok(result)) => shared.backend.complete(job.id, &worker_id, result).await,
        Outcome::Finished(Err(JobError::Cancelled)) => {
            shared.backend.mark_cancelled(job.id, &worker_id).await
        }
        Outcome::Finished(Err(e)) => {
            let retryable = e.is_retryable();
            shared
                .backend
                .fail(job.id, &worker_id, &e.message(), retryable)
                .await
        }
        Outcome::TimedOut => {
            let msg = format!(
                "handler timed out after {}ms",
                config.handler_timeout.as_millis()
            );
            shared.backend.fail(job.id, &worker_id, &msg, true).await
        }
        Outcome::LeaseLost => {
            warn!(job_id = %job.id, worker_id = %worker_id, "Lease lost, abandoning execution");
            return;
        }
    };

    match settled {
        Ok(entry) => {
            debug!(job_id = %entry.id, status = %entry.status, attempts = entry.attempts, "Job settled");
            if entry.status.is_terminal() {
                if let Some(observer) = &shared.observer {
                    observer.on_job_finished(&entry).await;
                }
            } else {
                info!(
                    job_id = %entry.id,
                    attempt = entry.attempts,
                    visible_after = %entry.visible_after,
                    "Job failed, scheduling retry with backoff"
                );
            }
        }
        Err(QueueError::LeaseLost { .. }) => {
            warn!(job_id = %job.id, worker_id = %worker_id, "Result discarded, job was reclaimed");
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to record job outcome");
        }
    }
}

/// Extend the lease on every tick. Only returns once the lease is lost.
async fn heartbeat(shared: &Shared, id: JobId, worker_id: &str) {
    let period = shared.config.heartbeat_interval.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match shared
            .backend
            .extend_lease(id, worker_id, shared.config.lease_timeout)
            .await
        {
            Ok(()) => {}
            Err(QueueError::LeaseLost { .. }) | Err(QueueError::NotFound(_)) => return,
            Err(e) => warn!(job_id = %id, error = %e, "Heartbeat failed"),
        }
    }
}
