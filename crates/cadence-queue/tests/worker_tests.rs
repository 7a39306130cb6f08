//! Worker pool and claim semantics against the in-memory backend

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::Shutdown;
use cadence_queue::{
    JobContext, JobEntry, JobError, JobFilter, JobHandler, JobObserver, JobStatus, MemoryQueue,
    NewJob, QueueBackend, WorkerConfig, WorkerPool,
};
use parking_lot::Mutex;
use serde_json::json;

/// Fails `fail_times` times with the given error, then succeeds
struct CounterHandler {
    calls: Arc<AtomicU32>,
    fail_times: u32,
    fatal: bool,
}

impl CounterHandler {
    fn ok(calls: Arc<AtomicU32>) -> Self {
        Self {
            calls,
            fail_times: 0,
            fatal: false,
        }
    }

    fn failing(calls: Arc<AtomicU32>, fail_times: u32) -> Self {
        Self {
            calls,
            fail_times,
            fatal: false,
        }
    }

    fn fatal(calls: Arc<AtomicU32>) -> Self {
        Self {
            calls,
            fail_times: u32::MAX,
            fatal: true,
        }
    }
}

#[async_trait]
impl JobHandler for CounterHandler {
    async fn handle(
        &self,
        job: &JobEntry,
        _ctx: &JobContext,
    ) -> Result<Option<serde_json::Value>, JobError> {
        let count = self.calls.fetch_add(1, Ordering::SeqCst);
        if count < self.fail_times {
            if self.fatal {
                return Err(JobError::fatal("malformed payload"));
            }
            return Err(JobError::retryable(format!("Failing on attempt {}", count + 1)));
        }
        Ok(Some(json!({ "echo": job.payload })))
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        max_concurrency: 4,
        poll_interval: Duration::from_millis(10),
        lease_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(50),
        handler_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn start(pool: WorkerPool) -> (Shutdown, tokio::task::JoinHandle<()>) {
    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    let handle = tokio::spawn(async move { pool.run(signal).await });
    (shutdown, handle)
}

async fn wait_for_status(queue: &MemoryQueue, id: uuid::Uuid, status: JobStatus) -> JobEntry {
    for _ in 0..400 {
        let job = queue.get_job(id).await.unwrap();
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "job {} never reached {}, last status {}",
        id,
        status,
        queue.get_status(id).await.unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    let queue = Arc::new(MemoryQueue::new());
    for i in 0..200 {
        queue.enqueue(NewJob::new("wf", json!(i))).await.unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = queue
                .claim_next("default", &format!("w-{w}"), Duration::from_secs(30))
                .await
                .unwrap()
            {
                claimed.push(job.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(total, 200);
}

#[tokio::test]
async fn test_pool_completes_jobs_and_stores_result() {
    let queue = Arc::new(MemoryQueue::new());
    let calls = Arc::new(AtomicU32::new(0));
    let pool = WorkerPool::new(
        queue.clone(),
        Arc::new(CounterHandler::ok(calls.clone())),
        fast_config(),
    );
    let (shutdown, handle) = start(pool);

    let id = queue
        .enqueue(NewJob::new("wf", json!({ "lead": 7 })))
        .await
        .unwrap()
        .id;
    let job = wait_for_status(&queue, id, JobStatus::Completed).await;

    assert_eq!(job.result, Some(json!({ "echo": { "lead": 7 } })));
    assert_eq!(job.attempts, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_retryable_failure_dead_letters_after_max_attempts() {
    let queue = Arc::new(MemoryQueue::new());
    let calls = Arc::new(AtomicU32::new(0));
    let pool = WorkerPool::new(
        queue.clone(),
        Arc::new(CounterHandler::failing(calls.clone(), u32::MAX)),
        fast_config(),
    );
    let (shutdown, handle) = start(pool);

    let id = queue
        .enqueue(
            NewJob::new("wf", json!({}))
                .with_max_attempts(3)
                .with_backoff_base_ms(0),
        )
        .await
        .unwrap()
        .id;
    let job = wait_for_status(&queue, id, JobStatus::DeadLettered).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_history.len(), 3);
    assert_eq!(job.last_error.as_deref(), Some("Failing on attempt 3"));
    assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let queue = Arc::new(MemoryQueue::new());
    let calls = Arc::new(AtomicU32::new(0));
    let pool = WorkerPool::new(
        queue.clone(),
        Arc::new(CounterHandler::failing(calls.clone(), 2)),
        fast_config(),
    );
    let (shutdown, handle) = start(pool);

    let id = queue
        .enqueue(NewJob::new("wf", json!({})).with_backoff_base_ms(0))
        .await
        .unwrap()
        .id;
    let job = wait_for_status(&queue, id, JobStatus::Completed).await;
    assert_eq!(job.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let queue = Arc::new(MemoryQueue::new());
    let calls = Arc::new(AtomicU32::new(0));
    let pool = WorkerPool::new(
        queue.clone(),
        Arc::new(CounterHandler::fatal(calls.clone())),
        fast_config(),
    );
    let (shutdown, handle) = start(pool);

    let id = queue
        .enqueue(NewJob::new("wf", json!({})).with_max_attempts(5))
        .await
        .unwrap()
        .id;
    let job = wait_for_status(&queue, id, JobStatus::Failed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(job.last_error.as_deref(), Some("malformed payload"));

    shutdown.trigger();
    handle.await.unwrap();
}

struct SlowHandler;

#[async_trait]
impl JobHandler for SlowHandler {
    async fn handle(&self, _: &JobEntry, _: &JobContext) -> Result<Option<serde_json::Value>, JobError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(None)
    }
}

#[tokio::test]
async fn test_handler_timeout_counts_as_retryable_failure() {
    let queue = Arc::new(MemoryQueue::new());
    let config = WorkerConfig {
        handler_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let pool = WorkerPool::new(queue.clone(), Arc::new(SlowHandler), config);
    let (shutdown, handle) = start(pool);

    let id = queue
        .enqueue(NewJob::new("wf", json!({})).with_max_attempts(1))
        .await
        .unwrap()
        .id;
    let job = wait_for_status(&queue, id, JobStatus::DeadLettered).await;
    assert!(job.last_error.unwrap().contains("timed out"));

    shutdown.trigger();
    handle.await.unwrap();
}

/// Loops until cancelled, reporting progress on the way
struct CancellableHandler {
    started: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl JobHandler for CancellableHandler {
    async fn handle(&self, _: &JobEntry, ctx: &JobContext) -> Result<Option<serde_json::Value>, JobError> {
        ctx.report_progress(10).await.map_err(|e| JobError::fatal(e.to_string()))?;
        self.started.notify_one();
        loop {
            if ctx.is_cancelled().await {
                return Err(JobError::Cancelled);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test]
async fn test_running_job_stops_on_cancel() {
    let queue = Arc::new(MemoryQueue::new());
    let started = Arc::new(tokio::sync::Notify::new());
    let pool = WorkerPool::new(
        queue.clone(),
        Arc::new(CancellableHandler {
            started: started.clone(),
        }),
        fast_config(),
    );
    let (shutdown, handle) = start(pool);

    let id = queue.enqueue(NewJob::new("wf", json!({}))).await.unwrap().id;
    started.notified().await;
    assert_eq!(queue.get_job(id).await.unwrap().progress, 10);

    queue.cancel(id).await.unwrap();
    let job = wait_for_status(&queue, id, JobStatus::Cancelled).await;
    assert_eq!(job.attempts, 0);

    shutdown.trigger();
    handle.await.unwrap();
}

/// Tracks peak concurrency
struct GaugeHandler {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl JobHandler for GaugeHandler {
    async fn handle(&self, _: &JobEntry, _: &JobContext) -> Result<Option<serde_json::Value>, JobError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_respects_max_concurrency() {
    let queue = Arc::new(MemoryQueue::new());
    let gauge = Arc::new(GaugeHandler {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let config = WorkerConfig {
        max_concurrency: 2,
        ..fast_config()
    };
    let pool = WorkerPool::new(queue.clone(), gauge.clone(), config);

    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(queue.enqueue(NewJob::new("wf", json!(i))).await.unwrap().id);
    }
    let (shutdown, handle) = start(pool);
    for id in ids {
        wait_for_status(&queue, id, JobStatus::Completed).await;
    }

    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak concurrency {peak}");
    shutdown.trigger();
    handle.await.unwrap();
}

#[derive(Default)]
struct RecordingObserver {
    finished: Mutex<Vec<(uuid::Uuid, JobStatus)>>,
}

#[async_trait]
impl JobObserver for RecordingObserver {
    async fn on_job_finished(&self, job: &JobEntry) {
        self.finished.lock().push((job.id, job.status));
    }
}

#[tokio::test]
async fn test_observer_sees_terminal_states_only() {
    let queue = Arc::new(MemoryQueue::new());
    let observer = Arc::new(RecordingObserver::default());
    let calls = Arc::new(AtomicU32::new(0));
    let pool = WorkerPool::new(
        queue.clone(),
        Arc::new(CounterHandler::failing(calls, 1)),
        fast_config(),
    )
    .with_observer(observer.clone());
    let (shutdown, handle) = start(pool);

    let id = queue
        .enqueue(NewJob::new("wf", json!({})).with_backoff_base_ms(0))
        .await
        .unwrap()
        .id;
    wait_for_status(&queue, id, JobStatus::Completed).await;
    shutdown.trigger();
    handle.await.unwrap();

    assert_eq!(*observer.finished.lock(), vec![(id, JobStatus::Completed)]);
}

#[tokio::test]
async fn test_jobs_on_other_queues_are_ignored() {
    let queue = Arc::new(MemoryQueue::new());
    let calls = Arc::new(AtomicU32::new(0));
    let pool = WorkerPool::new(
        queue.clone(),
        Arc::new(CounterHandler::ok(calls.clone())),
        WorkerConfig {
            queue: "exports".into(),
            ..fast_config()
        },
    );
    let (shutdown, handle) = start(pool);

    let other = queue.enqueue(NewJob::new("wf", json!({}))).await.unwrap().id;
    let mine = queue
        .enqueue(NewJob::new("wf", json!({})).on_queue("exports"))
        .await
        .unwrap()
        .id;
    wait_for_status(&queue, mine, JobStatus::Completed).await;
    assert_eq!(queue.get_status(other).await.unwrap(), JobStatus::Queued);
    let exports = JobFilter {
        queue: Some("exports".into()),
        ..Default::default()
    };
    assert_eq!(queue.list_jobs(&exports).await.unwrap().len(), 1);

    shutdown.trigger();
    handle.await.unwrap();
}
