//! Restart and recovery tests against SQLite files

use std::sync::Arc;
use std::time::Duration as StdDuration;

use cadence_core::{Classify, Clock, ErrorClass, ManualClock, SharedClock};
use cadence_persist::{SqliteBackend, SqliteConfig};
use cadence_queue::{JobFilter, JobStatus, NewJob, QueueBackend, QueueError};
use cadence_resilience::{BreakerConfig, BreakerRegistry, CircuitState};
use cadence_runtime::{
    ExecutorConfig, HandlerRegistry, StepDefinition, StepStatus, WorkflowDefinition,
    WorkflowExecutor, WorkflowStatus, WorkflowStore,
};
use cadence_scheduler::{NewSchedule, ScheduleStatus, ScheduleStore, Scheduler, SchedulerConfig};
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 30).unwrap(),
    ))
}

async fn open(dir: &TempDir, clock: SharedClock) -> SqliteBackend {
    SqliteBackend::connect(SqliteConfig::file(dir.path().join("cadence.db")))
        .await
        .unwrap()
        .with_clock(clock)
}

#[tokio::test]
async fn test_running_job_requeued_after_restart() {
    let dir = TempDir::new().unwrap();
    let clock = clock();

    let job_id = {
        let backend = open(&dir, clock.clone()).await;
        let queue = backend.queue();
        let enqueued = queue
            .enqueue(NewJob::new("nightly-report", json!({ "day": "friday" })))
            .await
            .unwrap();
        let claimed = queue
            .claim_next("default", "worker-a", StdDuration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, enqueued.id);
        assert_eq!(claimed.status, JobStatus::Running);
        // Process dies without finishing the job
        backend.close().await;
        enqueued.id
    };

    let backend = open(&dir, clock.clone()).await;
    let queue = backend.queue();
    let recovered = queue.recover_abandoned().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, job_id);

    let job = queue.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 1);
    assert!(job.owner.is_none());
    assert_eq!(job.payload, json!({ "day": "friday" }));

    // The old owner cannot finish it any more
    assert!(queue.complete(job_id, "worker-a", None).await.is_err());

    let reclaimed = queue
        .claim_next("default", "worker-b", StdDuration::from_secs(300))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, job_id);
    let done = queue
        .complete(job_id, "worker-b", Some(json!({ "rows": 12 })))
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result, Some(json!({ "rows": 12 })));
}

#[tokio::test]
async fn test_expired_leases_reclaimed() {
    let dir = TempDir::new().unwrap();
    let clock = clock();
    let backend = open(&dir, clock.clone()).await;
    let queue = backend.queue();
    let lease = StdDuration::from_secs(30);

    let heartbeating = queue
        .enqueue(NewJob::new("export", json!({})).with_max_attempts(3))
        .await
        .unwrap()
        .id;
    assert_eq!(
        queue.claim_next("default", "worker-a", lease).await.unwrap().unwrap().id,
        heartbeating
    );
    let stalled = queue
        .enqueue(NewJob::new("export", json!({})).with_max_attempts(1))
        .await
        .unwrap()
        .id;
    assert_eq!(
        queue.claim_next("default", "worker-b", lease).await.unwrap().unwrap().id,
        stalled
    );

    clock.advance(Duration::seconds(20));
    queue.extend_lease(heartbeating, "worker-a", lease).await.unwrap();

    // 35s in: only the stalled lease has run out
    clock.advance(Duration::seconds(15));
    let reclaimed = queue.reclaim_expired().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, stalled);
    assert_eq!(reclaimed[0].status, JobStatus::DeadLettered);
    assert_eq!(queue.get_job(heartbeating).await.unwrap().status, JobStatus::Running);

    clock.advance(Duration::seconds(20));
    let reclaimed = queue.reclaim_expired().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, heartbeating);
    assert_eq!(reclaimed[0].status, JobStatus::Queued);
    assert_eq!(reclaimed[0].attempts, 1);
    assert!(matches!(
        queue.complete(heartbeating, "worker-a", None).await,
        Err(QueueError::LeaseLost { .. })
    ));
    assert!(queue.reclaim_expired().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_absurd_lease_stored_and_never_reclaimed() {
    let dir = TempDir::new().unwrap();
    let clock = clock();
    let backend = open(&dir, clock.clone()).await;
    let queue = backend.queue();

    let id = queue.enqueue(NewJob::new("export", json!({}))).await.unwrap().id;
    queue
        .claim_next("default", "worker-a", StdDuration::MAX)
        .await
        .unwrap()
        .unwrap();
    queue
        .extend_lease(id, "worker-a", StdDuration::from_secs(u64::MAX))
        .await
        .unwrap();

    clock.advance(Duration::days(365 * 100));
    assert!(queue.reclaim_expired().await.unwrap().is_empty());
    assert_eq!(queue.get_job(id).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_concurrent_claims_never_share_a_job() {
    let dir = TempDir::new().unwrap();
    let backend = open(&dir, clock()).await;
    let queue = backend.queue();

    for i in 0..20 {
        queue
            .enqueue(NewJob::new("fan-out", json!({ "n": i })))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..4 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("worker-{w}");
            let mut claimed = Vec::new();
            while let Some(job) = queue
                .claim_next("default", &worker, StdDuration::from_secs(60))
                .await
                .unwrap()
            {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 20);
    assert_eq!(all.len(), 20);
}

#[tokio::test]
async fn test_overdue_schedule_fires_once_after_restart() {
    let dir = TempDir::new().unwrap();
    let clock = clock();

    let schedule_id = {
        let backend = open(&dir, clock.clone()).await;
        let scheduler = Scheduler::new(
            backend.schedules(),
            backend.queue(),
            clock.clone(),
            SchedulerConfig::default(),
        );
        let schedule = scheduler
            .create(NewSchedule::new("lead-import", "*/15 * * * *"))
            .await
            .unwrap();
        assert_eq!(
            schedule.next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap())
        );
        backend.close().await;
        schedule.id
    };

    // Down for almost an hour: three occurrences were missed
    clock.advance(Duration::minutes(55));

    let backend = open(&dir, clock.clone()).await;
    let scheduler = Scheduler::new(
        backend.schedules(),
        backend.queue(),
        clock.clone(),
        SchedulerConfig::default(),
    );
    let report = scheduler.recover().await.unwrap();
    assert_eq!(report.fired.len(), 1);
    assert!(scheduler.tick().await.unwrap().fired.is_empty());

    let jobs = backend
        .queue()
        .list_jobs(&JobFilter {
            schedule_id: Some(schedule_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].workflow_id, "lead-import");

    let schedule = scheduler.get(schedule_id).await.unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Active);
    assert_eq!(schedule.last_job_id, Some(jobs[0].id));
    assert_eq!(
        schedule.next_run_at,
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_enqueued_occurrence_not_fired_twice() {
    let dir = TempDir::new().unwrap();
    let clock = clock();
    let backend = open(&dir, clock.clone()).await;
    let queue = backend.queue();
    let scheduler = Scheduler::new(
        backend.schedules(),
        queue.clone(),
        clock.clone(),
        SchedulerConfig::default(),
    );
    let schedule = scheduler
        .create(NewSchedule::new("sync-contacts", "0 * * * *"))
        .await
        .unwrap();
    let occurrence = schedule.next_run_at.unwrap();

    // A previous process enqueued this occurrence and crashed before
    // recording it on the schedule
    let first = queue
        .enqueue(
            NewJob::new("sync-contacts", json!(null))
                .for_schedule(schedule.id)
                .with_idempotency_key(format!(
                    "schedule:{}:{}",
                    schedule.id,
                    occurrence.timestamp_millis()
                )),
        )
        .await
        .unwrap();
    assert!(!first.deduplicated);

    clock.advance(Duration::hours(1));
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.fired, vec![(schedule.id, first.id)]);

    let jobs = queue
        .list_jobs(&JobFilter {
            schedule_id: Some(schedule.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn test_schedule_store_round_trip() {
    let dir = TempDir::new().unwrap();
    let clock = clock();
    let backend = open(&dir, clock.clone()).await;
    let store = backend.schedules();
    let scheduler = Scheduler::new(
        store.clone(),
        backend.queue(),
        clock.clone(),
        SchedulerConfig::default(),
    );

    let created = scheduler
        .create(
            NewSchedule::new("weekly-digest", "0 9 * * 1")
                .with_name("Monday digest")
                .with_payload(json!({ "recipients": ["ops@example.com"] })),
        )
        .await
        .unwrap();
    assert_eq!(store.get(created.id).await.unwrap(), created);

    let paused = scheduler.pause(created.id).await.unwrap();
    assert_eq!(paused.status, ScheduleStatus::Paused);
    assert!(paused.next_run_at.is_none());
    assert!(store.due(clock.now() + Duration::days(30)).await.unwrap().is_empty());

    scheduler.delete(created.id).await.unwrap();
    assert!(store.list().await.unwrap().is_empty());
    assert!(scheduler.get(created.id).await.is_err());
}

#[tokio::test]
async fn test_workflow_runs_survive_restart() {
    let dir = TempDir::new().unwrap();
    let clock = clock();

    let def = WorkflowDefinition::new(
        "onboard",
        vec![
            StepDefinition::new("fetch", "echo", json!({ "account": "{{params.account}}" })),
            StepDefinition::new("greet", "echo", json!({ "to": "{{steps.fetch.account}}" })),
        ],
    );

    let (first, second) = {
        let backend = open(&dir, clock.clone()).await;
        let executor = WorkflowExecutor::new(
            Arc::new(HandlerRegistry::with_builtins()),
            Arc::new(BreakerRegistry::new(BreakerConfig::default(), clock.clone())),
            backend.workflows(),
            clock.clone(),
            ExecutorConfig::default(),
        );
        executor.register(&def).await.unwrap();
        let first = executor
            .execute_by_id("onboard", json!({ "account": "acme" }))
            .await
            .unwrap();
        clock.advance(Duration::seconds(5));
        let second = executor
            .execute_by_id("onboard", json!({ "account": "globex" }))
            .await
            .unwrap();
        backend.close().await;
        (first, second)
    };
    assert_eq!(first.status, WorkflowStatus::Completed);

    let backend = open(&dir, clock.clone()).await;
    let store = backend.workflows();

    let stored = store.get_definition("onboard").await.unwrap().unwrap();
    assert_eq!(stored.step_ids(), vec!["fetch".to_string(), "greet".to_string()]);
    assert_eq!(store.list_definitions().await.unwrap().len(), 1);

    let run = store.get_run(first.id).await.unwrap().unwrap();
    assert_eq!(run.status, WorkflowStatus::Completed);
    assert!(run.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(run.steps[1].result, Some(json!({ "to": "acme" })));

    let runs = store.list_runs(Some("onboard"), 10).await.unwrap();
    let ids: Vec<_> = runs.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert_eq!(store.list_runs(None, 1).await.unwrap()[0].id, second.id);
    assert!(store.list_runs(Some("other"), 10).await.unwrap().is_empty());

    assert!(store.delete_definition("onboard").await.unwrap());
    assert!(!store.delete_definition("onboard").await.unwrap());
}

#[derive(Debug)]
struct Refused;

impl std::fmt::Display for Refused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection refused")
    }
}

impl Classify for Refused {
    fn class(&self) -> ErrorClass {
        ErrorClass::DependencyDown
    }
}

#[tokio::test]
async fn test_open_breaker_restored_after_restart() {
    let dir = TempDir::new().unwrap();
    let clock = clock();
    let config = BreakerConfig {
        failure_threshold: 2,
        cooldown_ms: 60_000,
        ..Default::default()
    };

    {
        let backend = open(&dir, clock.clone()).await;
        let registry = BreakerRegistry::new(config.clone(), clock.clone());
        for _ in 0..2 {
            let _ = registry
                .call("http:billing.internal", async { Err::<(), _>(Refused) })
                .await;
        }
        registry
            .call("http:crm.internal", async { Ok::<_, Refused>(()) })
            .await
            .unwrap();
        assert_eq!(registry.get("http:billing.internal").state(), CircuitState::Open);

        let saved = registry.persist(backend.breakers().as_ref()).await.unwrap();
        assert_eq!(saved, 2);
        backend.close().await;
    }

    let backend = open(&dir, clock.clone()).await;
    let registry = BreakerRegistry::new(config, clock.clone());
    let restored = registry
        .restore_from(backend.breakers().as_ref())
        .await
        .unwrap();
    assert_eq!(restored, 2);

    let billing = registry.get("http:billing.internal").snapshot();
    assert_eq!(billing.state, CircuitState::Open);
    assert_eq!(billing.consecutive_failures, 2);
    assert_eq!(billing.opened_at, Some(clock.now()));
    assert_eq!(registry.get("http:crm.internal").state(), CircuitState::Closed);

    // Still open: rejected without running the call
    let rejected = registry
        .call("http:billing.internal", async { Ok::<_, Refused>(()) })
        .await;
    assert!(rejected.is_err());
}
