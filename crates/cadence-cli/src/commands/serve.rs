//! Serve command - the long-running process
//!
//! Startup order matters: breaker state is restored and abandoned jobs are
//! requeued before any worker claims, then the scheduler recovers overdue
//! schedules as its loop starts.

use anyhow::{bail, Context, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use cadence_core::Shutdown;
use cadence_queue::{JobHandler, JobObserver, LeaseSweeper, WorkerConfig, WorkerPool};
use cadence_resilience::{BreakerRegistry, BreakerStateStore};
use cadence_runtime::WorkflowJobHandler;

use crate::app::App;
use crate::print_info;

#[derive(Args)]
pub struct ServeArgs {
    /// Only run worker pools for these queues (repeatable)
    #[arg(long = "queue")]
    queues: Vec<String>,

    /// Run the scheduler without worker pools
    #[arg(long, conflicts_with = "queues")]
    no_workers: bool,
}

pub async fn run(app: &App, args: ServeArgs) -> Result<()> {
    let pools = select_pools(&app.settings.workers, &args)?;

    let shutdown = Shutdown::new();
    let signals = shutdown.install_signal_handlers();
    let breakers = app.executor.breakers().clone();

    match breakers.restore_from(app.breaker_store.as_ref()).await {
        Ok(0) => {}
        Ok(count) => info!(count, "Circuit breaker state restored"),
        Err(e) => warn!(error = %e, "Failed to restore circuit breaker state"),
    }

    let observer: Arc<dyn JobObserver> = app.scheduler.clone();
    let sweeper = Arc::new(
        LeaseSweeper::new(app.queue.clone(), app.settings.maintenance.sweep_interval())
            .with_observer(observer.clone()),
    );
    sweeper
        .recover()
        .await
        .context("Failed to recover abandoned jobs")?;

    let handler: Arc<dyn JobHandler> = Arc::new(WorkflowJobHandler::new(app.executor.clone()));
    let mut tasks: JoinSet<&'static str> = JoinSet::new();

    {
        let scheduler = app.scheduler.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            scheduler.run(shutdown).await;
            "scheduler"
        });
    }
    {
        let sweeper = sweeper.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            sweeper.run(shutdown).await;
            "lease sweeper"
        });
    }
    for config in pools {
        let pool = WorkerPool::new(app.queue.clone(), handler.clone(), config).with_observer(observer.clone());
        print_info(&format!("Worker pool {} started", pool.id()));
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            pool.run(shutdown).await;
            "worker pool"
        });
    }
    tasks.spawn(snapshot_breakers(
        breakers.clone(),
        app.breaker_store.clone(),
        app.settings.maintenance.breaker_snapshot_interval(),
        shutdown.clone(),
    ));

    info!(
        storage = app.settings.storage.backend.as_str(),
        tick_interval_secs = app.settings.scheduler.tick_interval_secs,
        "Cadence running, press Ctrl-C to stop"
    );

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(task) => debug!(task, "Background task stopped"),
            Err(e) => {
                // One loop dying takes the rest down with it
                error!(error = %e, "Background task failed");
                shutdown.trigger();
            }
        }
    }
    signals.abort();

    for stats in breakers.stats() {
        if stats.total_failures > 0 || stats.total_rejections > 0 {
            info!(
                circuit = %stats.name,
                state = stats.state.as_str(),
                requests = stats.total_requests,
                failures = stats.total_failures,
                rejections = stats.total_rejections,
                opens = stats.total_opens,
                "Circuit summary"
            );
        }
    }
    info!("Cadence stopped");
    Ok(())
}

fn select_pools(configured: &[WorkerConfig], args: &ServeArgs) -> Result<Vec<WorkerConfig>> {
    if args.no_workers {
        return Ok(Vec::new());
    }
    if args.queues.is_empty() {
        return Ok(configured.to_vec());
    }
    let mut pools = Vec::with_capacity(args.queues.len());
    for queue in &args.queues {
        match configured.iter().find(|c| &c.queue == queue) {
            Some(config) => pools.push(config.clone()),
            None => bail!("No worker pool configured for queue '{}'", queue),
        }
    }
    Ok(pools)
}

/// Save breaker state every `every` and once more on shutdown
async fn snapshot_breakers(
    breakers: Arc<BreakerRegistry>,
    store: Arc<dyn BreakerStateStore>,
    every: Duration,
    shutdown: Shutdown,
) -> &'static str {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => break,
        }
        save_breakers(&breakers, store.as_ref()).await;
    }
    save_breakers(&breakers, store.as_ref()).await;
    "breaker snapshotter"
}

async fn save_breakers(breakers: &BreakerRegistry, store: &dyn BreakerStateStore) {
    match breakers.persist(store).await {
        Ok(count) => debug!(count, "Circuit breaker state saved"),
        Err(e) => warn!(error = %e, "Failed to save circuit breaker state"),
    }
}
