//! Lease expiry sweeper

use cadence_core::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::backend::{QueueBackend, QueueError};
use crate::job::JobEntry;
use crate::worker::JobObserver;

/// Periodically returns jobs with expired leases to the queue.
///
/// A worker that crashes or stalls stops heartbeating; once its lease runs
/// out the job is requeued (counting as a failed attempt) or dead-lettered.
pub struct LeaseSweeper {
    backend: Arc<dyn QueueBackend>,
    observer: Option<Arc<dyn JobObserver>>,
    interval: Duration,
}

impl LeaseSweeper {
    pub fn new(backend: Arc<dyn QueueBackend>, interval: Duration) -> Self {
        Self {
            backend,
            observer: None,
            interval,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// One sweep
    pub async fn sweep(&self) -> Result<Vec<JobEntry>, QueueError> {
        let reclaimed = self.backend.reclaim_expired().await?;
        self.report(&reclaimed, "Reclaimed job with expired lease").await;
        Ok(reclaimed)
    }

    /// Startup recovery of jobs left `running` by a previous process
    pub async fn recover(&self) -> Result<Vec<JobEntry>, QueueError> {
        let recovered = self.backend.recover_abandoned().await?;
        self.report(&recovered, "Recovered job abandoned by previous run").await;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Abandoned jobs recovered");
        }
        Ok(recovered)
    }

    async fn report(&self, jobs: &[JobEntry], msg: &str) {
        for job in jobs {
            warn!(job_id = %job.id, status = %job.status, attempts = job.attempts, "{}", msg);
            if job.status.is_terminal() {
                if let Some(observer) = &self.observer {
                    observer.on_job_finished(job).await;
                }
            }
        }
    }

    pub async fn run(&self, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Lease sweep failed");
            }
        }
        info!("Lease sweeper stopped");
    }
}
