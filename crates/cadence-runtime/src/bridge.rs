//! Runs workflows as queue jobs

use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::Classify;
use cadence_queue::{JobContext, JobEntry, JobError, JobHandler};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::RuntimeError;
use crate::executor::{RunControl, WorkflowExecutor};
use crate::model::{WorkflowRun, WorkflowStatus};

/// [`JobHandler`] that executes `job.workflow_id` with `job.payload` as
/// parameters.
///
/// A failed run is retryable only when the failing step's error was
/// transient; configuration errors fail the job for good.
pub struct WorkflowJobHandler {
    executor: Arc<WorkflowExecutor>,
}

impl WorkflowJobHandler {
    pub fn new(executor: Arc<WorkflowExecutor>) -> Self {
        Self { executor }
    }
}

/// Forwards cancellation and progress between the run and its job
struct JobControl<'a> {
    ctx: &'a JobContext,
}

#[async_trait]
impl RunControl for JobControl<'_> {
    async fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled().await
    }

    async fn on_step_finished(&self, run: &WorkflowRun) {
        let total = run.steps.len().max(1);
        let progress = (run.completed_steps() * 100 / total) as u8;
        if let Err(e) = self.ctx.report_progress(progress).await {
            warn!(job_id = %self.ctx.job_id(), error = %e, "Progress update failed");
        }
    }
}

fn job_error(err: RuntimeError) -> JobError {
    if err.is_retryable() {
        JobError::retryable(err.to_string())
    } else {
        JobError::fatal(err.to_string())
    }
}

#[async_trait]
impl JobHandler for WorkflowJobHandler {
    async fn handle(&self, job: &JobEntry, ctx: &JobContext) -> Result<Option<Value>, JobError> {
        let def = self.executor.definition(&job.workflow_id).await.map_err(job_error)?;
        let params = match &job.payload {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };

        let control = JobControl { ctx };
        let run = self
            .executor
            .execute_with(&def, params, Some(job.id), &control)
            .await
            .map_err(job_error)?;

        match run.status {
            WorkflowStatus::Completed => Ok(Some(run.summary())),
            _ if run.cancelled => Err(JobError::Cancelled),
            _ => {
                let failure = run.first_failure();
                let retryable = failure
                    .and_then(|s| s.error_class)
                    .is_some_and(|class| class.is_retryable());
                let message = run
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("workflow '{}' failed", run.workflow_id));
                info!(
                    job_id = %job.id,
                    run_id = %run.id,
                    retryable,
                    "Workflow job failed"
                );
                if retryable {
                    Err(JobError::retryable(message))
                } else {
                    Err(JobError::fatal(message))
                }
            }
        }
    }
}
