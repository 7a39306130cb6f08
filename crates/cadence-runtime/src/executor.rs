//! Sequential workflow execution
//!
//! Each step resolves its templates against earlier outputs, then runs its
//! handler as `retry(breaker(timeout(handle)))`. The run record is saved
//! after every step so history survives a crash mid-workflow.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{Classify, Clock, SharedClock};
use cadence_resilience::{BreakerRegistry, RetryError, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RuntimeError, StepError};
use crate::handler::{HandlerRegistry, StepContext, StepHandler};
use crate::model::{StepDefinition, StepStatus, WorkflowDefinition, WorkflowRun, WorkflowStatus};
use crate::store::WorkflowStore;
use crate::template::{self, TemplateScope};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Retry policy for steps that do not bring their own
    pub default_retry: RetryPolicy,
    /// Deadline per handler invocation
    pub default_step_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            default_step_timeout_ms: 30_000,
        }
    }
}

/// Hooks a caller uses to steer a run between steps
#[async_trait]
pub trait RunControl: Send + Sync {
    /// Polled before each step starts
    async fn is_cancelled(&self) -> bool {
        false
    }

    /// Called after each step settles
    async fn on_step_finished(&self, _run: &WorkflowRun) {}
}

/// Control that never cancels
#[derive(Debug, Default, Clone, Copy)]
pub struct Uncontrolled;

impl RunControl for Uncontrolled {}

pub struct WorkflowExecutor {
    handlers: Arc<HandlerRegistry>,
    breakers: Arc<BreakerRegistry>,
    store: Arc<dyn WorkflowStore>,
    clock: SharedClock,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        breakers: Arc<BreakerRegistry>,
        store: Arc<dyn WorkflowStore>,
        clock: SharedClock,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            handlers,
            breakers,
            store,
            clock,
            config,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Validate and store a definition, replacing any previous version
    pub async fn register(&self, def: &WorkflowDefinition) -> Result<(), RuntimeError> {
        def.validate(&self.handlers)?;
        self.store.save_definition(def).await?;
        info!(workflow_id = %def.id, steps = def.steps.len(), "Workflow registered");
        Ok(())
    }

    pub async fn definition(&self, workflow_id: &str) -> Result<WorkflowDefinition, RuntimeError> {
        self.store
            .get_definition(workflow_id)
            .await?
            .ok_or_else(|| RuntimeError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Run a stored definition to completion
    pub async fn execute_by_id(&self, workflow_id: &str, params: Value) -> Result<WorkflowRun, RuntimeError> {
        let def = self.definition(workflow_id).await?;
        self.execute(&def, params).await
    }

    pub async fn execute(&self, def: &WorkflowDefinition, params: Value) -> Result<WorkflowRun, RuntimeError> {
        self.execute_with(def, params, None, &Uncontrolled).await
    }

    /// Run every step in order.
    ///
    /// Step failures do not make this return `Err`; they are recorded on the
    /// returned run. `Err` means the run record itself could not be stored.
    pub async fn execute_with(
        &self,
        def: &WorkflowDefinition,
        params: Value,
        job_id: Option<Uuid>,
        control: &dyn RunControl,
    ) -> Result<WorkflowRun, RuntimeError> {
        let mut run = WorkflowRun::new(def, params, job_id, self.clock.now());
        run.status = WorkflowStatus::Running;
        self.store.save_run(&run).await?;

        info!(
            run_id = %run.id,
            workflow_id = %def.id,
            steps = def.steps.len(),
            "Workflow run started"
        );

        let step_ids = def.step_ids();
        let mut failed = false;
        let mut halted = false;

        for (index, step) in def.steps.iter().enumerate() {
            run.current_step_index = index;

            if !halted && control.is_cancelled().await {
                info!(run_id = %run.id, step = %step.id, "Workflow run cancelled");
                run.cancelled = true;
                run.error = Some(format!("cancelled before step '{}'", step.id));
                failed = true;
                halted = true;
            }

            if halted {
                run.steps[index].status = StepStatus::Skipped;
                continue;
            }

            let started = self.clock.now();
            run.steps[index].status = StepStatus::Running;
            run.steps[index].started_at = Some(started);
            run.updated_at = started;
            self.store.save_run(&run).await?;
            debug!(run_id = %run.id, step = %step.id, handler = %step.handler, "Step started");

            let (outcome, attempts) = self.run_step(def, step, index, &step_ids, &run).await;

            let now = self.clock.now();
            let record = &mut run.steps[index];
            record.attempts = attempts;
            record.completed_at = Some(now);
            match outcome {
                Ok(output) => {
                    record.status = StepStatus::Completed;
                    record.result = Some(output.clone());
                    run.context.insert(step.id.clone(), output);
                    debug!(run_id = %run.id, step = %step.id, attempts, "Step completed");
                }
                Err(e) => {
                    warn!(
                        run_id = %run.id,
                        step = %step.id,
                        attempts,
                        class = ?e.class(),
                        error = %e,
                        "Step failed"
                    );
                    record.status = StepStatus::Failed;
                    record.error = Some(e.to_string());
                    record.error_class = Some(e.class());
                    if run.error.is_none() {
                        run.error = Some(format!("step '{}' failed: {e}", step.id));
                    }
                    failed = true;
                    if !def.continue_on_error {
                        halted = true;
                    }
                }
            }
            run.updated_at = now;
            self.store.save_run(&run).await?;
            control.on_step_finished(&run).await;
        }

        let now = self.clock.now();
        run.status = if failed {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        run.updated_at = now;
        run.completed_at = Some(now);
        self.store.save_run(&run).await?;

        info!(
            run_id = %run.id,
            workflow_id = %def.id,
            status = %run.status,
            completed = run.completed_steps(),
            total = run.steps.len(),
            "Workflow run finished"
        );
        Ok(run)
    }

    /// Resolve, validate and invoke one step. Returns the handler
    /// invocation count alongside the outcome.
    async fn run_step(
        &self,
        def: &WorkflowDefinition,
        step: &StepDefinition,
        index: usize,
        step_ids: &[String],
        run: &WorkflowRun,
    ) -> (Result<Value, StepError>, u32) {
        let handler = match self.handlers.get(&step.handler) {
            Some(h) => h,
            None => return (Err(StepError::UnknownHandler(step.handler.clone())), 0),
        };

        let outputs = run.outputs();
        let scope = TemplateScope {
            params: &run.params,
            step_ids,
            outputs: &outputs,
            current: index,
        };
        let config = match template::resolve(&step.config, &scope) {
            Ok(c) => c,
            Err(e) => return (Err(e.into()), 0),
        };
        if let Err(e) = handler.validate(&config) {
            return (Err(e), 0);
        }

        let ctx = StepContext {
            run_id: run.id,
            workflow_id: def.id.clone(),
            step_index: index,
            step_id: step.id.clone(),
            params: run.params.clone(),
            outputs: run.context.clone(),
        };
        let dependency = step.dependency.clone().or_else(|| handler.dependency(&config));
        let policy = step.retry.as_ref().unwrap_or(&self.config.default_retry);
        let timeout = Duration::from_millis(step.timeout_ms.unwrap_or(self.config.default_step_timeout_ms));

        let attempts = AtomicU32::new(0);
        let result = {
            let handler: &dyn StepHandler = handler.as_ref();
            let config = &config;
            let ctx = &ctx;
            let dependency = dependency.as_deref();
            let attempts = &attempts;
            let breakers = self.breakers.as_ref();
            policy
                .run(move || async move {
                    attempts.fetch_add(1, Ordering::Relaxed);
                    let call = with_timeout(handler.handle(config, ctx), timeout);
                    match dependency {
                        Some(dep) => breakers.call(dep, call).await.map_err(StepError::from),
                        None => call.await,
                    }
                })
                .await
                .map_err(RetryError::into_inner)
        };
        (result, attempts.load(Ordering::Relaxed))
    }
}

async fn with_timeout<F>(fut: F, timeout: Duration) -> Result<Value, StepError>
where
    F: std::future::Future<Output = Result<Value, StepError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StepError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("handlers", &self.handlers)
            .field("config", &self.config)
            .finish()
    }
}
