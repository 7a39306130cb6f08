//! Workflow definitions and run records

use std::collections::HashSet;

use cadence_core::ErrorClass;
use cadence_resilience::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::handler::HandlerRegistry;
use crate::template::{self, TemplateScope};

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    /// Registered handler name
    pub handler: String,
    #[serde(default)]
    pub config: Value,
    /// Circuit breaker key; falls back to the handler's own choice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Overrides the executor's default step retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, handler: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            handler: handler.into(),
            config,
            dependency: None,
            timeout_ms: None,
            retry: None,
        }
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// An ordered list of steps registered under a stable id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
    /// Keep running later steps after a failure; the run still ends failed
    #[serde(default)]
    pub continue_on_error: bool,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            steps,
            continue_on_error: false,
        }
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// Structural checks run before a definition is stored.
    ///
    /// Step ids must be unique and non-empty, handlers must be registered,
    /// template references must point at earlier steps, and configs without
    /// templates must pass their handler's own validation.
    pub fn validate(&self, registry: &HandlerRegistry) -> Result<(), RuntimeError> {
        let invalid = |msg: String| RuntimeError::InvalidDefinition(format!("{}: {msg}", self.id));

        if self.id.trim().is_empty() {
            return Err(RuntimeError::InvalidDefinition("workflow id is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(invalid("no steps".into()));
        }

        let ids = self.step_ids();
        let mut seen = HashSet::new();
        for id in &ids {
            if id.trim().is_empty() {
                return Err(invalid("step id is empty".into()));
            }
            if id.parse::<usize>().is_ok() {
                return Err(invalid(format!("step id '{id}' is numeric")));
            }
            if !seen.insert(id.as_str()) {
                return Err(invalid(format!("duplicate step id '{id}'")));
            }
        }

        let params = Value::Null;
        for (index, step) in self.steps.iter().enumerate() {
            let handler = registry
                .get(&step.handler)
                .ok_or_else(|| invalid(format!("step '{}' uses unknown handler '{}'", step.id, step.handler)))?;

            let refs = template::references(&step.config)
                .map_err(|e| invalid(format!("step '{}': {e}", step.id)))?;
            let scope = TemplateScope {
                params: &params,
                step_ids: &ids,
                outputs: &[],
                current: index,
            };
            for reference in &refs {
                scope
                    .check(reference)
                    .map_err(|e| invalid(format!("step '{}': {e}", step.id)))?;
            }

            if refs.is_empty() {
                handler
                    .validate(&step.config)
                    .map_err(|e| invalid(format!("step '{}': {e}", step.id)))?;
            }
        }
        Ok(())
    }
}

/// Execution record of one step inside a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub id: String,
    pub handler: String,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_class: Option<ErrorClass>,
    /// Handler invocations, retries included
    #[serde(default)]
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRun {
    fn pending(def: &StepDefinition) -> Self {
        Self {
            id: def.id.clone(),
            handler: def.handler.clone(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            error_class: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One execution of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: String,
    /// Job that carried this run, if any
    #[serde(default)]
    pub job_id: Option<Uuid>,
    pub status: WorkflowStatus,
    pub current_step_index: usize,
    /// Parameters the run started with
    #[serde(default)]
    pub params: Value,
    /// Completed step outputs keyed by step id
    #[serde(default)]
    pub context: serde_json::Map<String, Value>,
    pub steps: Vec<StepRun>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(def: &WorkflowDefinition, params: Value, job_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: def.id.clone(),
            job_id,
            status: WorkflowStatus::Pending,
            current_step_index: 0,
            params,
            context: serde_json::Map::new(),
            steps: def.steps.iter().map(StepRun::pending).collect(),
            cancelled: false,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Outputs aligned with step order; `None` for steps without a result
    pub fn outputs(&self) -> Vec<Option<Value>> {
        self.steps
            .iter()
            .map(|s| match s.status {
                StepStatus::Completed => s.result.clone(),
                _ => None,
            })
            .collect()
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// First failed step, if any
    pub fn first_failure(&self) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    /// Compact view used as a job result
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "run_id": self.id,
            "workflow_id": self.workflow_id,
            "status": self.status,
            "steps": self.steps.iter().map(|s| serde_json::json!({
                "id": s.id,
                "status": s.status,
                "attempts": s.attempts,
            })).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::with_builtins()
    }

    #[test]
    fn test_valid_definition() {
        let def = WorkflowDefinition::new(
            "ingest",
            vec![
                StepDefinition::new("fetch", "echo", json!({ "rows": [1, 2] })),
                StepDefinition::new("wait", "sleep", json!({ "ms": 10 })),
                StepDefinition::new("report", "echo", json!({ "n": "{{steps.fetch.rows}}" })),
            ],
        );
        assert!(def.validate(&registry()).is_ok());
    }

    #[test]
    fn test_rejects_forward_and_unknown() {
        let forward = WorkflowDefinition::new(
            "wf",
            vec![
                StepDefinition::new("a", "echo", json!({ "x": "{{steps.b.y}}" })),
                StepDefinition::new("b", "echo", json!({})),
            ],
        );
        assert!(matches!(
            forward.validate(&registry()),
            Err(RuntimeError::InvalidDefinition(msg)) if msg.contains("does not run before")
        ));

        let self_ref = WorkflowDefinition::new(
            "wf",
            vec![StepDefinition::new("a", "echo", json!({ "x": "{{steps.0.y}}" }))],
        );
        assert!(self_ref.validate(&registry()).is_err());

        let unknown = WorkflowDefinition::new("wf", vec![StepDefinition::new("a", "ftp", json!({}))]);
        assert!(unknown.validate(&registry()).is_err());

        let dup = WorkflowDefinition::new(
            "wf",
            vec![
                StepDefinition::new("a", "echo", json!({})),
                StepDefinition::new("a", "echo", json!({})),
            ],
        );
        assert!(dup.validate(&registry()).is_err());
    }

    #[test]
    fn test_static_config_is_validated_by_handler() {
        let bad = WorkflowDefinition::new("wf", vec![StepDefinition::new("s", "sleep", json!({ "secs": 1 }))]);
        assert!(bad.validate(&registry()).is_err());

        // Templated configs are checked after resolution instead
        let templated = WorkflowDefinition::new(
            "wf",
            vec![StepDefinition::new("s", "sleep", json!({ "ms": "{{params.delay}}" }))],
        );
        assert!(templated.validate(&registry()).is_ok());
    }

    #[test]
    fn test_definition_parses_from_json() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "id": "daily-report",
            "steps": [
                { "id": "fetch", "handler": "http", "config": { "url": "https://example.com" },
                  "timeout_ms": 5000, "retry": { "max_attempts": 5 } },
                { "id": "show", "handler": "echo", "config": { "body": "{{steps.fetch.body}}" } }
            ]
        }))
        .unwrap();
        assert_eq!(def.steps[0].retry.as_ref().unwrap().max_attempts, 5);
        assert_eq!(def.steps[0].retry.as_ref().unwrap().base_delay_ms, 200);
        assert!(!def.continue_on_error);
        assert!(def.validate(&registry()).is_ok());
    }
}
