//! Storage of workflow definitions and run history

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RuntimeError;
use crate::model::{RunId, WorkflowDefinition, WorkflowRun};

/// Persistence for definitions and runs
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert or replace a definition
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RuntimeError>;

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, RuntimeError>;

    /// All definitions ordered by id
    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RuntimeError>;

    async fn delete_definition(&self, id: &str) -> Result<bool, RuntimeError>;

    /// Insert or replace a run record
    async fn save_run(&self, run: &WorkflowRun) -> Result<(), RuntimeError>;

    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>, RuntimeError>;

    /// Newest first, optionally restricted to one workflow
    async fn list_runs(
        &self,
        workflow_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, RuntimeError>;
}

/// In-process store for tests and the `memory` backend
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    runs: RwLock<HashMap<RunId, WorkflowRun>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RuntimeError> {
        self.definitions.write().insert(def.id.clone(), def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, RuntimeError> {
        Ok(self.definitions.read().get(id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RuntimeError> {
        let mut defs: Vec<_> = self.definitions.read().values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, RuntimeError> {
        Ok(self.definitions.write().remove(id).is_some())
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<(), RuntimeError> {
        self.runs.write().insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>, RuntimeError> {
        Ok(self.runs.read().get(&id).cloned())
    }

    async fn list_runs(
        &self,
        workflow_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, RuntimeError> {
        let mut runs: Vec<_> = self
            .runs
            .read()
            .values()
            .filter(|r| workflow_id.map_or(true, |w| r.workflow_id == w))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }
}
