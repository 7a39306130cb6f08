//! SQLite workflow definition and run history store

use async_trait::async_trait;
use cadence_runtime::{RunId, RuntimeError, WorkflowDefinition, WorkflowRun, WorkflowStore};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::error::{opt_ms, to_ms, StorageError};

/// Definitions and runs are stored as JSON documents next to the columns
/// queries filter and sort on.
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn decode<T: serde::de::DeserializeOwned>(doc: &str) -> Result<T, RuntimeError> {
    serde_json::from_str(doc).map_err(|e| StorageError::Corrupt(e.to_string()).into())
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RuntimeError> {
        let now = to_ms(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&def.id)
        .bind(&def.name)
        .bind(serde_json::to_string(def)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, RuntimeError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?;
        match row {
            Some(row) => {
                let doc: String = row.try_get("definition").map_err(StorageError::from)?;
                Ok(Some(decode(&doc)?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RuntimeError> {
        let rows = sqlx::query("SELECT definition FROM workflows ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;
        rows.iter()
            .map(|r| -> Result<WorkflowDefinition, RuntimeError> {
                let doc: String = r.try_get("definition").map_err(StorageError::from)?;
                decode(&doc)
            })
            .collect()
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, RuntimeError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<(), RuntimeError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                id, workflow_id, job_id, status, current_step_index, record,
                created_at, updated_at, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                current_step_index = excluded.current_step_index,
                record = excluded.record,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_id)
        .bind(run.job_id.map(|id| id.to_string()))
        .bind(run.status.as_str())
        .bind(run.current_step_index as i64)
        .bind(serde_json::to_string(run)?)
        .bind(to_ms(run.created_at))
        .bind(to_ms(run.updated_at))
        .bind(opt_ms(run.completed_at))
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>, RuntimeError> {
        let row = sqlx::query("SELECT record FROM workflow_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?;
        match row {
            Some(row) => {
                let doc: String = row.try_get("record").map_err(StorageError::from)?;
                Ok(Some(decode(&doc)?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        workflow_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, RuntimeError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match workflow_id {
            Some(workflow_id) => {
                sqlx::query(
                    "SELECT record FROM workflow_runs WHERE workflow_id = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(workflow_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT record FROM workflow_runs ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(StorageError::from)?;

        rows.iter()
            .map(|r| -> Result<WorkflowRun, RuntimeError> {
                let doc: String = r.try_get("record").map_err(StorageError::from)?;
                decode(&doc)
            })
            .collect()
    }
}
