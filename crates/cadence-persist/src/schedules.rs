//! SQLite schedule store

use async_trait::async_trait;
use cadence_scheduler::{Schedule, ScheduleError, ScheduleId, ScheduleStatus, ScheduleStore};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{from_ms, from_opt_ms, opt_ms, parse_uuid, to_ms, StorageError};

pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

impl SqliteScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn schedule_from_row(row: &SqliteRow) -> Result<Schedule, StorageError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    let enabled: i64 = row.try_get("enabled")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let last_job_id: Option<String> = row.try_get("last_job_id")?;

    Ok(Schedule {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        workflow_id: row.try_get("workflow_id")?,
        cron: row.try_get("cron")?,
        payload: serde_json::from_str(&payload)?,
        queue: row.try_get("queue")?,
        status: ScheduleStatus::parse(&status)
            .ok_or_else(|| StorageError::Corrupt(format!("schedule status '{status}'")))?,
        enabled: enabled != 0,
        next_run_at: from_opt_ms(row.try_get("next_run_at")?)?,
        last_run_at: from_opt_ms(row.try_get("last_run_at")?)?,
        last_error: row.try_get("last_error")?,
        retry_count: retry_count as u32,
        last_job_id: last_job_id.as_deref().map(parse_uuid).transpose()?,
        created_at: from_ms(row.try_get("created_at")?)?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
    })
}

fn rows_to_schedules(rows: &[SqliteRow]) -> Result<Vec<Schedule>, ScheduleError> {
    rows.iter()
        .map(|r| schedule_from_row(r).map_err(ScheduleError::from))
        .collect()
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn insert(&self, schedule: &Schedule) -> Result<(), ScheduleError> {
        let payload = serde_json::to_string(&schedule.payload).map_err(StorageError::from)?;
        let result = sqlx::query(
            r#"
            INSERT INTO schedules (
                id, name, workflow_id, cron, payload, queue, status, enabled, next_run_at,
                last_run_at, last_error, retry_count, last_job_id, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(schedule.id.to_string())
        .bind(schedule.name.as_deref())
        .bind(&schedule.workflow_id)
        .bind(&schedule.cron)
        .bind(payload)
        .bind(&schedule.queue)
        .bind(schedule.status.as_str())
        .bind(schedule.enabled)
        .bind(opt_ms(schedule.next_run_at))
        .bind(opt_ms(schedule.last_run_at))
        .bind(schedule.last_error.as_deref())
        .bind(schedule.retry_count as i64)
        .bind(schedule.last_job_id.map(|id| id.to_string()))
        .bind(to_ms(schedule.created_at))
        .bind(to_ms(schedule.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if StorageError::is_unique_violation(&e) => {
                Err(ScheduleError::AlreadyExists(schedule.id))
            }
            Err(e) => Err(StorageError::from(e).into()),
        }
    }

    async fn get(&self, id: ScheduleId) -> Result<Schedule, ScheduleError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?
            .ok_or(ScheduleError::NotFound(id))?;
        Ok(schedule_from_row(&row)?)
    }

    async fn list(&self) -> Result<Vec<Schedule>, ScheduleError> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;
        rows_to_schedules(&rows)
    }

    async fn update(&self, schedule: &Schedule) -> Result<(), ScheduleError> {
        let payload = serde_json::to_string(&schedule.payload).map_err(StorageError::from)?;
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET name = ?, workflow_id = ?, cron = ?, payload = ?, queue = ?, status = ?,
                enabled = ?, next_run_at = ?, last_run_at = ?, last_error = ?,
                retry_count = ?, last_job_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(schedule.name.as_deref())
        .bind(&schedule.workflow_id)
        .bind(&schedule.cron)
        .bind(payload)
        .bind(&schedule.queue)
        .bind(schedule.status.as_str())
        .bind(schedule.enabled)
        .bind(opt_ms(schedule.next_run_at))
        .bind(opt_ms(schedule.last_run_at))
        .bind(schedule.last_error.as_deref())
        .bind(schedule.retry_count as i64)
        .bind(schedule.last_job_id.map(|id| id.to_string()))
        .bind(to_ms(schedule.updated_at))
        .bind(schedule.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;

        if result.rows_affected() == 0 {
            return Err(ScheduleError::NotFound(schedule.id));
        }
        Ok(())
    }

    async fn delete(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            return Err(ScheduleError::NotFound(id));
        }
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, ScheduleError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM schedules
            WHERE enabled = 1 AND status = 'active'
              AND next_run_at IS NOT NULL AND next_run_at <= ?
            ORDER BY next_run_at ASC
            "#,
        )
        .bind(to_ms(now))
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;
        rows_to_schedules(&rows)
    }
}
