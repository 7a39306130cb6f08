//! SQLite snapshot store for circuit breakers

use async_trait::async_trait;
use cadence_core::{Clock, SharedClock, SystemClock};
use cadence_resilience::{BreakerStateStore, CircuitBreakerState, CircuitState};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{from_opt_ms, opt_ms, to_ms, StorageError};

pub struct SqliteBreakerStore {
    pool: SqlitePool,
    clock: SharedClock,
}

impl SqliteBreakerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, SystemClock::shared())
    }

    pub fn with_clock(pool: SqlitePool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    async fn save(&self, states: &[CircuitBreakerState]) -> Result<(), StorageError> {
        let now = to_ms(self.clock.now());
        let mut tx = self.pool.begin().await?;
        for state in states {
            sqlx::query(
                r#"
                INSERT INTO circuit_breakers (
                    dependency, state, consecutive_failures, half_open_successes, reopen_count,
                    last_failure_at, opened_at, half_open_trial_in_flight, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (dependency) DO UPDATE SET
                    state = excluded.state,
                    consecutive_failures = excluded.consecutive_failures,
                    half_open_successes = excluded.half_open_successes,
                    reopen_count = excluded.reopen_count,
                    last_failure_at = excluded.last_failure_at,
                    opened_at = excluded.opened_at,
                    half_open_trial_in_flight = excluded.half_open_trial_in_flight,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&state.dependency)
            .bind(state.state.as_str())
            .bind(state.consecutive_failures as i64)
            .bind(state.half_open_successes as i64)
            .bind(state.reopen_count as i64)
            .bind(opt_ms(state.last_failure_at))
            .bind(opt_ms(state.opened_at))
            .bind(state.half_open_trial_in_flight)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<CircuitBreakerState>, StorageError> {
        let rows = sqlx::query("SELECT * FROM circuit_breakers ORDER BY dependency ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(state_from_row).collect()
    }
}

fn state_from_row(row: &SqliteRow) -> Result<CircuitBreakerState, StorageError> {
    let state: String = row.try_get("state")?;
    let failures: i64 = row.try_get("consecutive_failures")?;
    let successes: i64 = row.try_get("half_open_successes")?;
    let reopens: i64 = row.try_get("reopen_count")?;
    let trial: i64 = row.try_get("half_open_trial_in_flight")?;
    Ok(CircuitBreakerState {
        dependency: row.try_get("dependency")?,
        state: CircuitState::parse(&state)
            .ok_or_else(|| StorageError::Corrupt(format!("circuit state '{state}'")))?,
        consecutive_failures: failures as u32,
        half_open_successes: successes as u32,
        reopen_count: reopens as u32,
        last_failure_at: from_opt_ms(row.try_get("last_failure_at")?)?,
        opened_at: from_opt_ms(row.try_get("opened_at")?)?,
        half_open_trial_in_flight: trial != 0,
    })
}

#[async_trait]
impl BreakerStateStore for SqliteBreakerStore {
    async fn save_breakers(&self, states: &[CircuitBreakerState]) -> Result<(), String> {
        self.save(states).await.map_err(|e| e.to_string())
    }

    async fn load_breakers(&self) -> Result<Vec<CircuitBreakerState>, String> {
        self.load().await.map_err(|e| e.to_string())
    }
}
