//! `PostgreSQL` execution log.

use chrono::{DateTime, Utc};
use settlement_core::RunId;
use settlement_runtime::{ExecutionLog, LogError, RunOutcome, RunRecord, RunStatus};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Durable [`ExecutionLog`] over the `process_runs` and `process_steps` tables.
///
/// A partial unique index on `process_runs(process_id) WHERE status = 'running'`
/// enforces at most one open run per process id across every engine sharing
/// the database. Leases are claimed with a single conditional `UPDATE`, so
/// two engines racing for an expired lease cannot both win.
#[derive(Clone)]
pub struct PostgresExecutionLog {
    pool: PgPool,
}

impl PostgresExecutionLog {
    /// Create a log over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<RunRecord, LogError> {
        let storage = |e: sqlx::Error| LogError::Storage(e.to_string());
        let run_id: String = row.try_get("run_id").map_err(storage)?;
        let status: String = row.try_get("status").map_err(storage)?;

        Ok(RunRecord {
            run_id: RunId::new(run_id),
            process_id: row.try_get("process_id").map_err(storage)?,
            process_type: row.try_get("process_type").map_err(storage)?,
            task_queue: row.try_get("task_queue").map_err(storage)?,
            input: row.try_get("input").map_err(storage)?,
            status: RunStatus::parse(&status)?,
            error: row.try_get("error").map_err(storage)?,
            error_detail: row.try_get("error_detail").map_err(storage)?,
            started_at: row.try_get("started_at").map_err(storage)?,
            deadline: row.try_get("deadline").map_err(storage)?,
            finished_at: row.try_get("finished_at").map_err(storage)?,
            owner: row.try_get("owner").map_err(storage)?,
            lease_expires_at: row.try_get("lease_expires_at").map_err(storage)?,
        })
    }
}

fn seq_column(seq: u32) -> Result<i32, LogError> {
    i32::try_from(seq).map_err(|_| LogError::Storage(format!("step sequence out of range: {seq}")))
}

impl ExecutionLog for PostgresExecutionLog {
    fn start_run(
        &self,
        run: RunRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO process_runs (
                    run_id, process_id, process_type, task_queue, input,
                    status, error, error_detail, started_at, deadline, finished_at,
                    owner, lease_expires_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ",
            )
            .bind(run.run_id.as_str())
            .bind(&run.process_id)
            .bind(&run.process_type)
            .bind(&run.task_queue)
            .bind(&run.input)
            .bind(run.status.as_str())
            .bind(&run.error)
            .bind(&run.error_detail)
            .bind(run.started_at)
            .bind(run.deadline)
            .bind(run.finished_at)
            .bind(&run.owner)
            .bind(run.lease_expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db_err) = &e {
                    if db_err.is_unique_violation() {
                        return LogError::AlreadyStarted(run.process_id.clone());
                    }
                }
                LogError::Storage(e.to_string())
            })?;

            tracing::debug!(run_id = %run.run_id, process_id = %run.process_id, "Run recorded");
            Ok(())
        })
    }

    fn find_run(
        &self,
        run_id: RunId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RunRecord>, LogError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT run_id, process_id, process_type, task_queue, input, status,
                       error, error_detail, started_at, deadline, finished_at,
                       owner, lease_expires_at
                FROM process_runs
                WHERE run_id = $1
                ",
            )
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;

            row.as_ref().map(Self::row_to_run).transpose()
        })
    }

    fn open_runs(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RunRecord>, LogError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT run_id, process_id, process_type, task_queue, input, status,
                       error, error_detail, started_at, deadline, finished_at,
                       owner, lease_expires_at
                FROM process_runs
                WHERE status = 'running'
                ORDER BY started_at ASC
                ",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;

            rows.iter().map(Self::row_to_run).collect()
        })
    }

    fn load_step(
        &self,
        run_id: RunId,
        seq: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, LogError>> + Send + '_>> {
        Box::pin(async move {
            let row: Option<(Vec<u8>,)> = sqlx::query_as(
                r"
                SELECT outcome FROM process_steps
                WHERE run_id = $1 AND seq = $2
                ",
            )
            .bind(run_id.as_str())
            .bind(seq_column(seq)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;

            Ok(row.map(|(outcome,)| outcome))
        })
    }

    fn record_step(
        &self,
        run_id: RunId,
        seq: u32,
        step: &'static str,
        outcome: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO process_steps (run_id, seq, step, outcome)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (run_id, seq) DO NOTHING
                ",
            )
            .bind(run_id.as_str())
            .bind(seq_column(seq)?)
            .bind(step)
            .bind(&outcome)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db_err) = &e {
                    if db_err.is_foreign_key_violation() {
                        return LogError::RunNotFound(run_id.clone());
                    }
                }
                LogError::Storage(e.to_string())
            })?;

            Ok(())
        })
    }

    fn claim_run(
        &self,
        run_id: RunId,
        owner: String,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LogError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE process_runs
                SET owner = $2, lease_expires_at = $4
                WHERE run_id = $1
                  AND status = 'running'
                  AND (owner = $2 OR lease_expires_at <= $3)
                ",
            )
            .bind(run_id.as_str())
            .bind(&owner)
            .bind(now)
            .bind(lease_until)
            .execute(&self.pool)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;

            if result.rows_affected() > 0 {
                return Ok(true);
            }

            let exists: Option<(String,)> =
                sqlx::query_as("SELECT run_id FROM process_runs WHERE run_id = $1")
                    .bind(run_id.as_str())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| LogError::Storage(e.to_string()))?;
            if exists.is_none() {
                return Err(LogError::RunNotFound(run_id));
            }

            tracing::debug!(run_id = %run_id, %owner, "Run lease held elsewhere");
            Ok(false)
        })
    }

    fn finish_run(
        &self,
        run_id: RunId,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE process_runs
                SET status = $1, error = $2, error_detail = $3, finished_at = $4
                WHERE run_id = $5
                ",
            )
            .bind(outcome.status.as_str())
            .bind(&outcome.error)
            .bind(&outcome.error_detail)
            .bind(finished_at)
            .bind(run_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(LogError::RunNotFound(run_id));
            }

            tracing::debug!(run_id = %run_id, status = outcome.status.as_str(), "Run finished");
            Ok(())
        })
    }
}
