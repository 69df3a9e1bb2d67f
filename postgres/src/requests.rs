//! `PostgreSQL` request store.

use settlement_core::{
    Amount, Request, RequestId, RequestKind, RequestStatus, RequestStore, RunId, StoreError,
};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Request storage backed by the `requests` table.
///
/// `save` writes only the mutable columns (`status`, `run_id`); identity,
/// kind, amount, recipient and creation time are fixed at `create`.
/// `save_if` adds the stored status to the `WHERE` clause, so the check and
/// the write are one statement.
#[derive(Clone)]
pub struct PostgresRequestStore {
    pool: PgPool,
}

impl PostgresRequestStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_request(row: &sqlx::postgres::PgRow) -> Result<Request, StoreError> {
        let corrupt = |e: sqlx::Error| StoreError::Corrupt(e.to_string());

        let kind: String = row.try_get("kind").map_err(corrupt)?;
        let status: String = row.try_get("status").map_err(corrupt)?;
        let amount: i64 = row.try_get("amount_minor").map_err(corrupt)?;
        let run_id: Option<String> = row.try_get("run_id").map_err(corrupt)?;

        Ok(Request {
            id: RequestId::from_uuid(row.try_get("id").map_err(corrupt)?),
            kind: RequestKind::parse(&kind)
                .map_err(|e| StoreError::Corrupt(e.detail().to_string()))?,
            amount: Amount::from_minor_units(amount)
                .map_err(|e| StoreError::Corrupt(e.detail().to_string()))?,
            recipient: row.try_get("recipient").map_err(corrupt)?,
            status: RequestStatus::parse(&status)
                .map_err(|e| StoreError::Corrupt(e.detail().to_string()))?,
            created_at: row.try_get("created_at").map_err(corrupt)?,
            run_id: run_id.map(RunId::new),
        })
    }
}

impl RequestStore for PostgresRequestStore {
    fn create(
        &self,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO requests (id, kind, amount_minor, recipient, status, created_at, run_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(request.id.as_uuid())
            .bind(request.kind.as_str())
            .bind(request.amount.minor_units())
            .bind(&request.recipient)
            .bind(request.status.as_str())
            .bind(request.created_at)
            .bind(request.run_id.as_ref().map(RunId::as_str))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db_err) = &e {
                    if db_err.is_unique_violation() {
                        return StoreError::Duplicate(request.id);
                    }
                }
                StoreError::Database(e.to_string())
            })?;

            tracing::debug!(
                request_id = %request.id,
                kind = request.kind.as_str(),
                "Request created"
            );
            Ok(())
        })
    }

    fn find_by_id(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Request, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT id, kind, amount_minor, recipient, status, created_at, run_id
                FROM requests
                WHERE id = $1
                ",
            )
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::NotFound(id))?;

            Self::row_to_request(&row)
        })
    }

    fn save(
        &self,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE requests
                SET status = $1, run_id = $2
                WHERE id = $3
                ",
            )
            .bind(request.status.as_str())
            .bind(request.run_id.as_ref().map(RunId::as_str))
            .bind(request.id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(request.id));
            }

            tracing::debug!(
                request_id = %request.id,
                status = request.status.as_str(),
                "Request saved"
            );
            Ok(())
        })
    }

    fn save_if(
        &self,
        request: Request,
        expected: RequestStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE requests
                SET status = $1, run_id = $2
                WHERE id = $3 AND status = $4
                ",
            )
            .bind(request.status.as_str())
            .bind(request.run_id.as_ref().map(RunId::as_str))
            .bind(request.id.as_uuid())
            .bind(expected.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            if result.rows_affected() == 0 {
                let actual: Option<(String,)> =
                    sqlx::query_as("SELECT status FROM requests WHERE id = $1")
                        .bind(request.id.as_uuid())
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| StoreError::Database(e.to_string()))?;
                let Some((actual,)) = actual else {
                    return Err(StoreError::NotFound(request.id));
                };
                let actual = RequestStatus::parse(&actual)
                    .map_err(|e| StoreError::Corrupt(e.detail().to_string()))?;
                return Err(StoreError::ConcurrencyConflict {
                    id: request.id,
                    expected,
                    actual,
                });
            }

            tracing::debug!(
                request_id = %request.id,
                status = request.status.as_str(),
                expected = expected.as_str(),
                "Request saved"
            );
            Ok(())
        })
    }
}
