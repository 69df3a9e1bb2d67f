//! `PostgreSQL` storage for mint/redeem settlement.
//!
//! This crate provides the durable implementations of the two storage seams
//! in the workspace:
//!
//! - [`PostgresRequestStore`]: the request table behind
//!   [`RequestStore`](settlement_core::RequestStore)
//! - [`PostgresExecutionLog`]: runs and step outcomes behind
//!   [`ExecutionLog`](settlement_runtime::ExecutionLog)
//!
//! Both share one connection pool and one migration set.
//!
//! # Example
//!
//! ```no_run
//! use settlement_postgres::{PostgresExecutionLog, PostgresRequestStore, connect};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/settlement", 10).await?;
//! settlement_postgres::migrate(&pool).await?;
//!
//! let requests = PostgresRequestStore::new(pool.clone());
//! let log = PostgresExecutionLog::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod execution_log;
mod requests;

pub use execution_log::PostgresExecutionLog;
pub use requests::PostgresRequestStore;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

/// Errors from pool setup and migrations.
#[derive(Error, Debug)]
pub enum PostgresError {
    /// The pool could not connect.
    #[error("Failed to connect: {0}")]
    Connect(String),

    /// Migrations failed to apply.
    #[error("Migration failed: {0}")]
    Migrate(String),
}

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`PostgresError::Connect`] if the database is unreachable.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, PostgresError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| PostgresError::Connect(e.to_string()))
}

/// Apply the `requests`, `process_runs` and `process_steps` migrations.
///
/// # Errors
///
/// Returns [`PostgresError::Migrate`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), PostgresError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| PostgresError::Migrate(e.to_string()))?;
    Ok(())
}
