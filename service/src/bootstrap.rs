//! Startup wiring: storage, settlement client, engine and intake.
//!
//! Everything is built once and injected. A settlement client that cannot
//! be built does not stop startup; its construction error is handed to the
//! settlement step, which reports it for every request.

use crate::config::Config;
use crate::intake::IntakeService;
use crate::lifecycle::RequestLifecycle;
use crate::provider;
use crate::steps::{SettlementStep, StatusTransitionStep};
use settlement_core::environment::{Clock, SystemClock};
use settlement_core::{RequestStore, SettlementClient, SettlementError};
use settlement_postgres::{PostgresError, PostgresExecutionLog, PostgresRequestStore};
use settlement_runtime::retry::retry_with_backoff;
use settlement_runtime::{Engine, EngineError, ExecutionLog, InMemoryExecutionLog, RetryPolicy};
use settlement_testing::InMemoryRequestStore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Backoff for the initial database connection.
fn connect_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(5)
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(5))
        .jitter(true)
        .build()
}

/// Errors that abort startup.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The database could not be reached or migrated.
    #[error(transparent)]
    Postgres(#[from] PostgresError),

    /// The engine could not be built.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// The wired service.
pub struct Dependencies {
    /// Configuration the service was built from.
    pub config: Config,
    /// Request records.
    pub store: Arc<dyn RequestStore>,
    /// Engine running the request lifecycle.
    pub engine: Engine,
    /// Intake entry point.
    pub intake: IntakeService,
}

impl Dependencies {
    /// Build storage from `config`, then everything on top of it.
    ///
    /// Uses `PostgreSQL` for both the request store and the execution log
    /// when a database URL is configured, in-memory storage otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if the database is unreachable, migrations
    /// fail or the engine cannot be built.
    pub async fn build(config: Config) -> Result<Self, BootstrapError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (store, log): (Arc<dyn RequestStore>, Arc<dyn ExecutionLog>) =
            if let Some(url) = &config.database.url {
                tracing::info!("Connecting to request database...");
                let max_connections = config.database.max_connections;
                let pool = retry_with_backoff(&connect_policy(), || {
                    settlement_postgres::connect(url, max_connections)
                })
                .await?;
                settlement_postgres::migrate(&pool).await?;
                tracing::info!("Request database connected and migrated");
                (
                    Arc::new(PostgresRequestStore::new(pool.clone())),
                    Arc::new(PostgresExecutionLog::new(pool)),
                )
            } else {
                tracing::warn!("DATABASE_URL not set, requests and runs are kept in memory");
                (
                    Arc::new(InMemoryRequestStore::new()),
                    Arc::new(InMemoryExecutionLog::new()),
                )
            };

        let settlement = provider::from_config(&config.settlement, Arc::clone(&clock))
            .inspect(|_| {
                tracing::info!(provider = %config.settlement.provider, "Settlement client ready");
            })
            .inspect_err(|e| tracing::error!(error = %e, "Settlement client unavailable"));

        Self::assemble(config, store, log, settlement, clock)
    }

    /// Wire the lifecycle, engine and intake over the given collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Engine`] if the engine cannot be built.
    pub fn assemble(
        config: Config,
        store: Arc<dyn RequestStore>,
        log: Arc<dyn ExecutionLog>,
        settlement: Result<Arc<dyn SettlementClient>, SettlementError>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BootstrapError> {
        let lifecycle = RequestLifecycle::new(
            SettlementStep::new(settlement),
            StatusTransitionStep::new(Arc::clone(&store)),
            config.engine.step_options(),
        );

        let engine = Engine::builder()
            .log(log)
            .clock(Arc::clone(&clock))
            .task_queue(config.engine.task_queue.clone())
            .workers(config.engine.workers)
            .step_slots(config.engine.step_slots)
            .lease(config.engine.lease())
            .register(lifecycle)
            .build()?;

        let intake = IntakeService::new(
            Arc::clone(&store),
            engine.launcher(&config.engine.task_queue),
            clock,
            config.engine.task_queue.clone(),
            config.engine.process_timeout(),
        );

        Ok(Self {
            config,
            store,
            engine,
            intake,
        })
    }
}
