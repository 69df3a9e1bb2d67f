//! Configuration management for the mint/redeem service.
//!
//! Loads configuration from environment variables with sensible defaults.

use serde::{Deserialize, Serialize};
use settlement_runtime::{RetryPolicy, StepOptions};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Request store and execution log database
    pub database: DatabaseConfig,
    /// Settlement provider selection and credentials
    pub settlement: SettlementConfig,
    /// Durable-execution engine knobs
    pub engine: EngineConfig,
    /// Prometheus scrape address; no exporter when unset
    pub metrics_addr: Option<SocketAddr>,
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL. In-memory storage when unset.
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Settlement provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// `fake` or `http`
    pub provider: String,
    /// Provider API base URL (http provider)
    pub base_url: String,
    /// Bearer token (http provider)
    pub jwt: String,
    /// Per-call HTTP timeout in seconds
    pub http_timeout_secs: u64,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Routing key shared by every worker able to run the lifecycle
    pub task_queue: String,
    /// Runs executed concurrently
    pub workers: usize,
    /// Step attempts executed concurrently
    pub step_slots: usize,
    /// Seconds a step may wait for a free slot
    pub schedule_to_start_secs: u64,
    /// Seconds a single step attempt may run
    pub start_to_close_secs: u64,
    /// Longest gap between step heartbeats, in seconds
    pub heartbeat_secs: u64,
    /// Attempts per step, including the first
    pub max_attempts: u32,
    /// Overall budget of one lifecycle run, in seconds
    pub process_timeout_secs: u64,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,
    /// Seconds an engine instance holds a run without renewing its lease
    pub lease_secs: u64,
}

impl EngineConfig {
    /// Deadlines and retry policy applied to every lifecycle step.
    #[must_use]
    pub fn step_options(&self) -> StepOptions {
        StepOptions {
            schedule_to_start_timeout: Duration::from_secs(self.schedule_to_start_secs),
            start_to_close_timeout: Duration::from_secs(self.start_to_close_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_secs),
            retry: RetryPolicy::builder()
                .max_attempts(self.max_attempts)
                .build(),
        }
    }

    /// Start-to-close budget of one lifecycle run.
    #[must_use]
    pub const fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    /// Lease on a run held by the engine executing it.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
            },
            settlement: SettlementConfig {
                provider: "fake".to_string(),
                base_url: String::new(),
                jwt: String::new(),
                http_timeout_secs: 15,
            },
            engine: EngineConfig {
                task_queue: "mint-redeem".to_string(),
                workers: 4,
                step_slots: 16,
                schedule_to_start_secs: 60,
                start_to_close_secs: 60,
                heartbeat_secs: 20,
                max_attempts: 3,
                process_timeout_secs: 300,
                shutdown_timeout_secs: 30,
                lease_secs: 30,
            },
            metrics_addr: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to [`Config::default`].
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.database.max_connections),
            },
            settlement: SettlementConfig {
                provider: env::var("SETTLEMENT_PROVIDER")
                    .unwrap_or(defaults.settlement.provider),
                base_url: env::var("SETTLEMENT_BASE_URL").unwrap_or_default(),
                jwt: env::var("SETTLEMENT_JWT").unwrap_or_default(),
                http_timeout_secs: env::var("SETTLEMENT_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.settlement.http_timeout_secs),
            },
            engine: EngineConfig {
                task_queue: env::var("TASK_QUEUE").unwrap_or(defaults.engine.task_queue),
                workers: env::var("WORKER_COUNT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.engine.workers),
                step_slots: env::var("STEP_SLOTS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.engine.step_slots),
                schedule_to_start_secs: env::var("STEP_SCHEDULE_TO_START_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.engine.schedule_to_start_secs),
                start_to_close_secs: env::var("STEP_START_TO_CLOSE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.engine.start_to_close_secs),
                heartbeat_secs: env::var("STEP_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.engine.heartbeat_secs),
                max_attempts: env::var("STEP_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.engine.max_attempts),
                process_timeout_secs: env::var("PROCESS_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.engine.process_timeout_secs),
                shutdown_timeout_secs: env::var("SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.engine.shutdown_timeout_secs),
                lease_secs: env::var("ENGINE_LEASE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.engine.lease_secs),
            },
            metrics_addr: env::var("METRICS_ADDR").ok().and_then(|s| s.parse().ok()),
        }
    }
}
