//! Prometheus metrics for the substrate and the request lifecycle.
//!
//! Counters are emitted through the `metrics` facade everywhere in the
//! workspace. Installing an exporter is optional; without one the facade
//! discards them.
//!
//! # Example
//!
//! ```rust,no_run
//! use settlement_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install the exporter and its HTTP listener.
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Register metric descriptions and start the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a recorder is already installed
    /// or the address cannot be bound.
    pub fn start(&self) -> Result<(), MetricsError> {
        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        register_metrics();

        tracing::info!(addr = %self.addr, "Metrics server started");
        Ok(())
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!("substrate.runs.launched", "Processes launched, by process type");
    describe_counter!("substrate.runs.finished", "Runs reaching a terminal status, by status");
    describe_counter!("substrate.runs.recovered", "Open runs claimed and re-enqueued by recovery");
    describe_counter!("substrate.runs.abandoned", "Runs given up after their lease was lost");
    describe_counter!("substrate.steps.attempts", "Step attempts started, by step");
    describe_counter!("substrate.steps.replayed", "Step outcomes replayed from the execution log");
    describe_counter!(
        "substrate.steps.superseded",
        "Step outcomes replaced by one recorded first elsewhere"
    );
    describe_counter!("substrate.steps.timeouts", "Step attempts that missed a deadline, by kind");
    describe_counter!("substrate.retries", "Retries scheduled after a retryable failure");
    describe_counter!("requests.submitted", "Requests accepted by intake, by kind");
    describe_counter!("requests.settled", "Settlement outcomes, by kind and result");
    describe_counter!("requests.status_writes", "Status transitions written, by status");
}
