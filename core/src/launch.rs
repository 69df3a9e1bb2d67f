//! Launching lifecycle processes on the durable-execution substrate.
//!
//! The intake side only needs to hand a process type, its input and a few
//! options to the substrate and get a run identifier back. It never waits
//! for the process to finish.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Default overall execution budget for a launched process.
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Identifier the substrate assigns to one execution of a launched process.
///
/// Distinct from the business identity the process was launched for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    /// Wrap a substrate-assigned run identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options attached to a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Business identity of the process. At most one open run per id.
    pub id: String,
    /// Routing key shared by every worker able to run the process type.
    pub task_queue: String,
    /// Budget for the whole run, from launch to terminal state.
    pub start_to_close_timeout: Duration,
}

impl LaunchOptions {
    /// Options with the default five minute budget.
    #[must_use]
    pub fn new(id: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_queue: task_queue.into(),
            start_to_close_timeout: DEFAULT_PROCESS_TIMEOUT,
        }
    }

    /// Override the overall execution budget.
    #[must_use]
    pub const fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}

/// Errors returned when a process cannot be launched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The launch client could not be built from configuration.
    #[error("failed to construct process launcher: {0}")]
    ClientConstruction(String),

    /// An open run already exists for this process id.
    #[error("process already started: {0}")]
    AlreadyStarted(String),

    /// No process type with this name is registered.
    #[error("unknown process type: {0}")]
    UnknownProcessType(String),

    /// No worker serves this task queue.
    #[error("unknown task queue: {0}")]
    UnknownTaskQueue(String),

    /// The substrate's execution log rejected the launch.
    #[error("execution log error: {0}")]
    Log(String),
}

/// Launches processes by type name.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so intake can hold an
/// `Arc<dyn ProcessLauncher>`.
pub trait ProcessLauncher: Send + Sync {
    /// Launch `process_type` with `input`, returning as soon as the run is
    /// durably recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError`] if the run could not be recorded or routed.
    fn launch(
        &self,
        process_type: &str,
        input: serde_json::Value,
        options: LaunchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<RunId, LaunchError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_options_default_to_five_minutes() {
        let options = LaunchOptions::new("req-1", "mint-redeem");
        assert_eq!(options.start_to_close_timeout, Duration::from_secs(300));

        let options = options.with_start_to_close_timeout(Duration::from_secs(5));
        assert_eq!(options.start_to_close_timeout, Duration::from_secs(5));
    }
}
