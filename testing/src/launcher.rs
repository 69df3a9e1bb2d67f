//! Process launcher doubles.

use settlement_core::{LaunchError, LaunchOptions, ProcessLauncher, RunId};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// A launch received by [`RecordingLauncher`].
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCall {
    /// Process type name.
    pub process_type: String,
    /// Serialized process input.
    pub input: serde_json::Value,
    /// Options passed with the launch.
    pub options: LaunchOptions,
}

/// Launcher that records every launch and never runs anything.
///
/// Run ids are `run-1`, `run-2`, ... in launch order.
#[derive(Debug, Clone, Default)]
pub struct RecordingLauncher {
    launches: Arc<Mutex<Vec<LaunchCall>>>,
}

impl RecordingLauncher {
    /// Create a launcher with no recorded launches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Launches received so far, in order.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchCall> {
        self.launches.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn launch(
        &self,
        process_type: &str,
        input: serde_json::Value,
        options: LaunchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<RunId, LaunchError>> + Send + '_>> {
        let process_type = process_type.to_string();
        Box::pin(async move {
            let mut launches = self
                .launches
                .lock()
                .map_err(|_| LaunchError::Log("launcher lock poisoned".to_string()))?;
            launches.push(LaunchCall {
                process_type,
                input,
                options,
            });
            Ok(RunId::new(format!("run-{}", launches.len())))
        })
    }
}

/// Launcher that fails every launch with the same error.
#[derive(Debug, Clone)]
pub struct FailingLauncher {
    error: LaunchError,
}

impl FailingLauncher {
    /// Fail every launch with `error`.
    #[must_use]
    pub const fn new(error: LaunchError) -> Self {
        Self { error }
    }
}

impl ProcessLauncher for FailingLauncher {
    fn launch(
        &self,
        _process_type: &str,
        _input: serde_json::Value,
        _options: LaunchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<RunId, LaunchError>> + Send + '_>> {
        let error = self.error.clone();
        Box::pin(async move { Err(error) })
    }
}
