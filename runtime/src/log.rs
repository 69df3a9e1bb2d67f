//! Execution log: the durable memory of the substrate.
//!
//! The log records every launched run and the outcome of every step a run
//! completes. After a crash the engine reloads open runs from the log and
//! re-executes them; steps whose outcome is already recorded are replayed
//! from the log instead of running again.
//!
//! Open runs carry a lease: the engine instance executing a run renews it
//! while it works, and another instance may only claim the run once the
//! lease has expired.
//!
//! # Implementations
//!
//! - [`InMemoryExecutionLog`]: process-local, for tests and single-node demos
//! - `PostgresExecutionLog` (in `settlement-postgres`): durable storage

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use settlement_core::RunId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors that can occur during execution log operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// An open run with the same process id already exists.
    #[error("process already started: {0}")]
    AlreadyStarted(String),

    /// No run with this id exists.
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Underlying storage failed.
    #[error("execution log storage error: {0}")]
    Storage(String),
}

/// Where a run is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Launched and not yet finished.
    Running,
    /// The process returned successfully.
    Completed,
    /// The process returned an error.
    Failed,
    /// The run exceeded its start-to-close budget.
    TimedOut,
}

impl RunStatus {
    /// Convert status to its stored string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    /// Parse status from its stored string representation.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Storage`] for unknown statuses.
    pub fn parse(s: &str) -> Result<Self, LogError> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            _ => Err(LogError::Storage(format!("Invalid run status: {s}"))),
        }
    }

    /// Whether the run has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One launched execution of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    /// Substrate-assigned id of this execution.
    pub run_id: RunId,
    /// Business identity the process was launched for.
    pub process_id: String,
    /// Registered process type name.
    pub process_type: String,
    /// Queue the run was routed to.
    pub task_queue: String,
    /// Process input as launched.
    pub input: serde_json::Value,
    /// Current status.
    pub status: RunStatus,
    /// Terminal error message, for failed runs.
    pub error: Option<String>,
    /// Terminal error as structured data, when the process provided it.
    pub error_detail: Option<serde_json::Value>,
    /// Launch time.
    pub started_at: DateTime<Utc>,
    /// Start-to-close deadline.
    pub deadline: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Engine instance holding the lease.
    pub owner: String,
    /// End of the current lease.
    pub lease_expires_at: DateTime<Utc>,
}

impl RunRecord {
    /// Decode the structured terminal error as `E`.
    #[must_use]
    pub fn error_as<E: DeserializeOwned>(&self) -> Option<E> {
        self.error_detail
            .as_ref()
            .and_then(|detail| serde_json::from_value(detail.clone()).ok())
    }
}

/// Terminal result of a run, written once by the worker that ran it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Terminal status.
    pub status: RunStatus,
    /// Error message for failed or timed out runs.
    pub error: Option<String>,
    /// Structured error, if any.
    pub error_detail: Option<serde_json::Value>,
}

impl RunOutcome {
    /// The process returned successfully.
    #[must_use]
    pub const fn completed() -> Self {
        Self {
            status: RunStatus::Completed,
            error: None,
            error_detail: None,
        }
    }

    /// The process returned an error.
    #[must_use]
    pub const fn failed(error: String, error_detail: Option<serde_json::Value>) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(error),
            error_detail,
        }
    }

    /// The run ran out of budget.
    #[must_use]
    pub const fn timed_out(error: String) -> Self {
        Self {
            status: RunStatus::TimedOut,
            error: Some(error),
            error_detail: None,
        }
    }
}

/// Durable storage for runs and step outcomes.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the engine can hold an
/// `Arc<dyn ExecutionLog>` chosen at startup.
pub trait ExecutionLog: Send + Sync {
    /// Record a new run.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted`: another run for the same process id is still open
    /// - `Storage`: the write failed
    fn start_run(
        &self,
        run: RunRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>>;

    /// Look up a run.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the read failed.
    fn find_run(
        &self,
        run_id: RunId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RunRecord>, LogError>> + Send + '_>>;

    /// All runs that have not reached a terminal status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the read failed.
    fn open_runs(&self)
    -> Pin<Box<dyn Future<Output = Result<Vec<RunRecord>, LogError>> + Send + '_>>;

    /// Recorded outcome of step `seq` of a run, if any.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the read failed.
    fn load_step(
        &self,
        run_id: RunId,
        seq: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, LogError>> + Send + '_>>;

    /// Record the outcome of step `seq`. The first recorded outcome wins.
    ///
    /// # Errors
    ///
    /// - `RunNotFound`: the run does not exist
    /// - `Storage`: the write failed
    fn record_step(
        &self,
        run_id: RunId,
        seq: u32,
        step: &'static str,
        outcome: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>>;

    /// Take or extend the lease on an open run.
    ///
    /// Succeeds when `owner` already holds the run or its lease expired at
    /// or before `now`. Returns `false` when another owner holds a live
    /// lease or the run is no longer open.
    ///
    /// # Errors
    ///
    /// - `RunNotFound`: the run does not exist
    /// - `Storage`: the write failed
    fn claim_run(
        &self,
        run_id: RunId,
        owner: String,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LogError>> + Send + '_>>;

    /// Move a run to a terminal status.
    ///
    /// # Errors
    ///
    /// - `RunNotFound`: the run does not exist
    /// - `Storage`: the write failed
    fn finish_run(
        &self,
        run_id: RunId,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>>;
}

#[derive(Debug, Default)]
struct LogState {
    runs: Vec<RunRecord>,
    steps: HashMap<(RunId, u32), (&'static str, Vec<u8>)>,
}

/// Process-local execution log.
///
/// Survives engine restarts within the same process, which is what crash
/// replay tests need; it does not survive process exit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutionLog {
    state: Arc<Mutex<LogState>>,
}

impl InMemoryExecutionLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the steps recorded for a run, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the lock is poisoned.
    pub fn recorded_steps(&self, run_id: &RunId) -> Result<Vec<&'static str>, LogError> {
        let state = self.lock()?;
        let mut steps: Vec<_> = state
            .steps
            .iter()
            .filter(|((id, _), _)| id == run_id)
            .map(|((_, seq), (name, _))| (*seq, *name))
            .collect();
        steps.sort_by_key(|(seq, _)| *seq);
        Ok(steps.into_iter().map(|(_, name)| name).collect())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LogState>, LogError> {
        self.state
            .lock()
            .map_err(|_| LogError::Storage("execution log lock poisoned".to_string()))
    }
}

impl ExecutionLog for InMemoryExecutionLog {
    fn start_run(
        &self,
        run: RunRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.lock()?;
            if state
                .runs
                .iter()
                .any(|r| r.process_id == run.process_id && !r.status.is_terminal())
            {
                return Err(LogError::AlreadyStarted(run.process_id));
            }
            state.runs.push(run);
            Ok(())
        })
    }

    fn find_run(
        &self,
        run_id: RunId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RunRecord>, LogError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.lock()?;
            Ok(state.runs.iter().find(|r| r.run_id == run_id).cloned())
        })
    }

    fn open_runs(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RunRecord>, LogError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.lock()?;
            Ok(state
                .runs
                .iter()
                .filter(|r| !r.status.is_terminal())
                .cloned()
                .collect())
        })
    }

    fn load_step(
        &self,
        run_id: RunId,
        seq: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, LogError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.lock()?;
            Ok(state
                .steps
                .get(&(run_id, seq))
                .map(|(_, outcome)| outcome.clone()))
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
            let mut state = self.lock()?;
            if !state.runs.iter().any(|r| r.run_id == run_id) {
                return Err(LogError::RunNotFound(run_id));
            }
            state.steps.entry((run_id, seq)).or_insert((step, outcome));
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
            let mut state = self.lock()?;
            let run = state
                .runs
                .iter_mut()
                .find(|r| r.run_id == run_id)
                .ok_or_else(|| LogError::RunNotFound(run_id.clone()))?;
            if run.status.is_terminal() || (run.owner != owner && run.lease_expires_at > now) {
                return Ok(false);
            }
            run.owner = owner;
            run.lease_expires_at = lease_until;
            Ok(true)
        })
    }

    fn finish_run(
        &self,
        run_id: RunId,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.lock()?;
            let run = state
                .runs
                .iter_mut()
                .find(|r| r.run_id == run_id)
                .ok_or_else(|| LogError::RunNotFound(run_id.clone()))?;
            run.status = outcome.status;
            run.error = outcome.error;
            run.error_detail = outcome.error_detail;
            run.finished_at = Some(finished_at);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn run(run_id: &str, process_id: &str) -> RunRecord {
        let now = Utc::now();
        RunRecord {
            run_id: RunId::new(run_id),
            process_id: process_id.to_string(),
            process_type: "test".to_string(),
            task_queue: "queue".to_string(),
            input: serde_json::json!({}),
            status: RunStatus::Running,
            error: None,
            error_detail: None,
            started_at: now,
            deadline: now,
            finished_at: None,
            owner: "engine-a".to_string(),
            lease_expires_at: now + chrono::Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn second_open_run_for_same_process_is_rejected() {
        let log = InMemoryExecutionLog::new();
        log.start_run(run("r1", "p1")).await.unwrap();

        let err = log.start_run(run("r2", "p1")).await.unwrap_err();
        assert_eq!(err, LogError::AlreadyStarted("p1".to_string()));

        log.finish_run(RunId::new("r1"), RunOutcome::completed(), Utc::now())
            .await
            .unwrap();
        log.start_run(run("r2", "p1")).await.unwrap();
    }

    #[tokio::test]
    async fn first_recorded_step_outcome_wins() {
        let log = InMemoryExecutionLog::new();
        log.start_run(run("r1", "p1")).await.unwrap();

        log.record_step(RunId::new("r1"), 0, "settle", vec![1]).await.unwrap();
        log.record_step(RunId::new("r1"), 0, "settle", vec![2]).await.unwrap();

        let outcome = log.load_step(RunId::new("r1"), 0).await.unwrap();
        assert_eq!(outcome, Some(vec![1]));
        assert_eq!(log.recorded_steps(&RunId::new("r1")).unwrap(), vec!["settle"]);
    }

    #[tokio::test]
    async fn open_runs_excludes_finished() {
        let log = InMemoryExecutionLog::new();
        log.start_run(run("r1", "p1")).await.unwrap();
        log.start_run(run("r2", "p2")).await.unwrap();
        log.finish_run(RunId::new("r1"), RunOutcome::failed("boom".into(), None), Utc::now())
            .await
            .unwrap();

        let open = log.open_runs().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].run_id, RunId::new("r2"));

        let finished = log.find_run(RunId::new("r1")).await.unwrap().unwrap();
        assert_eq!(finished.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn recording_for_unknown_run_fails() {
        let log = InMemoryExecutionLog::new();
        let err = log.record_step(RunId::new("nope"), 0, "settle", vec![]).await.unwrap_err();
        assert!(matches!(err, LogError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn live_lease_is_only_renewed_by_its_owner() {
        let log = InMemoryExecutionLog::new();
        let record = run("r1", "p1");
        let now = record.started_at;
        let later = record.lease_expires_at + chrono::Duration::seconds(30);
        log.start_run(record).await.unwrap();
        let r1 = || RunId::new("r1");

        assert!(!log.claim_run(r1(), "engine-b".into(), now, later).await.unwrap());
        assert!(log.claim_run(r1(), "engine-a".into(), now, later).await.unwrap());

        let run = log.find_run(r1()).await.unwrap().unwrap();
        assert_eq!(run.owner, "engine-a");
        assert_eq!(run.lease_expires_at, later);
    }

    #[tokio::test]
    async fn expired_lease_can_be_claimed_by_another_owner() {
        let log = InMemoryExecutionLog::new();
        let record = run("r1", "p1");
        let expired = record.lease_expires_at;
        log.start_run(record).await.unwrap();
        let until = expired + chrono::Duration::seconds(30);

        assert!(log.claim_run(RunId::new("r1"), "engine-b".into(), expired, until).await.unwrap());
        assert_eq!(log.find_run(RunId::new("r1")).await.unwrap().unwrap().owner, "engine-b");

        log.finish_run(RunId::new("r1"), RunOutcome::completed(), Utc::now())
            .await
            .unwrap();
        assert!(!log.claim_run(RunId::new("r1"), "engine-b".into(), expired, until).await.unwrap());
        assert!(matches!(
            log.claim_run(RunId::new("nope"), "engine-b".into(), expired, until).await,
            Err(LogError::RunNotFound(_))
        ));
    }
}
