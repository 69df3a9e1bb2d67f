//! Durable step execution.
//!
//! A process performs side effects only through
//! [`ProcessContext::execute_step`]. Each call is numbered in order within
//! the run. If the execution log already holds an outcome for that number
//! the step is not run again; the recorded outcome is decoded and returned.
//!
//! Otherwise the step runs under three deadlines per attempt:
//!
//! - **schedule-to-start**: a free step slot must be acquired in time
//! - **start-to-close**: the attempt must finish in time
//! - **heartbeat**: the attempt must call [`Heartbeat::beat`] at least this often
//!
//! Missed deadlines and retryable failures are retried under the step's
//! [`RetryPolicy`]. The final outcome, success or failure, is recorded
//! before it is returned. The first recorded outcome wins: if another
//! execution of the same run recorded the step first, its outcome is
//! returned instead of the local one.

use crate::log::ExecutionLog;
use crate::retry::{RetryPolicy, retry_with_predicate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use settlement_core::{Retryable, RunId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::time::{sleep, timeout};

/// Deadlines and retry policy for one step.
///
/// # Default Values
///
/// - `schedule_to_start_timeout`: 60 seconds
/// - `start_to_close_timeout`: 60 seconds
/// - `heartbeat_timeout`: 20 seconds
/// - `retry`: [`RetryPolicy::default`]
#[derive(Debug, Clone, PartialEq)]
pub struct StepOptions {
    /// Time allowed to wait for a free step slot.
    pub schedule_to_start_timeout: Duration,
    /// Time allowed for a single attempt.
    pub start_to_close_timeout: Duration,
    /// Longest allowed gap between heartbeats.
    pub heartbeat_timeout: Duration,
    /// Attempts and backoff.
    pub retry: RetryPolicy,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            schedule_to_start_timeout: Duration::from_secs(60),
            start_to_close_timeout: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
        }
    }
}

/// Which deadline an attempt missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// No step slot became free in time.
    ScheduleToStart,
    /// The attempt ran too long.
    StartToClose,
    /// The attempt stopped heartbeating.
    Heartbeat,
}

impl TimeoutKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduleToStart => "schedule_to_start",
            Self::StartToClose => "start_to_close",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final failure of a step, as seen by the process.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepError<E> {
    /// The step itself failed.
    #[error("{0}")]
    Failed(E),

    /// Every attempt missed a deadline.
    #[error("step {step} timed out ({kind}) after {attempts} attempt(s)")]
    TimedOut {
        /// Step name.
        step: String,
        /// Deadline missed by the last attempt.
        kind: TimeoutKind,
        /// Attempts made.
        attempts: u32,
    },

    /// The outcome could not be read from or written to the execution log.
    #[error("execution log error: {0}")]
    Log(String),
}

/// Liveness signal handed to every step attempt.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    tx: Arc<watch::Sender<()>>,
}

impl Heartbeat {
    /// Report progress, pushing the heartbeat deadline forward.
    pub fn beat(&self) {
        self.tx.send_replace(());
    }
}

enum AttemptError<E> {
    Failed(E),
    TimedOut(TimeoutKind),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(err) => err.fmt(f),
            Self::TimedOut(kind) => write!(f, "{kind} timeout"),
        }
    }
}

/// Execution context of one run, handed to the process.
pub struct ProcessContext {
    run_id: RunId,
    log: Arc<dyn ExecutionLog>,
    slots: Arc<Semaphore>,
    next_seq: AtomicU32,
}

impl ProcessContext {
    /// Create a context for `run_id`, numbering steps from zero.
    #[must_use]
    pub fn new(run_id: RunId, log: Arc<dyn ExecutionLog>, slots: Arc<Semaphore>) -> Self {
        Self {
            run_id,
            log,
            slots,
            next_seq: AtomicU32::new(0),
        }
    }

    /// The run this context belongs to.
    #[must_use]
    pub const fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Execute a step durably.
    ///
    /// `step` is called once per attempt with a fresh [`Heartbeat`].
    ///
    /// # Errors
    ///
    /// - `Failed`: the step failed with a non-retryable error, or with a
    ///   retryable one on its last attempt
    /// - `TimedOut`: the last attempt missed a deadline
    /// - `Log`: the outcome could not be replayed or recorded
    #[tracing::instrument(skip(self, options, step), fields(run_id = %self.run_id))]
    pub async fn execute_step<T, E, F, Fut>(
        &self,
        name: &'static str,
        options: &StepOptions,
        step: F,
    ) -> Result<T, StepError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: Serialize + DeserializeOwned + Retryable + fmt::Display,
        F: Fn(Heartbeat) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        if let Some(recorded) = self
            .log
            .load_step(self.run_id.clone(), seq)
            .await
            .map_err(|e| StepError::Log(e.to_string()))?
        {
            let outcome: Result<T, StepError<E>> = decode(name, &recorded)?;
            tracing::info!(seq, replayed_ok = outcome.is_ok(), "Replayed recorded step outcome");
            metrics::counter!("substrate.steps.replayed", "step" => name).increment(1);
            return outcome;
        }

        let attempts = &AtomicU32::new(0);
        let step = &step;
        let result = retry_with_predicate(
            &options.retry,
            move || {
                attempts.fetch_add(1, Ordering::SeqCst);
                self.attempt(name, options, step)
            },
            |err: &AttemptError<E>| match err {
                AttemptError::Failed(err) => err.is_retryable(),
                AttemptError::TimedOut(_) => true,
            },
        )
        .await;

        let outcome = result.map_err(|err| match err {
            AttemptError::Failed(err) => StepError::Failed(err),
            AttemptError::TimedOut(kind) => StepError::TimedOut {
                step: name.to_string(),
                kind,
                attempts: attempts.load(Ordering::SeqCst),
            },
        });

        let encoded = bincode::serialize(&outcome)
            .map_err(|e| StepError::Log(format!("unencodable outcome for step {name}: {e}")))?;
        self.log
            .record_step(self.run_id.clone(), seq, name, encoded.clone())
            .await
            .map_err(|e| StepError::Log(e.to_string()))?;

        match self
            .log
            .load_step(self.run_id.clone(), seq)
            .await
            .map_err(|e| StepError::Log(e.to_string()))?
        {
            Some(recorded) if recorded != encoded => {
                tracing::warn!(
                    seq,
                    step = name,
                    "Step outcome was recorded first by another execution"
                );
                metrics::counter!("substrate.steps.superseded", "step" => name).increment(1);
                decode::<T, E>(name, &recorded)?
            }
            _ => outcome,
        }
    }

    async fn attempt<T, E, F, Fut>(
        &self,
        name: &'static str,
        options: &StepOptions,
        step: &F,
    ) -> Result<T, AttemptError<E>>
    where
        F: Fn(Heartbeat) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        metrics::counter!("substrate.steps.attempts", "step" => name).increment(1);

        let Ok(Ok(permit)) = timeout(
            options.schedule_to_start_timeout,
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        else {
            return Err(timed_out(name, TimeoutKind::ScheduleToStart));
        };

        let (tx, rx) = watch::channel(());
        let heartbeat = Heartbeat { tx: Arc::new(tx) };
        let work = step(heartbeat.clone());

        let result = tokio::select! {
            result = work => result.map_err(AttemptError::Failed),
            () = sleep(options.start_to_close_timeout) => {
                Err(timed_out(name, TimeoutKind::StartToClose))
            }
            () = watchdog(rx, options.heartbeat_timeout) => {
                Err(timed_out(name, TimeoutKind::Heartbeat))
            }
        };

        drop(heartbeat);
        drop(permit);
        result
    }
}

fn decode<T, E>(name: &str, recorded: &[u8]) -> Result<Result<T, StepError<E>>, StepError<E>>
where
    T: DeserializeOwned,
    E: DeserializeOwned,
{
    bincode::deserialize(recorded)
        .map_err(|e| StepError::Log(format!("undecodable outcome for step {name}: {e}")))
}

fn timed_out<E>(step: &'static str, kind: TimeoutKind) -> AttemptError<E> {
    tracing::warn!(step, timeout = %kind, "Step attempt missed its deadline");
    metrics::counter!("substrate.steps.timeouts", "kind" => kind.as_str()).increment(1);
    AttemptError::TimedOut(kind)
}

/// Resolves once `interval` passes without a heartbeat.
async fn watchdog(mut rx: watch::Receiver<()>, interval: Duration) {
    loop {
        match timeout(interval, rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => std::future::pending::<()>().await,
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::log::{InMemoryExecutionLog, RunRecord, RunStatus};
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Transient)
        }
    }

    fn options() -> StepOptions {
        StepOptions {
            schedule_to_start_timeout: Duration::from_secs(1),
            start_to_close_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(2),
            retry: RetryPolicy::builder()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(10))
                .build(),
        }
    }

    async fn context(log: &InMemoryExecutionLog, slots: usize) -> ProcessContext {
        let now = Utc::now();
        log.start_run(RunRecord {
            run_id: RunId::new("run-1"),
            process_id: "p".to_string(),
            process_type: "test".to_string(),
            task_queue: "q".to_string(),
            input: serde_json::Value::Null,
            status: RunStatus::Running,
            error: None,
            error_detail: None,
            started_at: now,
            deadline: now,
            finished_at: None,
            owner: "engine".to_string(),
            lease_expires_at: now,
        })
        .await
        .unwrap();
        ProcessContext::new(
            RunId::new("run-1"),
            Arc::new(log.clone()),
            Arc::new(Semaphore::new(slots)),
        )
    }

    #[tokio::test]
    async fn transient_failure_is_retried_until_success() {
        let log = InMemoryExecutionLog::new();
        let ctx = context(&log, 1).await;
        let calls = &AtomicUsize::new(0);

        let result: Result<u32, StepError<TestError>> = ctx
            .execute_step("flaky", &options(), move |_hb| async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError::Transient)
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let log = InMemoryExecutionLog::new();
        let ctx = context(&log, 1).await;
        let calls = &AtomicUsize::new(0);

        let result: Result<(), StepError<TestError>> = ctx
            .execute_step("reject", &options(), move |_hb| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Permanent)
            })
            .await;

        assert_eq!(result, Err(StepError::Failed(TestError::Permanent)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_step_misses_heartbeat() {
        let log = InMemoryExecutionLog::new();
        let ctx = context(&log, 1).await;

        let result: Result<(), StepError<TestError>> = ctx
            .execute_step("stalled", &options(), |_hb| async {
                sleep(Duration::from_secs(4)).await;
                Ok(())
            })
            .await;

        assert_eq!(
            result,
            Err(StepError::TimedOut {
                step: "stalled".to_string(),
                kind: TimeoutKind::Heartbeat,
                attempts: 3,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeating_step_runs_past_heartbeat_interval() {
        let log = InMemoryExecutionLog::new();
        let ctx = context(&log, 1).await;

        let result: Result<(), StepError<TestError>> = ctx
            .execute_step("busy", &options(), |hb| async move {
                for _ in 0..4 {
                    sleep(Duration::from_secs(1)).await;
                    hb.beat();
                }
                Ok(())
            })
            .await;

        assert_eq!(result, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn long_step_hits_start_to_close() {
        let log = InMemoryExecutionLog::new();
        let ctx = context(&log, 1).await;
        let mut opts = options();
        opts.retry = RetryPolicy::no_retry();

        let result: Result<(), StepError<TestError>> = ctx
            .execute_step("slow", &opts, |hb| async move {
                for _ in 0..10 {
                    sleep(Duration::from_secs(1)).await;
                    hb.beat();
                }
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(StepError::TimedOut { kind: TimeoutKind::StartToClose, attempts: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn no_free_slot_hits_schedule_to_start() {
        let log = InMemoryExecutionLog::new();
        let ctx = context(&log, 0).await;
        let mut opts = options();
        opts.retry = RetryPolicy::no_retry();

        let result: Result<(), StepError<TestError>> = ctx
            .execute_step("starved", &opts, |_hb| async { Ok(()) })
            .await;

        assert!(matches!(
            result,
            Err(StepError::TimedOut { kind: TimeoutKind::ScheduleToStart, .. })
        ));
    }

    #[tokio::test]
    async fn recorded_outcomes_are_replayed_in_order() {
        let log = InMemoryExecutionLog::new();
        let first = context(&log, 1).await;
        let _: Result<u32, StepError<TestError>> =
            first.execute_step("one", &options(), |_hb| async { Ok(1) }).await;
        let _: Result<u32, StepError<TestError>> = first
            .execute_step("two", &options(), |_hb| async { Err(TestError::Permanent) })
            .await;

        let replay = ProcessContext::new(
            RunId::new("run-1"),
            Arc::new(log.clone()),
            Arc::new(Semaphore::new(1)),
        );
        let calls = &AtomicUsize::new(0);
        let one: Result<u32, StepError<TestError>> = replay
            .execute_step("one", &options(), move |_hb| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(100)
            })
            .await;
        let two: Result<u32, StepError<TestError>> = replay
            .execute_step("two", &options(), move |_hb| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(200)
            })
            .await;

        assert_eq!(one, Ok(1));
        assert_eq!(two, Err(StepError::Failed(TestError::Permanent)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(log.recorded_steps(&RunId::new("run-1")).unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn outcome_recorded_first_elsewhere_wins() {
        let log = InMemoryExecutionLog::new();
        let ctx = context(&log, 1).await;
        let other = &log;

        let result: Result<u32, StepError<TestError>> = ctx
            .execute_step("pick", &options(), move |_hb| async move {
                let theirs: Result<u32, StepError<TestError>> = Ok(1);
                let encoded = bincode::serialize(&theirs).unwrap();
                other
                    .record_step(RunId::new("run-1"), 0, "pick", encoded)
                    .await
                    .unwrap();
                Ok(2)
            })
            .await;

        assert_eq!(result, Ok(1));
        let replay = ProcessContext::new(
            RunId::new("run-1"),
            Arc::new(log.clone()),
            Arc::new(Semaphore::new(1)),
        );
        let replayed: Result<u32, StepError<TestError>> =
            replay.execute_step("pick", &options(), |_hb| async { Ok(3) }).await;
        assert_eq!(replayed, Ok(1));
    }
}
