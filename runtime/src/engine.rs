//! The engine: launches processes and runs them on a worker pool.
//!
//! An [`Engine`] serves one task queue. Launching records a run in the
//! execution log and enqueues it; workers pull runs off the queue and drive
//! them to a terminal status under the run's start-to-close budget.
//!
//! Several engines may share one execution log. Each holds a lease on the
//! runs it executes and renews it while working. Recovery, at start and
//! then once per lease period, only claims open runs whose lease has
//! expired, so a live instance never has its runs taken over.
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::builder()
//!     .log(Arc::new(InMemoryExecutionLog::new()))
//!     .task_queue("mint-redeem")
//!     .workers(4)
//!     .register(RequestLifecycle::new(deps))
//!     .build()?;
//!
//! engine.start().await?;
//! let run_id = engine
//!     .launch(RequestLifecycle::NAME, input, LaunchOptions::new(id, "mint-redeem"))
//!     .await?;
//! let run = engine.wait_for(&run_id).await?;
//! ```

use crate::log::{ExecutionLog, LogError, RunOutcome, RunRecord, RunStatus};
use chrono::{DateTime, Utc};
use crate::step::ProcessContext;
use serde::Serialize;
use serde::de::DeserializeOwned;
use settlement_core::environment::{Clock, SystemClock};
use settlement_core::{LaunchError, LaunchOptions, ProcessLauncher, RunId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Errors from engine operations other than launching.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine was configured without an execution log.
    #[error("engine has no execution log configured")]
    MissingLog,

    /// The execution log failed.
    #[error(transparent)]
    Log(#[from] LogError),

    /// The run does not exist.
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// `start` was called twice.
    #[error("engine already started")]
    AlreadyRunning,

    /// Workers were still busy when the shutdown timeout elapsed.
    #[error("shutdown timed out with {0} workers still running")]
    ShutdownTimeout(usize),

    /// The engine shut down while a caller was waiting.
    #[error("engine is shut down")]
    Closed,
}

/// A process type the engine can run.
///
/// The process must be deterministic in the steps it executes so that a
/// re-executed run replays recorded step outcomes in the same order.
pub trait Process: Send + Sync + 'static {
    /// Launch input.
    type Input: Serialize + DeserializeOwned + Send + 'static;
    /// Terminal error, recorded on the run.
    type Error: Serialize + fmt::Display + Send + 'static;

    /// Registered type name.
    const NAME: &'static str;

    /// Run the process to completion.
    fn run<'a>(
        &'a self,
        ctx: &'a ProcessContext,
        input: Self::Input,
    ) -> Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send + 'a>>;
}

type ErasedRun<'a> = Pin<Box<dyn Future<Output = RunOutcome> + Send + 'a>>;

trait ErasedProcess: Send + Sync {
    fn run<'a>(&'a self, ctx: &'a ProcessContext, input: serde_json::Value) -> ErasedRun<'a>;
}

impl<P: Process> ErasedProcess for P {
    fn run<'a>(&'a self, ctx: &'a ProcessContext, input: serde_json::Value) -> ErasedRun<'a> {
        Box::pin(async move {
            let input: P::Input = match serde_json::from_value(input) {
                Ok(input) => input,
                Err(e) => {
                    return RunOutcome::failed(format!("invalid input for {}: {e}", P::NAME), None);
                }
            };
            match Process::run(self, ctx, input).await {
                Ok(()) => RunOutcome::completed(),
                Err(err) => RunOutcome::failed(err.to_string(), serde_json::to_value(&err).ok()),
            }
        })
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    log: Option<Arc<dyn ExecutionLog>>,
    clock: Arc<dyn Clock>,
    task_queue: String,
    workers: usize,
    step_slots: usize,
    lease: Duration,
    processes: HashMap<&'static str, Arc<dyn ErasedProcess>>,
}

impl EngineBuilder {
    /// Execution log for runs and step outcomes.
    #[must_use]
    pub fn log(mut self, log: Arc<dyn ExecutionLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Clock used for run deadlines.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Task queue this engine serves.
    #[must_use]
    pub fn task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    /// Number of runs executed concurrently.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Number of step attempts executed concurrently across all runs.
    #[must_use]
    pub const fn step_slots(mut self, step_slots: usize) -> Self {
        self.step_slots = step_slots;
        self
    }

    /// How long a run stays claimed by this engine without renewal.
    #[must_use]
    pub const fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Register a process type under [`Process::NAME`].
    #[must_use]
    pub fn register<P: Process>(mut self, process: P) -> Self {
        self.processes.insert(P::NAME, Arc::new(process));
        self
    }

    /// Build the engine. Workers are not started until [`Engine::start`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingLog`] if no log was configured.
    pub fn build(self) -> Result<Engine, EngineError> {
        let log = self.log.ok_or(EngineError::MissingLog)?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (finished, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Engine {
            inner: Arc::new(Inner {
                log,
                clock: self.clock,
                instance_id: uuid::Uuid::new_v4().to_string(),
                lease: self.lease,
                task_queue: self.task_queue,
                worker_count: self.workers.max(1),
                slots: Arc::new(Semaphore::new(self.step_slots)),
                processes: self.processes,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                finished,
                shutdown_tx,
                started: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                active: Mutex::new(HashSet::new()),
                workers: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct Inner {
    log: Arc<dyn ExecutionLog>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    lease: Duration,
    task_queue: String,
    worker_count: usize,
    slots: Arc<Semaphore>,
    processes: HashMap<&'static str, Arc<dyn ErasedProcess>>,
    queue_tx: mpsc::UnboundedSender<RunRecord>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RunRecord>>,
    finished: broadcast::Sender<RunId>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    shutting_down: AtomicBool,
    /// Runs queued or executing on this instance.
    active: Mutex<HashSet<RunId>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lease =
            chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::hours(1));
        now.checked_add_signed(lease).unwrap_or(now)
    }

    async fn claim(&self, run_id: &RunId) -> Result<bool, LogError> {
        let now = self.clock.now();
        self.log
            .claim_run(run_id.clone(), self.instance_id.clone(), now, self.lease_until(now))
            .await
    }

    /// Mark a run active; `false` if it already was.
    fn activate(&self, run_id: &RunId) -> bool {
        self.active
            .lock()
            .map(|mut active| active.insert(run_id.clone()))
            .unwrap_or(false)
    }

    fn deactivate(&self, run_id: &RunId) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(run_id);
        }
    }

    /// Claim and enqueue open runs of this queue whose lease has expired.
    async fn recover(&self) -> Result<usize, LogError> {
        let open = self.log.open_runs().await?;
        let mut recovered = 0;
        for run in open {
            if run.task_queue != self.task_queue || !self.activate(&run.run_id) {
                continue;
            }
            if !self.claim(&run.run_id).await? {
                tracing::debug!(
                    run_id = %run.run_id,
                    owner = %run.owner,
                    "Open run is leased elsewhere"
                );
                self.deactivate(&run.run_id);
                continue;
            }
            tracing::info!(
                run_id = %run.run_id,
                process_id = %run.process_id,
                "Recovering open run"
            );
            let run_id = run.run_id.clone();
            if self.queue_tx.send(run).is_ok() {
                recovered += 1;
            } else {
                self.deactivate(&run_id);
            }
        }
        metrics::counter!("substrate.runs.recovered").increment(recovered as u64);
        Ok(recovered)
    }
}

/// Durable-execution engine for one task queue.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create a new builder with one worker, sixteen step slots, a 30 second
    /// lease and the system clock.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            log: None,
            clock: Arc::new(SystemClock),
            task_queue: String::new(),
            workers: 1,
            step_slots: 16,
            lease: Duration::from_secs(30),
            processes: HashMap::new(),
        }
    }

    /// Task queue this engine serves.
    #[must_use]
    pub fn task_queue(&self) -> &str {
        &self.inner.task_queue
    }

    /// A shared launcher routing to `task_queue`.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::ClientConstruction`] if this engine does not
    /// serve `task_queue`.
    pub fn launcher(&self, task_queue: &str) -> Result<Arc<dyn ProcessLauncher>, LaunchError> {
        if task_queue.is_empty() || task_queue != self.inner.task_queue {
            return Err(LaunchError::ClientConstruction(format!(
                "no engine serves task queue {task_queue:?}"
            )));
        }
        Ok(Arc::new(self.clone()))
    }

    /// Claim and re-enqueue open runs whose lease has expired, then spawn
    /// the workers and the periodic recovery task.
    ///
    /// Returns the number of runs recovered now. Runs still leased by
    /// another instance are left alone and picked up by a later recovery
    /// pass if that lease lapses.
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning`: the engine was started before
    /// - `Log`: open runs could not be loaded or claimed
    pub async fn start(&self) -> Result<usize, EngineError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        let recovered = self.inner.recover().await?;

        let mut workers = self
            .inner
            .workers
            .lock()
            .map_err(|_| EngineError::Closed)?;
        for worker_id in 0..self.inner.worker_count {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(worker_loop(inner, worker_id)));
        }
        workers.push(tokio::spawn(recovery_loop(Arc::clone(&self.inner))));

        tracing::info!(
            instance_id = %self.inner.instance_id,
            task_queue = %self.inner.task_queue,
            workers = self.inner.worker_count,
            recovered,
            "Engine started"
        );
        Ok(recovered)
    }

    /// Launch a process and return its run id without waiting for it.
    ///
    /// # Errors
    ///
    /// - `UnknownTaskQueue`: the options route to a queue this engine does not serve
    /// - `UnknownProcessType`: no such process is registered
    /// - `AlreadyStarted`: an open run exists for the same process id
    /// - `Log`: the run could not be recorded, or the engine is shutting down
    pub async fn launch(
        &self,
        process_type: &str,
        input: serde_json::Value,
        options: LaunchOptions,
    ) -> Result<RunId, LaunchError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(LaunchError::Log("engine is shutting down".to_string()));
        }
        if options.task_queue != self.inner.task_queue {
            return Err(LaunchError::UnknownTaskQueue(options.task_queue));
        }
        let Some((&name, _)) = self.inner.processes.get_key_value(process_type) else {
            return Err(LaunchError::UnknownProcessType(process_type.to_string()));
        };

        let run_id = RunId::new(uuid::Uuid::new_v4().to_string());
        let started_at = self.inner.clock.now();
        let lease_expires_at = self.inner.lease_until(started_at);
        let budget = chrono::Duration::from_std(options.start_to_close_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let run = RunRecord {
            run_id: run_id.clone(),
            process_id: options.id,
            process_type: name.to_string(),
            task_queue: options.task_queue,
            input,
            status: RunStatus::Running,
            error: None,
            error_detail: None,
            started_at,
            deadline: started_at.checked_add_signed(budget).unwrap_or(started_at),
            finished_at: None,
            owner: self.inner.instance_id.clone(),
            lease_expires_at,
        };

        self.inner
            .log
            .start_run(run.clone())
            .await
            .map_err(|e| match e {
                LogError::AlreadyStarted(id) => LaunchError::AlreadyStarted(id),
                other => LaunchError::Log(other.to_string()),
            })?;

        self.inner.activate(&run_id);
        self.inner.queue_tx.send(run).map_err(|_| {
            self.inner.deactivate(&run_id);
            LaunchError::Log("run queue closed".to_string())
        })?;

        metrics::counter!("substrate.runs.launched", "process" => name).increment(1);
        tracing::info!(%run_id, process = name, "Process launched");
        Ok(run_id)
    }

    /// Wait until a run reaches a terminal status.
    ///
    /// # Errors
    ///
    /// - `RunNotFound`: no such run
    /// - `Log`: the log could not be read
    /// - `Closed`: the engine went away while waiting
    pub async fn wait_for(&self, run_id: &RunId) -> Result<RunRecord, EngineError> {
        let mut finished = self.inner.finished.subscribe();
        loop {
            let run = self
                .inner
                .log
                .find_run(run_id.clone())
                .await?
                .ok_or_else(|| EngineError::RunNotFound(run_id.clone()))?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            match finished.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(EngineError::Closed),
            }
        }
    }

    /// Stop accepting launches and wait for workers to finish their current run.
    ///
    /// Runs still queued stay open in the log and are recovered by another
    /// engine once their lease expires.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShutdownTimeout`] if workers are still busy
    /// after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), EngineError> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.shutdown_tx.send_replace(true);
        tracing::info!("Initiating engine shutdown");

        let handles: Vec<_> = self
            .inner
            .workers
            .lock()
            .map_err(|_| EngineError::Closed)?
            .drain(..)
            .collect();
        let total = handles.len();

        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => {
                tracing::info!("All workers stopped, shutdown successful");
                Ok(())
            }
            Err(_) => {
                tracing::error!(workers = total, "Shutdown timeout exceeded");
                Err(EngineError::ShutdownTimeout(total))
            }
        }
    }
}

impl ProcessLauncher for Engine {
    fn launch(
        &self,
        process_type: &str,
        input: serde_json::Value,
        options: LaunchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<RunId, LaunchError>> + Send + '_>> {
        let process_type = process_type.to_string();
        Box::pin(async move { Engine::launch(self, &process_type, input, options).await })
    }
}

async fn worker_loop(inner: Arc<Inner>, worker_id: usize) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            run = async { inner.queue_rx.lock().await.recv().await } => run,
            _ = shutdown.changed() => None,
        };
        let Some(run) = next else {
            break;
        };
        execute_run(&inner, run).await;
    }
    tracing::debug!(worker_id, "Worker stopped");
}

/// Floor for lease renewal and recovery periods.
const MIN_LEASE_PERIOD: Duration = Duration::from_millis(100);

async fn recovery_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let period = inner.lease.max(MIN_LEASE_PERIOD);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => continue,
        }
        match inner.recover().await {
            Ok(0) => {}
            Ok(recovered) => tracing::info!(recovered, "Recovered runs with expired leases"),
            Err(e) => tracing::warn!(error = %e, "Recovery pass failed"),
        }
    }
}

/// Renew the lease on `run_id` every third of the lease period. Resolves
/// only once the lease is lost to another instance.
async fn hold_lease(inner: &Inner, run_id: &RunId) {
    let period = (inner.lease / 3).max(MIN_LEASE_PERIOD);
    loop {
        tokio::time::sleep(period).await;
        match inner.claim(run_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => tracing::warn!(error = %e, "Failed to renew run lease"),
        }
    }
}

#[tracing::instrument(skip_all, fields(run_id = %run.run_id, process = %run.process_type))]
async fn execute_run(inner: &Inner, run: RunRecord) {
    match inner.claim(&run.run_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!("Run was claimed by another instance, skipping it");
            inner.deactivate(&run.run_id);
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to claim run");
            inner.deactivate(&run.run_id);
            return;
        }
    }

    let outcome = match inner.processes.get(run.process_type.as_str()) {
        None => RunOutcome::failed(format!("unknown process type: {}", run.process_type), None),
        Some(process) => {
            let ctx = ProcessContext::new(
                run.run_id.clone(),
                Arc::clone(&inner.log),
                Arc::clone(&inner.slots),
            );
            let remaining = (run.deadline - inner.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let work = tokio::time::timeout(remaining, process.run(&ctx, run.input.clone()));
            tokio::select! {
                result = work => match result {
                    Ok(outcome) => outcome,
                    Err(_) => RunOutcome::timed_out(format!(
                        "run exceeded its start-to-close budget of {}s",
                        (run.deadline - run.started_at).num_seconds()
                    )),
                },
                () = hold_lease(inner, &run.run_id) => {
                    tracing::warn!("Lost the run's lease, abandoning it");
                    metrics::counter!("substrate.runs.abandoned").increment(1);
                    inner.deactivate(&run.run_id);
                    return;
                }
            }
        }
    };

    let status = outcome.status;
    match &outcome.error {
        Some(error) => tracing::warn!(status = status.as_str(), %error, "Run finished"),
        None => tracing::info!(status = status.as_str(), "Run finished"),
    }
    metrics::counter!("substrate.runs.finished", "status" => status.as_str()).increment(1);

    if let Err(e) = inner
        .log
        .finish_run(run.run_id.clone(), outcome, inner.clock.now())
        .await
    {
        tracing::error!(error = %e, "Failed to record run outcome");
    }
    inner.deactivate(&run.run_id);
    let _ = inner.finished.send(run.run_id);
}
