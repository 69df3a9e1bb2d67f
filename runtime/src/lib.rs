//! # Settlement Runtime
//!
//! A small durable-execution substrate for the request lifecycle.
//!
//! It provides exactly the primitives the lifecycle relies on and nothing
//! more:
//!
//! - **Launch**: record a run for a registered process type and enqueue it
//! - **Step execution**: schedule-to-start, start-to-close and heartbeat
//!   deadlines, retry with backoff, and replay of recorded outcomes
//! - **Workers**: a pool pulling runs off one task queue, with recovery of
//!   runs left open by a previous instance
//!
//! ## Core Components
//!
//! - [`engine::Engine`]: launch, workers, wait and shutdown
//! - [`step::ProcessContext`]: durable step execution inside a run
//! - [`log::ExecutionLog`]: where runs and step outcomes are recorded
//! - [`retry::RetryPolicy`]: backoff between attempts

pub mod engine;
pub mod log;
pub mod metrics;
pub mod retry;
pub mod step;

pub use engine::{Engine, EngineBuilder, EngineError, Process};
pub use log::{ExecutionLog, InMemoryExecutionLog, LogError, RunOutcome, RunRecord, RunStatus};
pub use retry::RetryPolicy;
pub use step::{Heartbeat, ProcessContext, StepError, StepOptions, TimeoutKind};
