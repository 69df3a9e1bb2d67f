//! # Settlement Core
//!
//! Domain types and collaborator traits for mint/redeem settlement.
//!
//! This crate defines what the rest of the workspace agrees on:
//!
//! - **Requests**: [`request::Request`] and its forward-only status machine
//! - **Record API**: [`store::RequestStore`], the only owner of request records
//! - **Settlement**: [`settlement::SettlementClient`], an idempotent mint/redeem capability
//! - **Launch**: [`launch::ProcessLauncher`], the handshake with the durable-execution substrate
//! - **Errors**: step-level failures and their retry eligibility
//!
//! Implementations live elsewhere: the substrate in `settlement-runtime`,
//! persistence in `settlement-postgres`, test doubles in `settlement-testing`.

pub mod error;
pub mod launch;
pub mod request;
pub mod settlement;
pub mod store;

pub use error::{Retryable, SettlementError, StatusError};
pub use launch::{LaunchError, LaunchOptions, ProcessLauncher, RunId};
pub use request::{Amount, Request, RequestId, RequestKind, RequestStatus, ValidationError};
pub use settlement::{ProviderResponse, SettlementClient, TransportError};
pub use store::{RequestStore, StoreError};

/// Environment traits for dependency injection.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait for time operations
    ///
    /// Abstracts time so record timestamps and run deadlines are
    /// deterministic in tests.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
