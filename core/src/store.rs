//! Record API for request persistence.
//!
//! The store owns every [`Request`]. Callers hold only a [`RequestId`] and go
//! through an explicit read-modify-write: `find_by_id`, mutate the returned
//! copy, `save` it back. Writers that can race (intake binding a run, the
//! lifecycle writing a terminal status) use `save_if`, which only lands if
//! the stored status is still the one they read.
//!
//! # Implementations
//!
//! - `PostgresRequestStore` (in `settlement-postgres`): production storage
//! - `InMemoryRequestStore` (in `settlement-testing`): deterministic tests

use crate::request::{Request, RequestId, RequestStatus};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during request store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A request with this identity already exists.
    #[error("request {0} already exists")]
    Duplicate(RequestId),

    /// No request with this identity exists.
    #[error("request with ID {0} not found")]
    NotFound(RequestId),

    /// Database connection or query failure.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored row could not be mapped back to a request.
    #[error("Corrupt request record: {0}")]
    Corrupt(String),

    /// Optimistic concurrency check failed.
    ///
    /// The request's status changed between the read and the conditional write.
    #[error("Concurrency conflict on request {id}: expected status {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The request being written.
        id: RequestId,
        /// Status the writer read.
        expected: RequestStatus,
        /// Status currently stored.
        actual: RequestStatus,
    },
}

/// Durable storage for requests.
///
/// `save` is last-writer-wins. `save_if` is the compare-and-set used by
/// writers that can run concurrently on the same request.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so steps and intake can
/// share an `Arc<dyn RequestStore>`.
pub trait RequestStore: Send + Sync {
    /// Insert a new request.
    ///
    /// # Errors
    ///
    /// - `Duplicate`: the identity is already taken
    /// - `Database`: the write failed
    fn create(
        &self,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Point lookup by identity.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no request with this identity
    /// - `Database`/`Corrupt`: the read failed
    fn find_by_id(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Request, StoreError>> + Send + '_>>;

    /// Persist the mutable fields (`status`, `run_id`) of an existing request.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no request with this identity
    /// - `Database`: the write failed
    fn save(
        &self,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Persist the mutable fields only if the stored status is still `expected`.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no request with this identity
    /// - `ConcurrencyConflict`: the stored status is no longer `expected`
    /// - `Database`: the write failed
    fn save_if(
        &self,
        request: Request,
        expected: RequestStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}
