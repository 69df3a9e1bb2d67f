//! Step-level errors of the request lifecycle.
//!
//! These are the errors the two lifecycle steps hand back to the process.
//! They are serializable because the substrate records every step outcome,
//! failures included, and replays it after a crash.

use crate::request::{IllegalTransition, RequestId};
use crate::settlement::{ProviderErrorEntry, TransportError};
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a failure may succeed if the same step is attempted again.
///
/// The substrate consults this between attempts; it never retries a
/// failure that reports `false`.
pub trait Retryable {
    /// `true` for transient failures.
    fn is_retryable(&self) -> bool;
}

/// Failure of the settlement step.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementError {
    /// The settlement client could not be built; the provider was not contacted.
    #[error("failed to construct settlement client: {0}")]
    ClientConstruction(String),

    /// Transport failure, message propagated as-is.
    #[error("{0}")]
    Transport(String),

    /// The provider answered but rejected the operation.
    ///
    /// Renders as the first entry's detail. Every entry is kept in `errors`.
    #[error("{detail}")]
    Rejected {
        /// Detail of the first provider error entry.
        detail: String,
        /// All entries the provider returned.
        errors: Vec<ProviderErrorEntry>,
    },
}

impl SettlementError {
    /// Build a rejection from the provider's error entries.
    ///
    /// Returns `None` when there are no entries.
    #[must_use]
    pub fn from_entries(errors: Vec<ProviderErrorEntry>) -> Option<Self> {
        let detail = errors.first()?.detail.clone();
        Some(Self::Rejected { detail, errors })
    }
}

impl From<TransportError> for SettlementError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.0)
    }
}

impl Retryable for SettlementError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Failure of the status transition step.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusError {
    /// The request does not exist. Indicates a caller bug; never retried.
    #[error("request with ID {0} not found")]
    NotFound(RequestId),

    /// Persisting the new status failed. Potentially transient.
    #[error("failed to write request status: {0}")]
    Write(String),

    /// The requested status is not a forward step from the stored one.
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
}

impl From<StoreError> for StatusError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Write(other.to_string()),
        }
    }
}

impl Retryable for StatusError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Write(_))
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::ConcurrencyConflict { .. })
    }
}
