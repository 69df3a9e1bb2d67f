//! The request lifecycle process.
//!
//! One run per request, launched by intake right after the request is stored:
//!
//! ```text
//! settle ──ok──▶ update_status(completed) ──▶ done
//!   │
//!   └─err──▶ update_status(failed) ──▶ fail with the settlement error
//! ```
//!
//! Both steps execute durably. After a crash the run is re-executed and a
//! step whose outcome was recorded is replayed instead of repeated, so the
//! provider is called again only if its outcome never made it to the log.
//! The provider call is keyed by the request id, which makes even that
//! repetition safe.

use crate::steps::{SettlementStep, StatusTransitionStep};
use serde::{Deserialize, Serialize};
use settlement_core::{Amount, RequestId, RequestKind, RequestStatus, SettlementError, StatusError};
use settlement_runtime::{Process, ProcessContext, StepError, StepOptions};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Launch input of one lifecycle run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleInput {
    /// Mint or redeem.
    pub kind: RequestKind,
    /// Amount to settle.
    pub amount: Amount,
    /// Destination identifier.
    pub recipient: String,
    /// Request the run is bound to; also the idempotency key.
    pub request_id: RequestId,
}

/// Terminal error of a lifecycle run.
///
/// When settlement failed the error renders as the settlement failure,
/// whether or not the `failed` status could be recorded.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleError {
    /// Settlement failed and the request was marked `failed`.
    #[error("{cause}")]
    Settlement {
        /// Root cause from the settlement step.
        cause: StepError<SettlementError>,
    },

    /// Settlement failed and so did marking the request `failed`.
    #[error("{cause}")]
    SettlementUnrecorded {
        /// Root cause from the settlement step.
        cause: StepError<SettlementError>,
        /// Why the `failed` status could not be written.
        record: StepError<StatusError>,
    },

    /// Settlement succeeded but the `completed` status could not be written.
    #[error("{cause}")]
    Completion {
        /// Why the `completed` status could not be written.
        cause: StepError<StatusError>,
    },
}

impl LifecycleError {
    /// The settlement failure, if settlement is what failed.
    #[must_use]
    pub const fn settlement_cause(&self) -> Option<&StepError<SettlementError>> {
        match self {
            Self::Settlement { cause } | Self::SettlementUnrecorded { cause, .. } => Some(cause),
            Self::Completion { .. } => None,
        }
    }

    /// The failed bookkeeping write, if any.
    #[must_use]
    pub const fn status_write_failure(&self) -> Option<&StepError<StatusError>> {
        match self {
            Self::Settlement { .. } => None,
            Self::SettlementUnrecorded { record, .. } => Some(record),
            Self::Completion { cause } => Some(cause),
        }
    }

    /// Message of the error that decided the run's fate.
    #[must_use]
    pub fn root_cause(&self) -> String {
        self.to_string()
    }
}

/// Settlement followed by one status write.
#[derive(Clone)]
pub struct RequestLifecycle {
    settlement: SettlementStep,
    status: StatusTransitionStep,
    options: StepOptions,
}

impl RequestLifecycle {
    /// Create the process over its two steps, with `options` applied to both.
    #[must_use]
    pub const fn new(
        settlement: SettlementStep,
        status: StatusTransitionStep,
        options: StepOptions,
    ) -> Self {
        Self {
            settlement,
            status,
            options,
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(run_id = %ctx.run_id(), request_id = %input.request_id, kind = input.kind.as_str())
    )]
    async fn drive(
        &self,
        ctx: &ProcessContext,
        input: LifecycleInput,
    ) -> Result<(), LifecycleError> {
        tracing::info!("Lifecycle started");
        let input = &input;

        let settled = ctx
            .execute_step(SettlementStep::NAME, &self.options, |heartbeat| async move {
                heartbeat.beat();
                self.settlement
                    .invoke(input.kind, input.amount, &input.recipient, input.request_id)
                    .await
            })
            .await;

        match settled {
            Ok(_order) => {
                self.write_status(ctx, input.request_id, RequestStatus::Completed)
                    .await
                    .map_err(|cause| LifecycleError::Completion { cause })?;
                tracing::info!("Lifecycle completed");
                Ok(())
            }
            Err(cause) => {
                let recorded = self
                    .write_status(ctx, input.request_id, RequestStatus::Failed)
                    .await;
                let err = match recorded {
                    Ok(()) => LifecycleError::Settlement { cause },
                    Err(record) => {
                        tracing::error!(error = %record, "Failed to record settlement failure");
                        LifecycleError::SettlementUnrecorded { cause, record }
                    }
                };
                tracing::warn!(error = %err, "Lifecycle failed");
                Err(err)
            }
        }
    }

    async fn write_status(
        &self,
        ctx: &ProcessContext,
        request_id: RequestId,
        status: RequestStatus,
    ) -> Result<(), StepError<StatusError>> {
        let run_id = ctx.run_id();
        ctx.execute_step(StatusTransitionStep::NAME, &self.options, |heartbeat| async move {
            heartbeat.beat();
            self.status.invoke(request_id, run_id, status).await
        })
        .await
    }
}

impl Process for RequestLifecycle {
    type Input = LifecycleInput;
    type Error = LifecycleError;

    const NAME: &'static str = "request-lifecycle";

    fn run<'a>(
        &'a self,
        ctx: &'a ProcessContext,
        input: Self::Input,
    ) -> Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send + 'a>> {
        Box::pin(self.drive(ctx, input))
    }
}
