//! Status transition step: read-modify-write of one request's status.

use settlement_core::{RequestId, RequestStatus, RequestStore, RunId, StatusError};
use std::sync::Arc;

/// Moves a stored request to a terminal status.
///
/// The write is guarded: only `started` → `completed` and
/// `started` → `failed` are accepted. Writing the status the request
/// already has is a no-op, so a retried attempt whose first write landed
/// still succeeds.
///
/// A run can reach this step before intake has bound it to the request.
/// A request still `pending` is bound to the calling run and moved to its
/// terminal status in the same write. Every write is conditional on the
/// status that was read, so a concurrent intake write surfaces as a
/// retryable `Write` error instead of being overwritten.
#[derive(Clone)]
pub struct StatusTransitionStep {
    store: Arc<dyn RequestStore>,
}

impl StatusTransitionStep {
    /// Name under which the step's outcome is recorded.
    pub const NAME: &'static str = "update_status";

    /// Create the step over the request store.
    #[must_use]
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self { store }
    }

    /// Write `status` to the request `request_id` on behalf of `run_id`.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such request; nothing is written
    /// - `IllegalTransition`: `status` is not a forward step from the stored status
    /// - `Write`: the store failed to read or persist, or the stored status
    ///   changed under the write
    #[tracing::instrument(
        skip(self),
        fields(request_id = %request_id, run_id = %run_id, status = status.as_str())
    )]
    pub async fn invoke(
        &self,
        request_id: RequestId,
        run_id: &RunId,
        status: RequestStatus,
    ) -> Result<(), StatusError> {
        let mut request = self.store.find_by_id(request_id).await?;
        if request.status == status {
            tracing::debug!("Status already written");
            return Ok(());
        }

        let read = request.status;
        if read == RequestStatus::Pending {
            tracing::debug!("Binding run ahead of intake");
            request.mark_started(run_id.clone())?;
        }
        request.transition_to(status)?;
        self.store.save_if(request, read).await?;

        tracing::info!("Request status written");
        metrics::counter!("requests.status_writes", "status" => status.as_str()).increment(1);
        Ok(())
    }
}
