//! Settlement step: one idempotent provider call per request.

use settlement_core::settlement::OrderData;
use settlement_core::{Amount, RequestId, RequestKind, SettlementClient, SettlementError};
use std::sync::Arc;

/// Calls the settlement provider for a request.
///
/// The client is built once at startup. If that failed, the construction
/// error is kept and returned by every invocation without contacting the
/// provider.
#[derive(Clone)]
pub struct SettlementStep {
    client: Result<Arc<dyn SettlementClient>, SettlementError>,
}

impl SettlementStep {
    /// Name under which the step's outcome is recorded.
    pub const NAME: &'static str = "settle";

    /// Create the step over the configured client, or its construction error.
    #[must_use]
    pub const fn new(client: Result<Arc<dyn SettlementClient>, SettlementError>) -> Self {
        Self { client }
    }

    /// Mint or redeem `amount` for `recipient`, keyed by `request_id`.
    ///
    /// # Errors
    ///
    /// - `ClientConstruction`: no client is available
    /// - `Transport`: the provider could not be reached
    /// - `Rejected`: the provider returned error entries; renders as the first detail
    #[tracing::instrument(
        skip(self, amount, recipient),
        fields(request_id = %request_id, kind = kind.as_str())
    )]
    pub async fn invoke(
        &self,
        kind: RequestKind,
        amount: Amount,
        recipient: &str,
        request_id: RequestId,
    ) -> Result<Option<OrderData>, SettlementError> {
        let client = self.client.as_ref().map_err(Clone::clone)?;
        let key = request_id.to_string();

        let response = match kind {
            RequestKind::Mint => client.mint(amount, recipient, &key).await,
            RequestKind::Redeem => client.redeem(amount, recipient, &key).await,
        }
        .inspect_err(|e| tracing::warn!(error = %e, "Settlement transport failure"))?;

        if let Some(rejection) = SettlementError::from_entries(response.errors) {
            tracing::warn!(detail = %rejection, "Settlement rejected by provider");
            metrics::counter!("requests.settled", "kind" => kind.as_str(), "result" => "rejected")
                .increment(1);
            return Err(rejection);
        }

        tracing::info!(
            order_id = response.data.as_ref().map(|order| order.id.as_str()),
            "Settlement accepted"
        );
        metrics::counter!("requests.settled", "kind" => kind.as_str(), "result" => "accepted")
            .increment(1);
        Ok(response.data)
    }
}
