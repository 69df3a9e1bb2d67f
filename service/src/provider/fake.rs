//! Deterministic settlement provider for development and testing.
//!
//! Rejects one well-known recipient with the provider's validation error
//! envelope and accepts everything else. Orders are remembered by
//! idempotency key, so repeating a call never creates a second order.

use settlement_core::environment::Clock;
use settlement_core::settlement::{
    ErrorSource, OrderAttributes, OrderData, ProviderErrorEntry,
};
use settlement_core::{Amount, ProviderResponse, RequestKind, SettlementClient, TransportError};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Recipient the fake provider always rejects.
pub const REJECTED_RECIPIENT: &str = "0xdeadbeef";

/// Detail of the rejection returned for [`REJECTED_RECIPIENT`].
pub const REJECTION_DETAIL: &str = "An error occurred with the request data.";

/// In-process settlement provider honoring idempotency keys.
#[derive(Clone)]
pub struct FakeSettlementClient {
    clock: Arc<dyn Clock>,
    orders: Arc<Mutex<HashMap<String, ProviderResponse>>>,
}

impl FakeSettlementClient {
    /// Create a provider stamping orders with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            orders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of distinct orders created.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.orders.lock().map(|orders| orders.len()).unwrap_or(0)
    }

    fn settle(
        &self,
        kind: RequestKind,
        recipient: &str,
        idempotency_key: &str,
    ) -> Result<ProviderResponse, TransportError> {
        if recipient == REJECTED_RECIPIENT {
            tracing::debug!(recipient, "Fake provider rejecting recipient");
            return Ok(ProviderResponse::rejected(vec![rejection()]));
        }

        let mut orders = self
            .orders
            .lock()
            .map_err(|_| TransportError("fake provider lock poisoned".to_string()))?;
        let now = self.clock.now().to_rfc3339();
        let response = orders
            .entry(idempotency_key.to_string())
            .or_insert_with(|| {
                ProviderResponse::accepted(OrderData {
                    id: format!("order-{idempotency_key}"),
                    kind: "order".to_string(),
                    attributes: OrderAttributes {
                        created: now.clone(),
                        status: "pending".to_string(),
                        kind: kind.as_str().to_string(),
                        updated: now,
                    },
                })
            })
            .clone();
        Ok(response)
    }
}

fn rejection() -> ProviderErrorEntry {
    ProviderErrorEntry {
        code: "ValidationError".to_string(),
        detail: REJECTION_DETAIL.to_string(),
        id: "error123".to_string(),
        status: "400".to_string(),
        title: "A validation error occurred".to_string(),
        source: Some(ErrorSource {
            parameter: "page[cursor]".to_string(),
            pointer: "/body/data/attributes".to_string(),
        }),
        links: BTreeMap::new(),
        meta: BTreeMap::new(),
    }
}

impl SettlementClient for FakeSettlementClient {
    fn mint(
        &self,
        _amount: Amount,
        recipient: &str,
        idempotency_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, TransportError>> + Send + '_>> {
        let result = self.settle(RequestKind::Mint, recipient, idempotency_key);
        Box::pin(async move { result })
    }

    fn redeem(
        &self,
        _amount: Amount,
        recipient: &str,
        idempotency_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, TransportError>> + Send + '_>> {
        let result = self.settle(RequestKind::Redeem, recipient, idempotency_key);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use settlement_testing::test_clock;

    fn client() -> FakeSettlementClient {
        FakeSettlementClient::new(Arc::new(test_clock()))
    }

    #[tokio::test]
    async fn rejects_the_well_known_recipient() {
        let client = client();
        let amount = Amount::from_minor_units(1050).unwrap();

        let response = client.mint(amount, REJECTED_RECIPIENT, "key").await.unwrap();

        assert!(response.is_rejected());
        assert_eq!(response.errors[0].detail, REJECTION_DETAIL);
        assert_eq!(response.errors[0].code, "ValidationError");
        assert_eq!(client.order_count(), 0);
    }

    #[tokio::test]
    async fn repeated_key_replays_the_first_order() {
        let client = client();
        let amount = Amount::from_minor_units(1050).unwrap();

        let first = client.redeem(amount, "0xnotdeadbeef", "key").await.unwrap();
        let second = client.redeem(amount, "0xnotdeadbeef", "key").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(client.order_count(), 1);
        let order = first.data.unwrap();
        assert_eq!(order.kind, "order");
        assert_eq!(order.attributes.status, "pending");
        assert_eq!(order.attributes.kind, "redeem");
    }
}
