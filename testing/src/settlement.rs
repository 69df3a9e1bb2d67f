//! Settlement client double that records calls and honors idempotency keys.

use settlement_core::settlement::{OrderAttributes, OrderData, ProviderErrorEntry};
use settlement_core::{Amount, ProviderResponse, RequestKind, SettlementClient, TransportError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One call received by [`RecordingSettlementClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementCall {
    /// `Mint` or `Redeem`.
    pub operation: RequestKind,
    /// Amount requested.
    pub amount: Amount,
    /// Recipient requested.
    pub recipient: String,
    /// Idempotency key sent with the call.
    pub idempotency_key: String,
}

#[derive(Debug, Default)]
struct ClientState {
    calls: Vec<SettlementCall>,
    effects: HashMap<String, ProviderResponse>,
    rejections: HashMap<String, Vec<ProviderErrorEntry>>,
    transport_failures: u32,
    stall: Option<Duration>,
}

/// In-memory settlement provider.
///
/// Every call is recorded. A successful call creates one settlement effect
/// per idempotency key; repeating a key replays the first response without
/// a new effect. Rejections, transport failures and stalls can be scripted.
#[derive(Debug, Clone, Default)]
pub struct RecordingSettlementClient {
    state: Arc<Mutex<ClientState>>,
}

impl RecordingSettlementClient {
    /// Create a client that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every call for `recipient` with a single validation error.
    pub fn reject_recipient(&self, recipient: &str, detail: &str) {
        self.reject_recipient_with(
            recipient,
            vec![ProviderErrorEntry {
                code: "ValidationError".to_string(),
                detail: detail.to_string(),
                status: "400".to_string(),
                ..ProviderErrorEntry::default()
            }],
        );
    }

    /// Reject every call for `recipient` with `errors`.
    pub fn reject_recipient_with(&self, recipient: &str, errors: Vec<ProviderErrorEntry>) {
        if let Ok(mut state) = self.state.lock() {
            state.rejections.insert(recipient.to_string(), errors);
        }
    }

    /// Fail the next `times` calls in transport.
    pub fn fail_transport(&self, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.transport_failures = times;
        }
    }

    /// Delay every response by `duration`.
    pub fn stall(&self, duration: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.stall = Some(duration);
        }
    }

    /// Every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<SettlementCall> {
        self.state.lock().map(|state| state.calls.clone()).unwrap_or_default()
    }

    /// Number of distinct settlement effects produced.
    #[must_use]
    pub fn effect_count(&self) -> usize {
        self.state.lock().map(|state| state.effects.len()).unwrap_or(0)
    }

    async fn settle(
        &self,
        operation: RequestKind,
        amount: Amount,
        recipient: String,
        idempotency_key: String,
    ) -> Result<ProviderResponse, TransportError> {
        let stall = {
            let mut state = self.lock()?;
            state.calls.push(SettlementCall {
                operation,
                amount,
                recipient: recipient.clone(),
                idempotency_key: idempotency_key.clone(),
            });
            if state.transport_failures > 0 {
                state.transport_failures -= 1;
                return Err(TransportError("connection reset by peer".to_string()));
            }
            state.stall
        };

        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }

        let mut state = self.lock()?;
        if let Some(errors) = state.rejections.get(&recipient) {
            return Ok(ProviderResponse::rejected(errors.clone()));
        }
        let next_order = state.effects.len() + 1;
        let response = state
            .effects
            .entry(idempotency_key)
            .or_insert_with(|| {
                ProviderResponse::accepted(OrderData {
                    id: format!("order-{next_order}"),
                    kind: "order".to_string(),
                    attributes: OrderAttributes {
                        status: "pending".to_string(),
                        kind: operation.as_str().to_string(),
                        ..OrderAttributes::default()
                    },
                })
            })
            .clone();
        Ok(response)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ClientState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError("settlement client lock poisoned".to_string()))
    }
}

impl SettlementClient for RecordingSettlementClient {
    fn mint(
        &self,
        amount: Amount,
        recipient: &str,
        idempotency_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, TransportError>> + Send + '_>> {
        Box::pin(self.settle(
            RequestKind::Mint,
            amount,
            recipient.to_string(),
            idempotency_key.to_string(),
        ))
    }

    fn redeem(
        &self,
        amount: Amount,
        recipient: &str,
        idempotency_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, TransportError>> + Send + '_>> {
        Box::pin(self.settle(
            RequestKind::Redeem,
            amount,
            recipient.to_string(),
            idempotency_key.to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn amount() -> Amount {
        Amount::from_minor_units(1050).unwrap()
    }

    #[tokio::test]
    async fn repeated_key_produces_one_effect() {
        let client = RecordingSettlementClient::new();

        let first = client.mint(amount(), "0xabc", "key-1").await.unwrap();
        let second = client.mint(amount(), "0xabc", "key-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(client.calls().len(), 2);
        assert_eq!(client.effect_count(), 1);
    }

    #[tokio::test]
    async fn scripted_rejection_has_no_effect() {
        let client = RecordingSettlementClient::new();
        client.reject_recipient("0xdeadbeef", "nope");

        let response = client.redeem(amount(), "0xdeadbeef", "key-1").await.unwrap();

        assert!(response.is_rejected());
        assert_eq!(response.errors[0].detail, "nope");
        assert_eq!(client.effect_count(), 0);
    }

    #[tokio::test]
    async fn transport_failures_are_consumed() {
        let client = RecordingSettlementClient::new();
        client.fail_transport(1);

        assert!(client.mint(amount(), "0xabc", "key-1").await.is_err());
        assert!(client.mint(amount(), "0xabc", "key-1").await.is_ok());
        assert_eq!(client.effect_count(), 1);
    }
}
