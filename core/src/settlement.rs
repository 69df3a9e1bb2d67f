//! Capability interface to the settlement provider.
//!
//! A [`SettlementClient`] exposes exactly two operations, `mint` and
//! `redeem`. Both take an idempotency key; a provider that honors it
//! produces at most one settlement effect per key no matter how often the
//! call is repeated.
//!
//! A call either fails in transport ([`TransportError`]) or returns a
//! [`ProviderResponse`] envelope, which may carry provider-level error
//! entries instead of data.

use crate::request::Amount;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Network or protocol failure talking to the provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Response envelope returned by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The order created or replayed for this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<OrderData>,
    /// Related resources (e.g. on-chain transfers).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<serde_json::Value>,
    /// Hypermedia links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<serde_json::Value>,
    /// Provider-level errors. Non-empty means the operation was rejected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ProviderErrorEntry>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl ProviderResponse {
    /// A successful response carrying `order`.
    #[must_use]
    pub fn accepted(order: OrderData) -> Self {
        Self {
            data: Some(order),
            ..Self::default()
        }
    }

    /// A rejection carrying `errors`.
    #[must_use]
    pub fn rejected(errors: Vec<ProviderErrorEntry>) -> Self {
        Self {
            errors,
            ..Self::default()
        }
    }

    /// Whether the provider rejected the operation.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// The order resource in a provider response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderData {
    /// Provider order id.
    pub id: String,
    /// Resource type, `"order"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Order attributes.
    pub attributes: OrderAttributes,
}

/// Attributes of a provider order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAttributes {
    /// Creation timestamp as sent by the provider.
    #[serde(default)]
    pub created: String,
    /// Provider-side order status.
    #[serde(default)]
    pub status: String,
    /// `"mint"` or `"redeem"`.
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Last update timestamp as sent by the provider.
    #[serde(default)]
    pub updated: String,
}

/// One provider-level error entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderErrorEntry {
    /// Machine-readable code, e.g. `ValidationError`.
    #[serde(default)]
    pub code: String,
    /// Human-readable detail.
    #[serde(default)]
    pub detail: String,
    /// Provider error id.
    #[serde(default)]
    pub id: String,
    /// HTTP-style status code as text.
    #[serde(default)]
    pub status: String,
    /// Short summary.
    #[serde(default)]
    pub title: String,
    /// Where in the request the problem was found.
    #[serde(default)]
    pub source: Option<ErrorSource>,
    /// Related links.
    #[serde(default)]
    pub links: BTreeMap<String, String>,
    /// Free-form metadata.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Location of a provider-side validation problem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSource {
    /// Offending query parameter.
    #[serde(default)]
    pub parameter: String,
    /// JSON pointer into the request body.
    #[serde(default)]
    pub pointer: String,
}

/// Idempotent mint and redeem operations against the settlement provider.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the configured client can
/// be shared as `Arc<dyn SettlementClient>`.
pub trait SettlementClient: Send + Sync {
    /// Issue `amount` to `recipient`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the provider could not be reached or its
    /// response could not be decoded.
    fn mint(
        &self,
        amount: Amount,
        recipient: &str,
        idempotency_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, TransportError>> + Send + '_>>;

    /// Take `amount` back from `recipient`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the provider could not be reached or its
    /// response could not be decoded.
    fn redeem(
        &self,
        amount: Amount,
        recipient: &str,
        idempotency_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, TransportError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn decodes_provider_rejection_envelope() {
        let body = r#"{
            "errors": [{
                "code": "ValidationError",
                "detail": "An error occurred with the request data.",
                "id": "error123",
                "links": {"additionalProp": "/some-resource/2VZvtmVc2j3gQ80CTlcuQXbGrwC"},
                "meta": {"additionalProp": "string"},
                "source": {"parameter": "page[cursor]", "pointer": "/body/data/attributes"},
                "status": "400",
                "title": "A validation error occurred"
            }],
            "links": {"additionalProp": {"href": "/some-resource/2VZvtmVc2j3gQ80CTlcuQXbGrwC"}},
            "meta": {"additionalProp": "string"}
        }"#;

        let response: ProviderResponse = serde_json::from_str(body).unwrap();
        assert!(response.is_rejected());
        assert!(response.data.is_none());
        let entry = &response.errors[0];
        assert_eq!(entry.detail, "An error occurred with the request data.");
        assert_eq!(entry.source.as_ref().unwrap().pointer, "/body/data/attributes");
    }

    #[test]
    fn decodes_accepted_order() {
        let body = r#"{"data": {
            "attributes": {"created": "2020-01-01T12:00:00Z", "status": "pending",
                           "type": "mint", "updated": "2020-01-01T12:00:00Z"},
            "id": "2VZvtmVc2j3gQ80CTlcuQXbGrwC",
            "type": "order"
        }}"#;

        let response: ProviderResponse = serde_json::from_str(body).unwrap();
        assert!(!response.is_rejected());
        let order = response.data.unwrap();
        assert_eq!(order.kind, "order");
        assert_eq!(order.attributes.kind, "mint");
    }
}
