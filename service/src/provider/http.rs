//! Settlement provider client over HTTP.

use serde::Serialize;
use settlement_core::{
    Amount, ProviderResponse, RequestKind, SettlementClient, SettlementError, TransportError,
};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

#[derive(Serialize)]
struct OrderRequest<'a> {
    amount: String,
    recipient: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Provider client posting orders to `{base_url}/mints` and `{base_url}/redeems`.
///
/// Every call carries the bearer token and the idempotency key as the
/// `Idempotency-Key` header. 2xx and 4xx JSON envelopes are returned as
/// responses; anything else is a [`TransportError`].
#[derive(Clone)]
pub struct HttpSettlementClient {
    client: reqwest::Client,
    base_url: String,
    jwt: String,
}

impl HttpSettlementClient {
    /// Build a client.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::ClientConstruction`] if the base URL or
    /// token is empty, or the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        jwt: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SettlementError> {
        let base_url = base_url.into();
        let jwt = jwt.into();
        if base_url.trim().is_empty() {
            return Err(SettlementError::ClientConstruction(
                "settlement base URL is not configured".to_string(),
            ));
        }
        if jwt.trim().is_empty() {
            return Err(SettlementError::ClientConstruction(
                "settlement JWT is not configured".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SettlementError::ClientConstruction(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            jwt,
        })
    }

    async fn submit(
        &self,
        kind: RequestKind,
        amount: Amount,
        recipient: &str,
        idempotency_key: &str,
    ) -> Result<ProviderResponse, TransportError> {
        let path = match kind {
            RequestKind::Mint => "mints",
            RequestKind::Redeem => "redeems",
        };
        let body = OrderRequest {
            amount: amount.to_string(),
            recipient,
            kind: kind.as_str(),
        };

        let response = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .bearer_auth(&self.jwt)
            .header("Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError(format!("provider returned {status}: {body}")));
        }

        let envelope: ProviderResponse = response
            .json()
            .await
            .map_err(|e| TransportError(format!("undecodable provider response ({status}): {e}")))?;

        if status.is_client_error() && !envelope.is_rejected() {
            return Err(TransportError(format!(
                "provider returned {status} without error entries"
            )));
        }

        tracing::debug!(
            %status,
            kind = kind.as_str(),
            rejected = envelope.is_rejected(),
            "Provider responded"
        );
        Ok(envelope)
    }
}

impl SettlementClient for HttpSettlementClient {
    fn mint(
        &self,
        amount: Amount,
        recipient: &str,
        idempotency_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, TransportError>> + Send + '_>> {
        let recipient = recipient.to_string();
        let key = idempotency_key.to_string();
        Box::pin(async move { self.submit(RequestKind::Mint, amount, &recipient, &key).await })
    }

    fn redeem(
        &self,
        amount: Amount,
        recipient: &str,
        idempotency_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderResponse, TransportError>> + Send + '_>> {
        let recipient = recipient.to_string();
        let key = idempotency_key.to_string();
        Box::pin(async move { self.submit(RequestKind::Redeem, amount, &recipient, &key).await })
    }
}
