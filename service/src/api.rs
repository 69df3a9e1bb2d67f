//! Transport-neutral inbound boundary.
//!
//! Maps raw request bodies to intake calls and intake results to a status
//! code plus JSON body. Whatever carries the bytes (HTTP, stdin lines) only
//! has to forward them.

use crate::intake::{IntakeError, IntakeService};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use settlement_core::{Request, RequestId, RequestKind, RequestStore, StoreError, ValidationError};

/// Message returned for every malformed payload.
pub const INVALID_PAYLOAD: &str = "Invalid request payload";

/// Acknowledgment status of an accepted request.
pub const WORKFLOW_STARTED: &str = "workflow started";

/// Status code and JSON body of one answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiResponse {
    /// HTTP-equivalent status code.
    pub status: u16,
    /// Response body.
    pub body: Value,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn invalid_payload() -> Self {
        Self::error(400, INVALID_PAYLOAD)
    }
}

#[derive(Debug, Deserialize)]
struct SubmitPayload {
    amount: f64,
    recipient: String,
}

/// Stored request as returned by status lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestView {
    /// Request id.
    pub id: String,
    /// `mint` or `redeem`.
    pub kind: &'static str,
    /// Amount with two fractional digits.
    pub amount: String,
    /// Destination identifier.
    pub recipient: String,
    /// Current lifecycle status.
    pub status: &'static str,
    /// Creation time, RFC 3339.
    pub created_at: String,
    /// Bound run, once started.
    pub run_id: Option<String>,
}

impl From<&Request> for RequestView {
    fn from(request: &Request) -> Self {
        Self {
            id: request.id.to_string(),
            kind: request.kind.as_str(),
            amount: request.amount.to_string(),
            recipient: request.recipient.clone(),
            status: request.status.as_str(),
            created_at: request.created_at.to_rfc3339(),
            run_id: request.run_id.as_ref().map(ToString::to_string),
        }
    }
}

/// Submit a mint or redeem request from a raw JSON body.
///
/// - 200 `{"id", "status": "workflow started"}` once the lifecycle is launched
/// - 400 `{"error": "Invalid request payload"}` when the body is malformed;
///   nothing is stored
/// - 500 `{"error": <message>}` on any other failure
pub async fn handle(intake: &IntakeService, kind: RequestKind, body: &[u8]) -> ApiResponse {
    let payload: SubmitPayload = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            let err = ValidationError::MalformedPayload(e.to_string());
            tracing::debug!(kind = kind.as_str(), reason = err.detail(), "Rejected payload");
            return ApiResponse::invalid_payload();
        }
    };

    match intake.submit(kind, payload.amount, &payload.recipient).await {
        Ok(submission) => ApiResponse::ok(json!({
            "id": submission.request_id.to_string(),
            "status": WORKFLOW_STARTED,
        })),
        Err(IntakeError::Validation(_)) => ApiResponse::invalid_payload(),
        Err(e) => {
            tracing::error!(kind = kind.as_str(), error = %e, "Intake failed");
            ApiResponse::error(500, e.to_string())
        }
    }
}

/// Look up a request by id.
///
/// 400 for an id that is not a UUID, 404 when no such request exists.
pub async fn status(store: &dyn RequestStore, id: &str) -> ApiResponse {
    let Ok(id) = RequestId::parse(id) else {
        return ApiResponse::invalid_payload();
    };

    match store.find_by_id(id).await {
        Ok(request) => match serde_json::to_value(RequestView::from(&request)) {
            Ok(view) => ApiResponse::ok(view),
            Err(e) => ApiResponse::error(500, e.to_string()),
        },
        Err(e @ StoreError::NotFound(_)) => ApiResponse::error(404, e.to_string()),
        Err(e) => {
            tracing::error!(request_id = %id, error = %e, "Status lookup failed");
            ApiResponse::error(500, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct Command {
    operation: String,
    #[serde(default)]
    id: Option<String>,
}

/// Answer one JSON command line.
///
/// `{"operation": "mint" | "redeem", "amount", "recipient"}` submits a
/// request, `{"operation": "status", "id"}` looks one up. Anything else is
/// an invalid payload.
pub async fn dispatch(
    intake: &IntakeService,
    store: &dyn RequestStore,
    line: &[u8],
) -> ApiResponse {
    let Ok(command) = serde_json::from_slice::<Command>(line) else {
        return ApiResponse::invalid_payload();
    };

    match command.operation.as_str() {
        "status" => match command.id {
            Some(id) => status(store, &id).await,
            None => ApiResponse::invalid_payload(),
        },
        operation => match RequestKind::parse(operation) {
            Ok(kind) => handle(intake, kind, line).await,
            Err(_) => ApiResponse::invalid_payload(),
        },
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use settlement_core::{LaunchError, ProcessLauncher, RequestStatus};
    use settlement_testing::{FailingLauncher, InMemoryRequestStore, RecordingLauncher, test_clock};
    use std::sync::Arc;
    use std::time::Duration;

    fn intake(
        store: &InMemoryRequestStore,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> IntakeService {
        IntakeService::new(
            Arc::new(store.clone()),
            Ok(launcher),
            Arc::new(test_clock()),
            "mint-redeem",
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn accepted_request_is_acknowledged() {
        let store = InMemoryRequestStore::new();
        let intake = intake(&store, Arc::new(RecordingLauncher::new()));

        let response = handle(
            &intake,
            RequestKind::Mint,
            br#"{"amount": 10.50, "recipient": "0xnotdeadbeef"}"#,
        )
        .await;

        assert_eq!(response.status, 200);
        assert_eq!(response.body["status"], WORKFLOW_STARTED);
        let id = RequestId::parse(response.body["id"].as_str().unwrap()).unwrap();
        assert_eq!(store.get(id).unwrap().status, RequestStatus::Started);
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected_without_a_record() {
        let store = InMemoryRequestStore::new();
        let intake = intake(&store, Arc::new(RecordingLauncher::new()));

        let bodies: [&[u8]; 6] = [
            b"not json",
            br#"{"recipient": "0xabc"}"#,
            br#"{"amount": "ten", "recipient": "0xabc"}"#,
            br#"{"amount": 0, "recipient": "0xabc"}"#,
            br#"{"amount": -1.5, "recipient": "0xabc"}"#,
            br#"{"amount": 1.5, "recipient": ""}"#,
        ];
        for body in bodies {
            let response = handle(&intake, RequestKind::Redeem, body).await;
            assert_eq!(response.status, 400);
            assert_eq!(response.body, json!({ "error": INVALID_PAYLOAD }));
        }

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn intake_failure_is_an_internal_error() {
        let store = InMemoryRequestStore::new();
        let intake = intake(
            &store,
            Arc::new(FailingLauncher::new(LaunchError::Log("log unavailable".into()))),
        );

        let response = handle(
            &intake,
            RequestKind::Mint,
            br#"{"amount": 1, "recipient": "0xabc"}"#,
        )
        .await;

        assert_eq!(response.status, 500);
        assert_eq!(
            response.body,
            json!({ "error": "execution log error: log unavailable" })
        );
    }

    #[tokio::test]
    async fn status_lookup() {
        let store = InMemoryRequestStore::new();
        let request =
            settlement_testing::helpers::pending_request(RequestKind::Mint, 1050, "0xabc");
        store.create(request.clone()).await.unwrap();

        let found = status(&store, &request.id.to_string()).await;
        assert_eq!(found.status, 200);
        assert_eq!(found.body["amount"], "10.50");
        assert_eq!(found.body["status"], "pending");
        assert_eq!(found.body["run_id"], Value::Null);

        let missing = status(&store, &RequestId::new().to_string()).await;
        assert_eq!(missing.status, 404);

        let bad = status(&store, "not-a-uuid").await;
        assert_eq!(bad.status, 400);
    }

    #[tokio::test]
    async fn dispatch_routes_by_operation() {
        let store = InMemoryRequestStore::new();
        let intake = intake(&store, Arc::new(RecordingLauncher::new()));

        let submitted = dispatch(
            &intake,
            &store,
            br#"{"operation": "redeem", "amount": 2.5, "recipient": "0xabc"}"#,
        )
        .await;
        assert_eq!(submitted.status, 200);

        let id = submitted.body["id"].as_str().unwrap();
        let line = format!(r#"{{"operation": "status", "id": "{id}"}}"#);
        let looked_up = dispatch(&intake, &store, line.as_bytes()).await;
        assert_eq!(looked_up.status, 200);
        assert_eq!(looked_up.body["kind"], "redeem");
        assert_eq!(looked_up.body["status"], "started");

        let unknown = dispatch(&intake, &store, br#"{"operation": "burn"}"#).await;
        assert_eq!(unknown.status, 400);
        let no_id = dispatch(&intake, &store, br#"{"operation": "status"}"#).await;
        assert_eq!(no_id.status, 400);
    }
}
