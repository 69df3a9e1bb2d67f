//! HTTP settlement client against a mock provider.

#![allow(clippy::expect_used)]

use mint_redeem::provider::HttpSettlementClient;
use serde_json::json;
use settlement_core::{Amount, SettlementClient};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "9b2d4c1e-8f7a-4e3b-a1c2-3d4e5f6a7b8c";

fn amount() -> Amount {
    Amount::from_minor_units(1050).expect("positive")
}

async fn client_for(server: &MockServer) -> HttpSettlementClient {
    HttpSettlementClient::new(server.uri(), "test-jwt", Duration::from_secs(5))
        .expect("client should build")
}

#[tokio::test]
async fn mint_posts_the_order_with_auth_and_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mints"))
        .and(header("authorization", "Bearer test-jwt"))
        .and(header("idempotency-key", KEY))
        .and(body_json(json!({
            "amount": "10.50",
            "recipient": "0xnotdeadbeef",
            "type": "mint",
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "data": {
                "id": "order-1",
                "type": "order",
                "attributes": {
                    "created": "2025-01-01T00:00:00Z",
                    "status": "pending",
                    "type": "mint",
                    "updated": "2025-01-01T00:00:00Z"
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client_for(&server)
        .await
        .mint(amount(), "0xnotdeadbeef", KEY)
        .await
        .expect("provider should accept");

    assert!(!response.is_rejected());
    let order = response.data.expect("order returned");
    assert_eq!(order.id, "order-1");
    assert_eq!(order.attributes.status, "pending");
}

#[tokio::test]
async fn redeem_posts_to_the_redeem_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/redeems"))
        .and(body_json(json!({
            "amount": "10.50",
            "recipient": "0xabc",
            "type": "redeem",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"id": "order-2", "type": "order", "attributes": {"status": "pending"}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client_for(&server)
        .await
        .redeem(amount(), "0xabc", KEY)
        .await
        .expect("provider should accept");

    assert_eq!(response.data.expect("order returned").id, "order-2");
}

#[tokio::test]
async fn client_error_envelope_is_a_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mints"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": [{
                "code": "ValidationError",
                "detail": "An error occurred with the request data.",
                "id": "error123",
                "status": "400",
                "title": "A validation error occurred",
                "source": {"parameter": "page[cursor]", "pointer": "/body/data/attributes"}
            }]
        })))
        .mount(&server)
        .await;

    let response = client_for(&server)
        .await
        .mint(amount(), "0xdeadbeef", KEY)
        .await
        .expect("a rejection is a response, not a transport failure");

    assert!(response.is_rejected());
    assert_eq!(response.errors[0].detail, "An error occurred with the request data.");
}

#[tokio::test]
async fn server_error_is_a_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .await
        .mint(amount(), "0xabc", KEY)
        .await
        .expect_err("5xx is not a provider answer");

    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn client_error_without_entries_is_a_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({})))
        .mount(&server)
        .await;

    let result = client_for(&server).await.mint(amount(), "0xabc", KEY).await;

    assert!(result.is_err());
}

#[tokio::test]
async fn undecodable_body_is_a_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let result = client_for(&server).await.redeem(amount(), "0xabc", KEY).await;

    assert!(result.is_err());
}
