use std::collections::BTreeMap;
use std::time::Duration;

use httpmock::prelude::*;
use recurring_billing::billing::{
    ChargeRequest, GatewayError, GatewayPaymentStatus, HttpPaymentGateway, PaymentGateway,
};
use serde_json::json;
use uuid::Uuid;

fn charge(idempotency_key: Uuid) -> ChargeRequest {
    let mut metadata = BTreeMap::new();
    metadata.insert("billing_run_id".to_string(), idempotency_key.to_string());
    ChargeRequest {
        idempotency_key,
        amount: 2500,
        currency: "usd".to_string(),
        customer_ref: Some("cus_123".to_string()),
        payment_method_ref: Some("pm_123".to_string()),
        metadata,
    }
}

#[tokio::test]
async fn http_gateway_creates_confirmed_payment_intents() {
    let server = MockServer::start_async().await;
    let key = Uuid::new_v4();

    let intent_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/payment_intents")
            .header("authorization", "Bearer sk_test")
            .header("Idempotency-Key", key.to_string())
            .json_body_partial(
                r#"{"amount":2500,"currency":"usd","customer":"cus_123","payment_method":"pm_123","confirm":true}"#,
            );
        then.status(200).json_body(json!({
            "id": "pi_123",
            "status": "processing",
            "created": 1714550400,
        }));
    });

    let gateway =
        HttpPaymentGateway::new(server.base_url(), "sk_test", Duration::from_secs(2)).unwrap();
    let result = gateway.create_and_confirm_charge(&charge(key)).await.unwrap();

    assert_eq!(result.id, "pi_123");
    assert_eq!(result.status, GatewayPaymentStatus::Processing);
    assert_eq!(result.created.timestamp(), 1714550400);
    intent_mock.assert();
}

#[tokio::test]
async fn http_gateway_surfaces_rejections() {
    let server = MockServer::start_async().await;
    let declined = server.mock(|when, then| {
        when.method(POST).path("/v1/payment_intents");
        then.status(402).body(r#"{"error":"card_declined"}"#);
    });

    let gateway =
        HttpPaymentGateway::new(server.base_url(), "sk_test", Duration::from_secs(2)).unwrap();
    let err = gateway
        .create_and_confirm_charge(&charge(Uuid::new_v4()))
        .await
        .unwrap_err();

    match err {
        GatewayError::Rejected { status, body } => {
            assert_eq!(status, 402);
            assert!(body.contains("card_declined"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    declined.assert();
}

#[tokio::test]
async fn http_gateway_requires_gateway_references() {
    let server = MockServer::start_async().await;
    let never_called = server.mock(|when, then| {
        when.method(POST).path("/v1/payment_intents");
        then.status(200);
    });

    let gateway =
        HttpPaymentGateway::new(server.base_url(), "sk_test", Duration::from_secs(2)).unwrap();
    let mut request = charge(Uuid::new_v4());
    request.payment_method_ref = None;

    let err = gateway.create_and_confirm_charge(&request).await.unwrap_err();
    assert!(matches!(err, GatewayError::MissingPaymentMethod));
    never_called.assert_hits(0);
}
