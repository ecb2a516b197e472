use std::sync::Arc;
use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;
use wiremock::{Mock, MockServer, ResponseTemplate};
use wiremock::matchers::{method, path, query_param};

use booking_cell::handlers;
use booking_cell::state::BookingState;
use shared_models::error::AppError;
use shared_utils::test_utils::{MockSupabaseResponses, TestConfig};

fn test_state(mock_server: &MockServer) -> Arc<BookingState> {
    let config = TestConfig::with_base_url(&mock_server.uri());
    Arc::new(BookingState::new(config.to_arc()))
}

fn sign_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(message);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn sign_base64(secret: &str, message: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(message);
    BASE64.encode(mac.finalize().into_bytes())
}

fn razorpay_payload(order_id: &str, payment_id: &str) -> serde_json::Value {
    json!({
        "event": "payment.captured",
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "order_id": order_id,
                    "notes": {}
                }
            }
        }
    })
}

fn razorpay_headers(signature: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-razorpay-signature", signature.parse().unwrap());
    headers
}

async fn mount_confirmation_mocks(mock_server: &MockServer, pending: &serde_json::Value) {
    let order_id = pending["gateway_order_id"].as_str().unwrap().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("gateway_order_id", format!("eq.{}", order_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([pending])))
        .mount(mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/booking_locks"))
        .respond_with(ResponseTemplate::new(201))
        .mount(mock_server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/rest/v1/booking_locks"))
        .respond_with(ResponseTemplate::new(204))
        .mount(mock_server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/slots"))
        .respond_with(ResponseTemplate::new(204))
        .mount(mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/notifications"))
        .respond_with(ResponseTemplate::new(201))
        .mount(mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/audit_log"))
        .respond_with(ResponseTemplate::new(201))
        .mount(mock_server)
        .await;
}

async fn mount_razorpay_credentials(mock_server: &MockServer, clinic_id: &str) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/payment_gateways"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::gateway_credentials_response(clinic_id, "razorpay")
        ])))
        .mount(mock_server)
        .await;
}

fn pending_appointment(order_id: &str) -> serde_json::Value {
    let mut row = MockSupabaseResponses::appointment_response(
        &Uuid::new_v4().to_string(),
        &Uuid::new_v4().to_string(),
        &Uuid::new_v4().to_string(),
        "pending_payment",
        "pending",
    );
    row["provider"] = json!("razorpay");
    row["gateway_order_id"] = json!(order_id);
    row
}

#[tokio::test]
async fn verified_webhook_confirms_appointment() {
    let mock_server = MockServer::start().await;
    let pending = pending_appointment("order_wh_1");
    mount_confirmation_mocks(&mock_server, &pending).await;
    mount_razorpay_credentials(&mock_server, pending["clinic_id"].as_str().unwrap()).await;

    let mut confirmed = pending.clone();
    confirmed["status"] = json!("confirmed");
    confirmed["payment_status"] = json!("paid");
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("status", "in.(pending,pending_payment)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([confirmed])))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/payments"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&mock_server)
        .await;

    let body = serde_json::to_vec(&razorpay_payload("order_wh_1", "pay_wh_1")).unwrap();
    let signature = sign_hex("whsec_test", &body);

    let result = handlers::gateway_webhook(
        State(test_state(&mock_server)),
        AxumPath("razorpay".to_string()),
        razorpay_headers(&signature),
        Bytes::from(body),
    )
    .await;

    let axum::Json(response) = result.expect("webhook should process");
    assert_eq!(response["status"], json!("processed"));
}

/// A redelivery that wins the guarded PATCH but finds the ledger row
/// already written: the unique-key 409 is swallowed, one payment row total.
#[tokio::test]
async fn existing_ledger_row_does_not_fail_the_webhook() {
    let mock_server = MockServer::start().await;
    let pending = pending_appointment("order_wh_4");
    mount_confirmation_mocks(&mock_server, &pending).await;
    mount_razorpay_credentials(&mock_server, pending["clinic_id"].as_str().unwrap()).await;

    let mut confirmed = pending.clone();
    confirmed["status"] = json!("confirmed");
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([confirmed])))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/payments"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "23505",
            "message": "duplicate key value violates unique constraint"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let body = serde_json::to_vec(&razorpay_payload("order_wh_4", "pay_wh_4")).unwrap();
    let signature = sign_hex("whsec_test", &body);

    let result = handlers::gateway_webhook(
        State(test_state(&mock_server)),
        AxumPath("razorpay".to_string()),
        razorpay_headers(&signature),
        Bytes::from(body),
    )
    .await;

    let axum::Json(response) = result.expect("replayed ledger insert is tolerated");
    assert_eq!(response["status"], json!("processed"));
}

#[tokio::test]
async fn replayed_webhook_acknowledges_as_duplicate() {
    let mock_server = MockServer::start().await;
    let mut confirmed = pending_appointment("order_wh_2");
    confirmed["status"] = json!("confirmed");
    confirmed["payment_status"] = json!("paid");
    mount_confirmation_mocks(&mock_server, &confirmed).await;
    mount_razorpay_credentials(&mock_server, confirmed["clinic_id"].as_str().unwrap()).await;

    // Nothing to write on a replay
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&mock_server)
        .await;

    let body = serde_json::to_vec(&razorpay_payload("order_wh_2", "pay_wh_2")).unwrap();
    let signature = sign_hex("whsec_test", &body);

    let result = handlers::gateway_webhook(
        State(test_state(&mock_server)),
        AxumPath("razorpay".to_string()),
        razorpay_headers(&signature),
        Bytes::from(body),
    )
    .await;

    let axum::Json(response) = result.expect("replay should be acknowledged");
    assert_eq!(response["status"], json!("duplicate"));
}

#[tokio::test]
async fn unverifiable_webhook_is_rejected_before_any_write() {
    let mock_server = MockServer::start().await;
    let pending = pending_appointment("order_wh_3");
    mount_confirmation_mocks(&mock_server, &pending).await;
    mount_razorpay_credentials(&mock_server, pending["clinic_id"].as_str().unwrap()).await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/payments"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let body = serde_json::to_vec(&razorpay_payload("order_wh_3", "pay_wh_3")).unwrap();
    let signature = sign_hex("not_the_secret", &body);

    let result = handlers::gateway_webhook(
        State(test_state(&mock_server)),
        AxumPath("razorpay".to_string()),
        razorpay_headers(&signature),
        Bytes::from(body),
    )
    .await;

    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

/// The payment landed after the hold lapsed. The row is still findable
/// (the sweeper only soft-deletes later), but the slot may already carry
/// another patient's hold, so the delivery must not confirm anything.
#[tokio::test]
async fn late_webhook_for_lapsed_hold_is_ignored() {
    let mock_server = MockServer::start().await;

    let mut lapsed = pending_appointment("order_wh_5");
    lapsed["payment_status"] = json!("failed");
    lapsed["payment_expiry"] =
        json!((chrono::Utc::now() - chrono::Duration::minutes(20)).to_rfc3339());
    mount_confirmation_mocks(&mock_server, &lapsed).await;
    mount_razorpay_credentials(&mock_server, lapsed["clinic_id"].as_str().unwrap()).await;

    // No resurrection: the row does not move and no ledger entry is written
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/payments"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let body = serde_json::to_vec(&razorpay_payload("order_wh_5", "pay_wh_5")).unwrap();
    let signature = sign_hex("whsec_test", &body);

    let result = handlers::gateway_webhook(
        State(test_state(&mock_server)),
        AxumPath("razorpay".to_string()),
        razorpay_headers(&signature),
        Bytes::from(body),
    )
    .await;

    let axum::Json(response) = result.expect("late delivery is acknowledged");
    assert_eq!(response["status"], json!("ignored"));
}

#[tokio::test]
async fn webhook_for_unknown_order_is_ignored() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let body = serde_json::to_vec(&razorpay_payload("order_unknown", "pay_x")).unwrap();
    let signature = sign_hex("whsec_test", &body);

    let result = handlers::gateway_webhook(
        State(test_state(&mock_server)),
        AxumPath("razorpay".to_string()),
        razorpay_headers(&signature),
        Bytes::from(body),
    )
    .await;

    let axum::Json(response) = result.expect("unknown order is acknowledged");
    assert_eq!(response["status"], json!("ignored"));
}

#[tokio::test]
async fn non_payment_events_are_ignored_without_lookups() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let body = serde_json::to_vec(&json!({ "event": "refund.processed" })).unwrap();

    let result = handlers::gateway_webhook(
        State(test_state(&mock_server)),
        AxumPath("razorpay".to_string()),
        HeaderMap::new(),
        Bytes::from(body),
    )
    .await;

    let axum::Json(response) = result.expect("irrelevant events are acknowledged");
    assert_eq!(response["status"], json!("ignored"));
}

#[tokio::test]
async fn cashfree_webhook_verifies_timestamped_signature() {
    let mock_server = MockServer::start().await;

    let mut pending = pending_appointment("order_cf_1");
    pending["provider"] = json!("cashfree");
    mount_confirmation_mocks(&mock_server, &pending).await;

    // Cashfree credentials instead of the default Razorpay fixture
    Mock::given(method("GET"))
        .and(path("/rest/v1/payment_gateways"))
        .and(query_param("provider", "eq.cashfree"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "clinic_id": pending["clinic_id"],
            "provider": "cashfree",
            "api_key": "cf_key",
            "api_secret": "cf_secret",
            "webhook_secret": null,
            "is_active": true
        }])))
        .mount(&mock_server)
        .await;

    let mut confirmed = pending.clone();
    confirmed["status"] = json!("confirmed");
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([confirmed])))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/payments"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&mock_server)
        .await;

    let payload = json!({
        "type": "PAYMENT_SUCCESS_WEBHOOK",
        "data": {
            "order": { "order_id": "order_cf_1", "order_tags": {} },
            "payment": { "cf_payment_id": 424242 }
        }
    });
    let body = serde_json::to_vec(&payload).unwrap();

    let timestamp = "1700000000";
    let mut message = timestamp.as_bytes().to_vec();
    message.extend_from_slice(&body);
    let signature = sign_base64("cf_secret", &message);

    let mut headers = HeaderMap::new();
    headers.insert("x-webhook-signature", signature.parse().unwrap());
    headers.insert("x-webhook-timestamp", timestamp.parse().unwrap());

    let result = handlers::gateway_webhook(
        State(test_state(&mock_server)),
        AxumPath("cashfree".to_string()),
        headers,
        Bytes::from(body),
    )
    .await;

    let axum::Json(response) = result.expect("cashfree webhook should process");
    assert_eq!(response["status"], json!("processed"));
}

#[tokio::test]
async fn unknown_provider_is_not_found() {
    let mock_server = MockServer::start().await;

    let result = handlers::gateway_webhook(
        State(test_state(&mock_server)),
        AxumPath("stripe".to_string()),
        HeaderMap::new(),
        Bytes::from_static(b"{}"),
    )
    .await;

    assert!(matches!(result, Err(AppError::NotFound(_))));
}
