use std::sync::Arc;
use axum::{extract::{Extension, State}, Json};
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;
use wiremock::{Mock, MockServer, ResponseTemplate};
use wiremock::matchers::{body_string_contains, method, path, query_param};

use booking_cell::handlers;
use booking_cell::models::CreateBookingRequest;
use booking_cell::state::BookingState;
use payment_gateway_cell::{GatewayProvider, PaymentProof};
use shared_models::auth::User;
use shared_models::error::AppError;
use shared_utils::test_utils::{JwtTestUtils, MockSupabaseResponses, TestConfig, TestUser};

fn test_state(mock_server: &MockServer) -> Arc<BookingState> {
    let config = TestConfig::with_base_url(&mock_server.uri());
    Arc::new(BookingState::new(config.to_arc()))
}

fn auth_header(user: &TestUser) -> TypedHeader<Authorization<Bearer>> {
    let token = JwtTestUtils::create_test_token(
        user,
        "test-secret-key-for-jwt-validation-must-be-long-enough",
        Some(1),
    );
    TypedHeader(Authorization::bearer(&token).unwrap())
}

fn user_extension(user: &TestUser) -> Extension<User> {
    Extension(user.to_user())
}

/// Lock acquire/release plus detached notification and audit writes.
async fn mount_ambient_mocks(mock_server: &MockServer) {
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

fn sign_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(message);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[tokio::test]
async fn free_slot_creates_pending_booking() {
    let mock_server = MockServer::start().await;
    mount_ambient_mocks(&mock_server).await;

    let user = TestUser::patient("pat@example.com");
    let slot_id = Uuid::new_v4().to_string();
    let clinic_id = Uuid::new_v4().to_string();
    let doctor_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/slots"))
        .and(query_param("id", format!("eq.{}", slot_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::slot_response(&slot_id, &clinic_id, &doctor_id, "free", 0)
        ])))
        .mount(&mock_server)
        .await;

    // No competing claims on the slot
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let appointment_id = Uuid::new_v4().to_string();
    Mock::given(method("POST"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([
            MockSupabaseResponses::appointment_response(
                &appointment_id, &user.id, &slot_id, "pending", "not_required"
            )
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let request = CreateBookingRequest {
        slot_id: slot_id.parse().unwrap(),
        payment_method: None,
        provider: None,
        reschedule_from_slot_id: None,
    };

    let result = handlers::create_booking(
        State(test_state(&mock_server)),
        auth_header(&user),
        user_extension(&user),
        Json(request),
    )
    .await;

    let Json(body) = result.expect("free booking should succeed");
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["booking"]["status"], json!("pending"));
    assert_eq!(body["booking"]["payment_mode"], json!("free"));
}

#[tokio::test]
async fn conflicting_payment_method_is_rejected_without_writes() {
    let mock_server = MockServer::start().await;

    let user = TestUser::patient("pat@example.com");
    let slot_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::slot_response(
                &slot_id,
                &Uuid::new_v4().to_string(),
                &Uuid::new_v4().to_string(),
                "online",
                50000
            )
        ])))
        .mount(&mock_server)
        .await;

    // The mismatch must be caught before any lock or insert happens
    Mock::given(method("POST"))
        .and(path("/rest/v1/booking_locks"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let request = json!({
        "slot_id": slot_id,
        "payment_method": "offline"
    });

    let result = handlers::create_booking(
        State(test_state(&mock_server)),
        auth_header(&user),
        user_extension(&user),
        Json(serde_json::from_value(request).unwrap()),
    )
    .await;

    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn online_booking_requires_plan_entitlement() {
    let mock_server = MockServer::start().await;

    let user = TestUser::patient("pat@example.com");
    let slot_id = Uuid::new_v4().to_string();
    let clinic_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::slot_response(
                &slot_id,
                &clinic_id,
                &Uuid::new_v4().to_string(),
                "online",
                50000
            )
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/clinic_plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::plan_response(&clinic_id, false)
        ])))
        .mount(&mock_server)
        .await;

    // Gate fires before the hold machinery is touched
    Mock::given(method("POST"))
        .and(path("/rest/v1/booking_locks"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let request = CreateBookingRequest {
        slot_id: slot_id.parse().unwrap(),
        payment_method: None,
        provider: None,
        reschedule_from_slot_id: None,
    };

    let result = handlers::create_booking(
        State(test_state(&mock_server)),
        auth_header(&user),
        user_extension(&user),
        Json(request),
    )
    .await;

    match result {
        Err(AppError::ForbiddenDetailed(msg, details)) => {
            assert!(msg.contains("not enabled"), "unexpected message: {}", msg);
            let modes = details["available_modes"]
                .as_array()
                .expect("refusal should carry the fallback modes");
            assert!(modes.contains(&json!("offline")), "modes: {:?}", modes);
        }
        other => panic!("expected Forbidden, got {:?}", other.map(|Json(v)| v)),
    }
}

#[tokio::test]
async fn online_booking_creates_hold_and_gateway_order() {
    let mock_server = MockServer::start().await;
    mount_ambient_mocks(&mock_server).await;

    let user = TestUser::patient("pat@example.com");
    let slot_id = Uuid::new_v4().to_string();
    let clinic_id = Uuid::new_v4().to_string();
    let doctor_id = Uuid::new_v4().to_string();
    let appointment_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::slot_response(&slot_id, &clinic_id, &doctor_id, "online", 50000)
        ])))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/clinic_plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::plan_response(&clinic_id, true)
        ])))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/payment_gateways"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::gateway_credentials_response(&clinic_id, "razorpay")
        ])))
        .mount(&mock_server)
        .await;

    // No existing claims; the insert returns the hold row
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;
    let mut hold_row = MockSupabaseResponses::appointment_response(
        &appointment_id,
        &user.id,
        &slot_id,
        "pending_payment",
        "pending",
    );
    hold_row["amount"] = json!(50000);
    Mock::given(method("POST"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([hold_row.clone()])))
        .mount(&mock_server)
        .await;

    // Razorpay order creation
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .and(body_string_contains("booking_ref"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "order_live_1",
            "amount": 50000,
            "currency": "INR"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    // Attaching the order id returns the updated row
    let mut with_order = hold_row;
    with_order["provider"] = json!("razorpay");
    with_order["gateway_order_id"] = json!("order_live_1");
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([with_order])))
        .mount(&mock_server)
        .await;

    let request = CreateBookingRequest {
        slot_id: slot_id.parse().unwrap(),
        payment_method: None,
        provider: Some(GatewayProvider::Razorpay),
        reschedule_from_slot_id: None,
    };

    let result = handlers::create_booking(
        State(test_state(&mock_server)),
        auth_header(&user),
        user_extension(&user),
        Json(request),
    )
    .await;

    let Json(body) = result.expect("online booking should succeed");
    assert_eq!(body["booking"]["status"], json!("pending_payment"));
    assert_eq!(body["booking"]["order_id"], json!("order_live_1"));
    assert_eq!(body["booking"]["provider"], json!("razorpay"));
}

#[tokio::test]
async fn verify_payment_confirms_booking() {
    let mock_server = MockServer::start().await;
    mount_ambient_mocks(&mock_server).await;

    let user = TestUser::patient("pat@example.com");
    let slot_id = Uuid::new_v4().to_string();
    let appointment_id = Uuid::new_v4().to_string();

    let pending = MockSupabaseResponses::appointment_response(
        &appointment_id,
        &user.id,
        &slot_id,
        "pending_payment",
        "pending",
    );
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("id", format!("eq.{}", appointment_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([pending.clone()])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/clinic_plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::plan_response(pending["clinic_id"].as_str().unwrap(), true)
        ])))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/payment_gateways"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::gateway_credentials_response(
                pending["clinic_id"].as_str().unwrap(),
                "razorpay"
            )
        ])))
        .mount(&mock_server)
        .await;

    // Guarded confirm returns the moved row
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
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/slots"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/payments"))
        .and(body_string_contains("pay_123"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&mock_server)
        .await;

    let signature = sign_hex("rzp_test_secret", b"order_abc|pay_123");
    let request = booking_cell::models::VerifyPaymentRequest {
        appointment_id: appointment_id.parse().unwrap(),
        proof: PaymentProof::Razorpay {
            order_id: "order_abc".to_string(),
            payment_id: "pay_123".to_string(),
            signature,
        },
    };

    let result = handlers::verify_payment(
        State(test_state(&mock_server)),
        auth_header(&user),
        user_extension(&user),
        Json(request),
    )
    .await;

    let Json(body) = result.expect("verification should succeed");
    assert_eq!(body["booking"]["status"], json!("confirmed"));
    assert_eq!(body["booking"]["payment_status"], json!("paid"));
}

/// The webhook beat the client here: the guarded PATCH matches nothing,
/// the current row is already confirmed, and the caller gets a clean no-op.
#[tokio::test]
async fn verify_losing_the_race_is_a_noop() {
    let mock_server = MockServer::start().await;
    mount_ambient_mocks(&mock_server).await;

    let user = TestUser::patient("pat@example.com");
    let slot_id = Uuid::new_v4().to_string();
    let appointment_id = Uuid::new_v4().to_string();

    let pending = MockSupabaseResponses::appointment_response(
        &appointment_id,
        &user.id,
        &slot_id,
        "pending_payment",
        "pending",
    );
    // First read still sees the pending row
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([pending.clone()])))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    // Post-PATCH classification read sees it confirmed
    let mut confirmed = pending.clone();
    confirmed["status"] = json!("confirmed");
    confirmed["payment_status"] = json!("paid");
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([confirmed])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/clinic_plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::plan_response(pending["clinic_id"].as_str().unwrap(), true)
        ])))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/payment_gateways"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::gateway_credentials_response(
                pending["clinic_id"].as_str().unwrap(),
                "razorpay"
            )
        ])))
        .mount(&mock_server)
        .await;

    // Guarded confirm misses; the other path already moved the row
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;
    // The loser writes nothing further
    Mock::given(method("POST"))
        .and(path("/rest/v1/payments"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/slots"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&mock_server)
        .await;

    let signature = sign_hex("rzp_test_secret", b"order_abc|pay_123");
    let request = booking_cell::models::VerifyPaymentRequest {
        appointment_id: appointment_id.parse().unwrap(),
        proof: PaymentProof::Razorpay {
            order_id: "order_abc".to_string(),
            payment_id: "pay_123".to_string(),
            signature,
        },
    };

    let result = handlers::verify_payment(
        State(test_state(&mock_server)),
        auth_header(&user),
        user_extension(&user),
        Json(request),
    )
    .await;

    let Json(body) = result.expect("losing the race is still a success");
    assert_eq!(body["booking"]["status"], json!("confirmed"));
    assert!(body["booking"]["message"]
        .as_str()
        .unwrap()
        .contains("already"));
}

/// Coming back after the payment window closed is a client error: the hold
/// is marked failed and the caller gets a 400, not a conflict.
#[tokio::test]
async fn verify_after_hold_expiry_is_a_bad_request() {
    let mock_server = MockServer::start().await;
    mount_ambient_mocks(&mock_server).await;

    let user = TestUser::patient("pat@example.com");
    let appointment_id = Uuid::new_v4().to_string();

    let mut lapsed = MockSupabaseResponses::appointment_response(
        &appointment_id,
        &user.id,
        &Uuid::new_v4().to_string(),
        "pending_payment",
        "pending",
    );
    lapsed["payment_expiry"] =
        json!((chrono::Utc::now() - chrono::Duration::minutes(5)).to_rfc3339());
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([lapsed])))
        .mount(&mock_server)
        .await;

    // The guarded failure mark is the only write
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("status", "in.(pending,pending_payment)"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/payments"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let request = booking_cell::models::VerifyPaymentRequest {
        appointment_id: appointment_id.parse().unwrap(),
        proof: PaymentProof::Razorpay {
            order_id: "order_abc".to_string(),
            payment_id: "pay_123".to_string(),
            signature: sign_hex("rzp_test_secret", b"order_abc|pay_123"),
        },
    };

    let result = handlers::verify_payment(
        State(test_state(&mock_server)),
        auth_header(&user),
        user_extension(&user),
        Json(request),
    )
    .await;

    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn tampered_proof_marks_payment_failed() {
    let mock_server = MockServer::start().await;
    mount_ambient_mocks(&mock_server).await;

    let user = TestUser::patient("pat@example.com");
    let slot_id = Uuid::new_v4().to_string();
    let appointment_id = Uuid::new_v4().to_string();

    let pending = MockSupabaseResponses::appointment_response(
        &appointment_id,
        &user.id,
        &slot_id,
        "pending_payment",
        "pending",
    );
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([pending.clone()])))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/clinic_plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::plan_response(pending["clinic_id"].as_str().unwrap(), true)
        ])))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/payment_gateways"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::gateway_credentials_response(
                pending["clinic_id"].as_str().unwrap(),
                "razorpay"
            )
        ])))
        .mount(&mock_server)
        .await;

    // Only the guarded failure mark may write; no confirm, no ledger row
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("status", "in.(pending,pending_payment)"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/payments"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let request = booking_cell::models::VerifyPaymentRequest {
        appointment_id: appointment_id.parse().unwrap(),
        proof: PaymentProof::Razorpay {
            order_id: "order_abc".to_string(),
            payment_id: "pay_123".to_string(),
            signature: sign_hex("wrong_secret", b"order_abc|pay_123"),
        },
    };

    let result = handlers::verify_payment(
        State(test_state(&mock_server)),
        auth_header(&user),
        user_extension(&user),
        Json(request),
    )
    .await;

    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn verify_rejects_foreign_appointment() {
    let mock_server = MockServer::start().await;

    let owner = TestUser::patient("owner@example.com");
    let intruder = TestUser::patient("intruder@example.com");
    let appointment_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::appointment_response(
                &appointment_id,
                &owner.id,
                &Uuid::new_v4().to_string(),
                "pending_payment",
                "pending"
            )
        ])))
        .mount(&mock_server)
        .await;

    let request = booking_cell::models::VerifyPaymentRequest {
        appointment_id: appointment_id.parse().unwrap(),
        proof: PaymentProof::Razorpay {
            order_id: "order_abc".to_string(),
            payment_id: "pay_123".to_string(),
            signature: "00".to_string(),
        },
    };

    let result = handlers::verify_payment(
        State(test_state(&mock_server)),
        auth_header(&intruder),
        user_extension(&intruder),
        Json(request),
    )
    .await;

    assert!(matches!(result, Err(AppError::Forbidden(_))));
}
