use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;

pub struct TestConfig {
    pub jwt_secret: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub razorpay_api_base: String,
    pub cashfree_api_base: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "test-secret-key-for-jwt-validation-must-be-long-enough".to_string(),
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            razorpay_api_base: "http://localhost:54322".to_string(),
            cashfree_api_base: "http://localhost:54323".to_string(),
        }
    }
}

impl TestConfig {
    /// Point every backend at the same mock server, the common case in
    /// handler tests.
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            supabase_url: base_url.to_string(),
            razorpay_api_base: base_url.to_string(),
            cashfree_api_base: base_url.to_string(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_service_role_key: "test-service-role-key".to_string(),
            supabase_jwt_secret: self.jwt_secret.clone(),
            razorpay_api_base: self.razorpay_api_base.clone(),
            cashfree_api_base: self.cashfree_api_base.clone(),
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestUser {
    pub id: String,
    pub email: String,
    pub role: String,
}

impl Default for TestUser {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: "test@example.com".to_string(),
            role: "patient".to_string(),
        }
    }
}

impl TestUser {
    pub fn new(email: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            role: role.to_string(),
        }
    }

    pub fn patient(email: &str) -> Self {
        Self::new(email, "patient")
    }

    pub fn clinic_admin(email: &str) -> Self {
        Self::new(email, "clinic_admin")
    }

    pub fn admin(email: &str) -> Self {
        Self::new(email, "admin")
    }

    pub fn to_user(&self) -> User {
        User {
            id: self.id.clone(),
            email: Some(self.email.clone()),
            role: Some(self.role.clone()),
            metadata: None,
            created_at: Some(Utc::now()),
        }
    }
}

pub struct JwtTestUtils;

impl JwtTestUtils {
    pub fn create_test_token(user: &TestUser, secret: &str, exp_hours: Option<i64>) -> String {
        let now = Utc::now();
        let exp = now + Duration::hours(exp_hours.unwrap_or(24));

        let header = json!({
            "alg": "HS256",
            "typ": "JWT"
        });

        let payload = json!({
            "sub": user.id,
            "email": user.email,
            "role": user.role,
            "iat": now.timestamp(),
            "exp": exp.timestamp()
        });

        let header_encoded = general_purpose::URL_SAFE_NO_PAD.encode(header.to_string());
        let payload_encoded = general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());

        let signing_input = format!("{}.{}", header_encoded, payload_encoded);

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_encoded = general_purpose::URL_SAFE_NO_PAD.encode(signature);

        format!("{}.{}", signing_input, signature_encoded)
    }

    pub fn create_expired_token(user: &TestUser, secret: &str) -> String {
        Self::create_test_token(user, secret, Some(-1))
    }

    pub fn create_invalid_signature_token(user: &TestUser) -> String {
        Self::create_test_token(user, "wrong-secret", Some(24))
    }

    pub fn create_malformed_token() -> String {
        "invalid.token.format".to_string()
    }
}

/// Canned PostgREST rows for the booking tables.
pub struct MockSupabaseResponses;

impl MockSupabaseResponses {
    pub fn slot_response(
        slot_id: &str,
        clinic_id: &str,
        doctor_id: &str,
        payment_mode: &str,
        amount: i64,
    ) -> serde_json::Value {
        json!({
            "id": slot_id,
            "clinic_id": clinic_id,
            "doctor_id": doctor_id,
            "slot_date": "2026-09-15",
            "start_time": "10:00:00",
            "end_time": "10:30:00",
            "payment_mode": payment_mode,
            "amount": amount,
            "kind": "appointment",
            "is_booked": false,
            "deleted_at": null,
            "created_at": "2026-09-01T00:00:00Z"
        })
    }

    pub fn appointment_response(
        appointment_id: &str,
        patient_id: &str,
        slot_id: &str,
        status: &str,
        payment_status: &str,
    ) -> serde_json::Value {
        json!({
            "id": appointment_id,
            "patient_id": patient_id,
            "slot_id": slot_id,
            "clinic_id": Uuid::new_v4(),
            "doctor_id": Uuid::new_v4(),
            "status": status,
            "payment_status": payment_status,
            "payment_mode": "online",
            "amount": 500,
            "provider": null,
            "gateway_order_id": null,
            "payment_session_id": null,
            "payment_expiry": null,
            "reschedule_from_slot_id": null,
            "deleted_at": null,
            "created_at": Utc::now().to_rfc3339(),
            "updated_at": Utc::now().to_rfc3339()
        })
    }

    pub fn plan_response(clinic_id: &str, allow_online_payments: bool) -> serde_json::Value {
        json!({
            "clinic_id": clinic_id,
            "plan_name": if allow_online_payments { "pro" } else { "basic" },
            "allow_online_payments": allow_online_payments,
            "status": "active"
        })
    }

    pub fn gateway_credentials_response(clinic_id: &str, provider: &str) -> serde_json::Value {
        json!({
            "clinic_id": clinic_id,
            "provider": provider,
            "api_key": "rzp_test_key",
            "api_secret": "rzp_test_secret",
            "webhook_secret": "whsec_test",
            "is_active": true
        })
    }

    pub fn error_response(message: &str, code: &str) -> serde_json::Value {
        json!({
            "error": {
                "message": message,
                "code": code
            }
        })
    }
}
