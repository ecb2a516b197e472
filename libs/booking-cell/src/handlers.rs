// libs/booking-cell/src/handlers.rs
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Extension, Json,
};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use payment_gateway_cell::GatewayProvider;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{BookingError, CreateBookingRequest, VerifyPaymentRequest, WebhookOutcome};
use crate::services::{BookingService, WebhookReconciler};
use crate::state::BookingState;

#[axum::debug_handler]
pub async fn create_booking(
    State(state): State<Arc<BookingState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateBookingRequest>,
) -> Result<Json<Value>, AppError> {
    let patient_id = parse_user_id(&user)?;

    let service = BookingService::new(state);
    let response = service
        .create_booking(patient_id, request, auth.token())
        .await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": response,
    })))
}

#[axum::debug_handler]
pub async fn verify_payment(
    State(state): State<Arc<BookingState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<VerifyPaymentRequest>,
) -> Result<Json<Value>, AppError> {
    let patient_id = parse_user_id(&user)?;

    let service = BookingService::new(state);
    let response = service
        .verify_payment(patient_id, request, auth.token())
        .await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": response,
    })))
}

/// Provider webhooks. No session; authenticity comes from the signature
/// check inside the reconciler, which needs the raw body bytes exactly as
/// delivered.
#[axum::debug_handler]
pub async fn gateway_webhook(
    State(state): State<Arc<BookingState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let provider = GatewayProvider::parse(&provider)
        .ok_or_else(|| AppError::NotFound(format!("Unknown payment provider: {}", provider)))?;

    let (signature, timestamp) = webhook_headers(provider, &headers);

    let reconciler = WebhookReconciler::new(state);
    let outcome = reconciler
        .handle(provider, &body, signature.as_deref(), timestamp.as_deref())
        .await
        .map_err(map_webhook_error)?;

    let status = match outcome {
        WebhookOutcome::Processed => "processed",
        WebhookOutcome::AlreadyProcessed => "duplicate",
        WebhookOutcome::Ignored => "ignored",
    };
    Ok(Json(json!({ "status": status })))
}

fn webhook_headers(
    provider: GatewayProvider,
    headers: &HeaderMap,
) -> (Option<String>, Option<String>) {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    match provider {
        GatewayProvider::Razorpay => (header_str("x-razorpay-signature"), None),
        GatewayProvider::Cashfree => (
            header_str("x-webhook-signature"),
            header_str("x-webhook-timestamp"),
        ),
    }
}

fn parse_user_id(user: &User) -> Result<Uuid, AppError> {
    Uuid::parse_str(&user.id).map_err(|_| AppError::Auth("Invalid user id in token".to_string()))
}

/// One place where domain failures pick their HTTP shape.
fn map_booking_error(e: BookingError) -> AppError {
    match e {
        BookingError::SlotNotFound | BookingError::AppointmentNotFound => {
            AppError::NotFound(e.to_string())
        }
        BookingError::AlreadyConfirmed
        | BookingError::SlotBlocked { .. }
        | BookingError::LockUnavailable => AppError::Conflict(e.to_string()),
        BookingError::PaymentModeMismatch { .. } => AppError::BadRequest(e.to_string()),
        BookingError::OnlinePaymentsNotAllowed { ref available_modes } => {
            let modes: Vec<String> = available_modes.iter().map(|m| m.to_string()).collect();
            AppError::ForbiddenDetailed(e.to_string(), json!({ "available_modes": modes }))
        }
        // The caller came back too late; a client error, not a conflict
        BookingError::HoldExpired => AppError::BadRequest(e.to_string()),
        BookingError::SignatureMismatch => AppError::BadRequest(e.to_string()),
        BookingError::NotAuthorized => AppError::Forbidden(e.to_string()),
        BookingError::InvalidWebhook(_) => AppError::BadRequest(e.to_string()),
        BookingError::Gateway(ref ge) => match ge {
            // Clinic-side misconfiguration, not a provider outage
            payment_gateway_cell::GatewayError::NotConfigured { .. } => {
                AppError::Internal(ge.to_string())
            }
            _ => AppError::ExternalService(ge.to_string()),
        },
        BookingError::Database(msg) => AppError::Database(msg),
    }
}

/// Webhook deliveries get less detail back: a signature failure is a flat
/// 400 so a probing sender learns nothing about our records.
fn map_webhook_error(e: BookingError) -> AppError {
    match e {
        BookingError::SignatureMismatch => {
            AppError::BadRequest("Webhook verification failed".to_string())
        }
        BookingError::InvalidWebhook(_) => AppError::BadRequest(e.to_string()),
        other => map_booking_error(other),
    }
}
