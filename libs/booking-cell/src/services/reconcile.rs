// libs/booking-cell/src/services/reconcile.rs
use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use payment_gateway_cell::{gateway_for, CredentialsStore, GatewayProvider};

use crate::models::{
    Appointment, AppointmentStatus, BookingError, FinalizeOutcome, WebhookOutcome,
};
use crate::services::notify::{self, NotificationEvent};
use crate::services::{HoldManager, PaymentFinalizer};
use crate::state::BookingState;

/// The asynchronous arm of payment confirmation. Providers deliver webhooks
/// with no user session, so everything here runs on the service-role client.
/// The reconciler converges with the synchronous verify path on the same
/// guarded finalizer, which is what makes redelivery and races safe.
pub struct WebhookReconciler {
    state: Arc<BookingState>,
    hold: HoldManager,
    finalizer: PaymentFinalizer,
    credentials: CredentialsStore,
}

impl WebhookReconciler {
    pub fn new(state: Arc<BookingState>) -> Self {
        let supabase = state.service_supabase.clone();
        Self {
            hold: HoldManager::new(supabase.clone()),
            finalizer: PaymentFinalizer::new(supabase.clone()),
            credentials: CredentialsStore::new(supabase),
            state,
        }
    }

    /// Process one delivery. Order matters: correlate first (read-only),
    /// resolve the clinic's secret, verify the signature, and only then
    /// touch state. Every `Ok` acknowledges with 200 so the provider stops
    /// retrying; errors make it retry.
    pub async fn handle(
        &self,
        provider: GatewayProvider,
        raw_body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<WebhookOutcome, BookingError> {
        let payload: Value = serde_json::from_slice(raw_body)
            .map_err(|e| BookingError::InvalidWebhook(e.to_string()))?;

        if !is_success_event(provider, &payload) {
            debug!("Ignoring non-payment {} webhook", provider);
            return Ok(WebhookOutcome::Ignored);
        }

        let correlation = extract_correlation(provider, &payload)
            .ok_or_else(|| BookingError::InvalidWebhook("no correlation key".to_string()))?;

        let Some(appointment) = self.find_appointment(&correlation).await? else {
            warn!(
                "{} webhook for unknown order {:?}; acknowledging",
                provider, correlation
            );
            return Ok(WebhookOutcome::Ignored);
        };

        // Signature check uses this clinic's secret; an unverifiable
        // delivery bounces before any write.
        let signature = signature.ok_or(BookingError::SignatureMismatch)?;
        let credentials = self
            .credentials
            .active_gateway(appointment.clinic_id, provider, None)
            .await?;
        let gateway = gateway_for(
            credentials,
            self.state.http.clone(),
            &self.state.config.razorpay_api_base,
            &self.state.config.cashfree_api_base,
        );
        gateway
            .verify_webhook_signature(raw_body, signature, timestamp)
            .map_err(|_| BookingError::SignatureMismatch)?;

        if appointment.status == AppointmentStatus::Confirmed {
            debug!("Webhook replay for confirmed appointment {}", appointment.id);
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        // The sweeper retires a lapsed hold but keeps the row findable for a
        // while. A payment landing now must not resurrect it: the slot may
        // already carry another patient's hold or confirmation. Same deadline
        // rule as the synchronous verify path.
        if Utc::now() >= appointment.hold_deadline() {
            warn!(
                "Late {} webhook for lapsed hold {}; acknowledging without confirming",
                provider, appointment.id
            );
            return Ok(WebhookOutcome::Ignored);
        }

        let transaction_id = extract_transaction_id(provider, &payload)
            .ok_or_else(|| BookingError::InvalidWebhook("no payment id".to_string()))?;

        let outcome = self
            .hold
            .with_slot_lock(appointment.slot_id, || {
                self.finalizer.finalize(&appointment, &transaction_id, None)
            })
            .await;

        match outcome {
            Ok(FinalizeOutcome::Confirmed) => {
                info!(
                    "Webhook confirmed appointment {} ({} {})",
                    appointment.id, provider, transaction_id
                );
                notify::dispatch(
                    self.state.notifier.clone(),
                    NotificationEvent::BookingConfirmed {
                        appointment_id: appointment.id,
                        patient_id: appointment.patient_id,
                        clinic_id: appointment.clinic_id,
                    },
                );
                notify::audit(
                    self.state.audit.clone(),
                    "payment.webhook_confirmed",
                    None,
                    appointment.id,
                    json!({ "provider": provider, "transaction_id": transaction_id }),
                );
                Ok(WebhookOutcome::Processed)
            }
            Ok(FinalizeOutcome::AlreadyConfirmed) => Ok(WebhookOutcome::AlreadyProcessed),
            // Payment landed after the hold was retired. The money side is
            // the provider's dashboard/refund flow; the booking stays dead.
            Err(BookingError::HoldExpired) => {
                warn!(
                    "Late webhook for retired appointment {}; acknowledging",
                    appointment.id
                );
                Ok(WebhookOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    /// Correlate by stored gateway order id first, falling back to the
    /// booking reference we planted in order metadata at creation time.
    async fn find_appointment(
        &self,
        correlation: &Correlation,
    ) -> Result<Option<Appointment>, BookingError> {
        if let Some(order_id) = &correlation.order_id {
            let path = format!(
                "/rest/v1/appointments?gateway_order_id=eq.{}&deleted_at=is.null&limit=1",
                urlencoding::encode(order_id)
            );
            let rows: Vec<Appointment> = self
                .state
                .service_supabase
                .request(Method::GET, &path, None, None)
                .await?;
            if let Some(found) = rows.into_iter().next() {
                return Ok(Some(found));
            }
        }

        if let Some(appointment_id) = correlation
            .booking_ref
            .as_deref()
            .and_then(parse_booking_ref)
        {
            let path = format!(
                "/rest/v1/appointments?id=eq.{}&deleted_at=is.null&limit=1",
                appointment_id
            );
            let rows: Vec<Appointment> = self
                .state
                .service_supabase
                .request(Method::GET, &path, None, None)
                .await?;
            return Ok(rows.into_iter().next());
        }

        Ok(None)
    }
}

#[derive(Debug)]
struct Correlation {
    order_id: Option<String>,
    booking_ref: Option<String>,
}

fn is_success_event(provider: GatewayProvider, payload: &Value) -> bool {
    match provider {
        GatewayProvider::Razorpay => matches!(
            payload["event"].as_str(),
            Some("payment.captured") | Some("order.paid")
        ),
        GatewayProvider::Cashfree => {
            matches!(payload["type"].as_str(), Some("PAYMENT_SUCCESS_WEBHOOK"))
        }
    }
}

fn extract_correlation(provider: GatewayProvider, payload: &Value) -> Option<Correlation> {
    let correlation = match provider {
        GatewayProvider::Razorpay => {
            let entity = &payload["payload"]["payment"]["entity"];
            Correlation {
                order_id: entity["order_id"].as_str().map(str::to_string),
                booking_ref: entity["notes"]["booking_ref"].as_str().map(str::to_string),
            }
        }
        GatewayProvider::Cashfree => {
            let order = &payload["data"]["order"];
            Correlation {
                order_id: order["order_id"].as_str().map(str::to_string),
                booking_ref: order["order_tags"]["booking_ref"]
                    .as_str()
                    .map(str::to_string),
            }
        }
    };

    if correlation.order_id.is_none() && correlation.booking_ref.is_none() {
        None
    } else {
        Some(correlation)
    }
}

fn extract_transaction_id(provider: GatewayProvider, payload: &Value) -> Option<String> {
    match provider {
        GatewayProvider::Razorpay => payload["payload"]["payment"]["entity"]["id"]
            .as_str()
            .map(str::to_string),
        GatewayProvider::Cashfree => {
            let payment = &payload["data"]["payment"];
            payment["cf_payment_id"]
                .as_str()
                .map(str::to_string)
                .or_else(|| payment["cf_payment_id"].as_i64().map(|n| n.to_string()))
        }
    }
}

fn parse_booking_ref(booking_ref: &str) -> Option<Uuid> {
    booking_ref
        .strip_prefix("bk_")
        .and_then(|hex| Uuid::parse_str(hex).ok())
}
