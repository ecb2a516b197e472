// libs/booking-cell/src/services/confirm.rs
use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use shared_database::SupabaseClient;

use crate::models::{
    Appointment, AppointmentStatus, BookingError, FinalizeOutcome, PaymentStatus,
};
use crate::services::hold::representation_headers;

/// The single write path that turns a hold into a confirmed booking. Both
/// the synchronous verify endpoint and the webhook reconciler end here, so
/// whichever arrives second observes the guarded update miss and reports a
/// duplicate instead of double-writing.
pub struct PaymentFinalizer {
    supabase: Arc<SupabaseClient>,
}

impl PaymentFinalizer {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    /// Confirm `appointment` against a verified payment. Must run under the
    /// slot lock. The status filter in the PATCH is the idempotency guard:
    /// an empty representation means another path already moved the row out
    /// of its pending state.
    pub async fn finalize(
        &self,
        appointment: &Appointment,
        gateway_payment_id: &str,
        auth_token: Option<&str>,
    ) -> Result<FinalizeOutcome, BookingError> {
        let now = Utc::now();

        let path = format!(
            "/rest/v1/appointments?id=eq.{}&status=in.(pending,pending_payment)&deleted_at=is.null",
            appointment.id
        );
        let body = json!({
            "status": AppointmentStatus::Confirmed,
            "payment_status": PaymentStatus::Paid,
            "updated_at": now.to_rfc3339(),
        });

        let rows: Vec<Appointment> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                auth_token,
                Some(body),
                Some(representation_headers()),
            )
            .await?;

        if rows.is_empty() {
            return self.classify_lost_update(appointment.id, auth_token).await;
        }

        self.occupy_slot(appointment, auth_token).await?;

        if let Some(old_slot_id) = appointment.reschedule_from_slot_id {
            self.release_superseded(appointment, old_slot_id, auth_token)
                .await?;
        }

        self.record_payment(appointment, gateway_payment_id, auth_token)
            .await?;

        info!(
            "Appointment {} confirmed via payment {}",
            appointment.id, gateway_payment_id
        );
        Ok(FinalizeOutcome::Confirmed)
    }

    /// The guarded PATCH matched nothing. Either the other verification path
    /// won the race (fine, report duplicate) or the hold was cancelled in
    /// the meantime (the payment arrived too late).
    async fn classify_lost_update(
        &self,
        appointment_id: uuid::Uuid,
        auth_token: Option<&str>,
    ) -> Result<FinalizeOutcome, BookingError> {
        let path = format!("/rest/v1/appointments?id=eq.{}&limit=1", appointment_id);
        let rows: Vec<Appointment> = self
            .supabase
            .request(Method::GET, &path, auth_token, None)
            .await?;

        match rows.into_iter().next() {
            Some(current) if current.status == AppointmentStatus::Confirmed => {
                debug!("Appointment {} already confirmed", appointment_id);
                Ok(FinalizeOutcome::AlreadyConfirmed)
            }
            Some(_) => Err(BookingError::HoldExpired),
            None => Err(BookingError::AppointmentNotFound),
        }
    }

    async fn occupy_slot(
        &self,
        appointment: &Appointment,
        auth_token: Option<&str>,
    ) -> Result<(), BookingError> {
        let path = format!("/rest/v1/slots?id=eq.{}", appointment.slot_id);
        let body = json!({ "is_booked": true });
        let _: Value = self
            .supabase
            .request(Method::PATCH, &path, auth_token, Some(body))
            .await?;
        Ok(())
    }

    /// Reschedule sub-flow: the old slot reopens and the superseded
    /// confirmed appointment on it is cancelled, in the same critical
    /// section as the new confirmation.
    async fn release_superseded(
        &self,
        appointment: &Appointment,
        old_slot_id: uuid::Uuid,
        auth_token: Option<&str>,
    ) -> Result<(), BookingError> {
        debug!(
            "Releasing slot {} superseded by appointment {}",
            old_slot_id, appointment.id
        );

        let path = format!(
            "/rest/v1/appointments?slot_id=eq.{}&patient_id=eq.{}&status=eq.confirmed&id=neq.{}",
            old_slot_id, appointment.patient_id, appointment.id
        );
        let body = json!({
            "status": AppointmentStatus::Cancelled,
            "updated_at": Utc::now().to_rfc3339(),
        });
        let _: Value = self
            .supabase
            .request(Method::PATCH, &path, auth_token, Some(body))
            .await?;

        let path = format!("/rest/v1/slots?id=eq.{}", old_slot_id);
        let _: Value = self
            .supabase
            .request(
                Method::PATCH,
                &path,
                auth_token,
                Some(json!({ "is_booked": false })),
            )
            .await?;

        Ok(())
    }

    /// Append the ledger row. The unique index on `gateway_payment_id`
    /// turns a replay into a 409, which is swallowed as success.
    async fn record_payment(
        &self,
        appointment: &Appointment,
        gateway_payment_id: &str,
        auth_token: Option<&str>,
    ) -> Result<(), BookingError> {
        let body = json!({
            "appointment_id": appointment.id,
            "clinic_id": appointment.clinic_id,
            "amount": appointment.amount,
            "provider": appointment.provider,
            "gateway_payment_id": gateway_payment_id,
            "gateway_order_id": appointment.gateway_order_id,
            "created_at": Utc::now().to_rfc3339(),
        });

        match self
            .supabase
            .request::<Value>(Method::POST, "/rest/v1/payments", auth_token, Some(body))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                warn!(
                    "Payment {} already recorded; treating as replay",
                    gateway_payment_id
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
