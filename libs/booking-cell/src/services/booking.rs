// libs/booking-cell/src/services/booking.rs
use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use payment_gateway_cell::{gateway_for, CreateOrderRequest, CredentialsStore, GatewayError};

use crate::models::{
    Appointment, AppointmentStatus, BookingError, BookingResponse, CreateBookingRequest,
    FinalizeOutcome, PaymentMode, PaymentStatus, Slot, VerifyPaymentRequest,
    VerifyPaymentResponse, HOLD_MINUTES,
};
use crate::services::hold::representation_headers;
use crate::services::notify::{self, NotificationEvent};
use crate::services::{HoldManager, PaymentFinalizer, PlanService};
use crate::state::BookingState;

/// Orchestrates a booking request end to end: slot load, mode enforcement,
/// plan gate, then the mode-specific path. Online bookings go through the
/// hold manager and the gateway; free and offline bookings create a pending
/// request for the clinic to action.
pub struct BookingService {
    state: Arc<BookingState>,
    hold: HoldManager,
    plans: PlanService,
    finalizer: PaymentFinalizer,
    credentials: CredentialsStore,
}

impl BookingService {
    pub fn new(state: Arc<BookingState>) -> Self {
        let supabase = state.supabase.clone();
        Self {
            hold: HoldManager::new(supabase.clone()),
            plans: PlanService::new(supabase.clone()),
            finalizer: PaymentFinalizer::new(supabase.clone()),
            credentials: CredentialsStore::new(supabase),
            state,
        }
    }

    pub async fn create_booking(
        &self,
        patient_id: Uuid,
        request: CreateBookingRequest,
        auth_token: &str,
    ) -> Result<BookingResponse, BookingError> {
        let slot = self.load_slot(request.slot_id, auth_token).await?;

        // The slot's configured mode wins; a conflicting client intent is an
        // error, not a silent override. Free slots ignore the field.
        if slot.payment_mode != PaymentMode::Free {
            if let Some(requested) = request.payment_method {
                if requested != slot.payment_mode {
                    return Err(BookingError::PaymentModeMismatch {
                        slot_mode: slot.payment_mode,
                        requested,
                    });
                }
            }
        }

        match slot.payment_mode {
            PaymentMode::Free => {
                self.create_pending_booking(patient_id, &slot, PaymentMode::Free, auth_token)
                    .await
            }
            PaymentMode::Offline => {
                self.create_pending_booking(patient_id, &slot, PaymentMode::Offline, auth_token)
                    .await
            }
            PaymentMode::Online => {
                self.create_online_booking(patient_id, &slot, &request, auth_token)
                    .await
            }
        }
    }

    async fn load_slot(&self, slot_id: Uuid, auth_token: &str) -> Result<Slot, BookingError> {
        let path = format!(
            "/rest/v1/slots?id=eq.{}&deleted_at=is.null&limit=1",
            slot_id
        );
        let rows: Vec<Slot> = self
            .state
            .supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await?;

        match rows.into_iter().next() {
            Some(slot) if slot.is_bookable() => Ok(slot),
            _ => Err(BookingError::SlotNotFound),
        }
    }

    /// Free and offline bookings: no hold, no gateway. The row lands in
    /// `pending` and waits for the clinic to confirm.
    async fn create_pending_booking(
        &self,
        patient_id: Uuid,
        slot: &Slot,
        mode: PaymentMode,
        auth_token: &str,
    ) -> Result<BookingResponse, BookingError> {
        let appointment = self
            .hold
            .with_slot_lock(slot.id, || async {
                self.hold
                    .ensure_slot_unclaimed(slot.id, Some(auth_token))
                    .await?;
                self.insert_pending_appointment(patient_id, slot, mode, auth_token)
                    .await
            })
            .await?;

        info!(
            "Created {} booking {} on slot {}",
            mode, appointment.id, slot.id
        );
        notify::dispatch(
            self.state.notifier.clone(),
            NotificationEvent::BookingCreated {
                appointment_id: appointment.id,
                patient_id,
                doctor_id: slot.doctor_id,
                clinic_id: slot.clinic_id,
                payment_mode: mode,
            },
        );
        notify::audit(
            self.state.audit.clone(),
            "booking.created",
            Some(patient_id),
            appointment.id,
            json!({ "slot_id": slot.id, "payment_mode": mode }),
        );

        let message = match mode {
            PaymentMode::Offline => {
                "Booking requested; pay at the clinic once confirmed.".to_string()
            }
            _ => "Booking requested; the clinic will confirm shortly.".to_string(),
        };

        Ok(BookingResponse {
            appointment_id: appointment.id,
            status: appointment.status,
            payment_mode: mode,
            amount: appointment.amount,
            provider: None,
            order_id: None,
            payment_session_id: None,
            expires_in: None,
            message,
        })
    }

    async fn insert_pending_appointment(
        &self,
        patient_id: Uuid,
        slot: &Slot,
        mode: PaymentMode,
        auth_token: &str,
    ) -> Result<Appointment, BookingError> {
        let now = Utc::now();
        let (amount, payment_status) = match mode {
            PaymentMode::Free => (0, PaymentStatus::NotRequired),
            _ => (slot.amount, PaymentStatus::Pending),
        };

        let body = json!({
            "slot_id": slot.id,
            "clinic_id": slot.clinic_id,
            "doctor_id": slot.doctor_id,
            "patient_id": patient_id,
            "status": AppointmentStatus::Pending,
            "payment_status": payment_status,
            "payment_mode": mode,
            "amount": amount,
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });

        let rows: Vec<Appointment> = self
            .state
            .supabase
            .request_with_headers(
                Method::POST,
                "/rest/v1/appointments",
                Some(auth_token),
                Some(body),
                Some(representation_headers()),
            )
            .await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| BookingError::Database("Insert returned no row".to_string()))
    }

    /// Online path: plan gate, credentials, then hold + gateway order inside
    /// the slot lock. If order creation fails after a fresh hold was
    /// written, the hold is rolled back so the slot reopens immediately.
    async fn create_online_booking(
        &self,
        patient_id: Uuid,
        slot: &Slot,
        request: &CreateBookingRequest,
        auth_token: &str,
    ) -> Result<BookingResponse, BookingError> {
        let plan = self
            .plans
            .plan_for_clinic(slot.clinic_id, Some(auth_token))
            .await?;
        if !plan.allow_online_payments {
            return Err(BookingError::OnlinePaymentsNotAllowed {
                available_modes: plan.available_modes(),
            });
        }

        let provider = request
            .provider
            .unwrap_or(payment_gateway_cell::GatewayProvider::Razorpay);
        let credentials = self
            .credentials
            .active_gateway(slot.clinic_id, provider, Some(auth_token))
            .await?;
        let gateway = gateway_for(
            credentials,
            self.state.http.clone(),
            &self.state.config.razorpay_api_base,
            &self.state.config.cashfree_api_base,
        );

        let reschedule_from = request.reschedule_from_slot_id;
        let appointment = self
            .hold
            .with_slot_lock(slot.id, || async {
                let action = self
                    .hold
                    .acquire_or_refresh(slot, patient_id, reschedule_from, Some(auth_token))
                    .await?;
                let fresh = matches!(action, crate::models::HoldAction::Created(_));
                let appointment = action.into_appointment();

                let order_request = CreateOrderRequest {
                    amount: appointment.amount,
                    currency: "INR".to_string(),
                    booking_ref: format!("bk_{}", appointment.id.simple()),
                    customer_id: patient_id,
                };

                let order = match gateway.create_order(&order_request).await {
                    Ok(order) => order,
                    Err(e) => {
                        if fresh {
                            self.rollback_hold(appointment.id, auth_token).await;
                        }
                        return Err(e.into());
                    }
                };

                self.attach_order(&appointment, &order, auth_token).await
            })
            .await?;

        let order_id = appointment.gateway_order_id.clone();
        let expires_in = appointment
            .payment_expiry
            .map(|e| (e - Utc::now()).num_seconds().max(0));

        notify::audit(
            self.state.audit.clone(),
            "booking.hold_created",
            Some(patient_id),
            appointment.id,
            json!({ "slot_id": slot.id, "provider": provider, "order_id": order_id }),
        );

        Ok(BookingResponse {
            appointment_id: appointment.id,
            status: appointment.status,
            payment_mode: PaymentMode::Online,
            amount: appointment.amount,
            provider: Some(provider),
            order_id,
            payment_session_id: appointment.payment_session_id.clone(),
            expires_in,
            message: format!(
                "Complete payment within {} minutes to confirm the booking.",
                HOLD_MINUTES
            ),
        })
    }

    /// Best-effort: the sweeper retires the row anyway if this write fails.
    async fn rollback_hold(&self, appointment_id: Uuid, auth_token: &str) {
        let path = format!("/rest/v1/appointments?id=eq.{}", appointment_id);
        if let Err(e) = self
            .state
            .supabase
            .request::<Value>(Method::DELETE, &path, Some(auth_token), None)
            .await
        {
            warn!(
                "Failed to roll back hold {} after gateway error: {}",
                appointment_id, e
            );
        }
    }

    async fn attach_order(
        &self,
        appointment: &Appointment,
        order: &payment_gateway_cell::GatewayOrder,
        auth_token: &str,
    ) -> Result<Appointment, BookingError> {
        let path = format!("/rest/v1/appointments?id=eq.{}", appointment.id);
        let body = json!({
            "provider": order.provider,
            "gateway_order_id": order.order_id,
            "payment_session_id": order.payment_session_id,
            "updated_at": Utc::now().to_rfc3339(),
        });

        let rows: Vec<Appointment> = self
            .state
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                Some(auth_token),
                Some(body),
                Some(representation_headers()),
            )
            .await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| BookingError::Database("Order attach returned no row".to_string()))
    }

    /// Synchronous verification: the client returns from checkout with the
    /// provider's proof and trades it for a confirmation. Signature check
    /// happens before any state changes.
    pub async fn verify_payment(
        &self,
        patient_id: Uuid,
        request: VerifyPaymentRequest,
        auth_token: &str,
    ) -> Result<VerifyPaymentResponse, BookingError> {
        let appointment = self
            .load_appointment(request.appointment_id, auth_token)
            .await?;

        if appointment.patient_id != patient_id {
            return Err(BookingError::NotAuthorized);
        }

        if appointment.status == AppointmentStatus::Confirmed {
            return Ok(confirmed_response(&appointment, "Payment already verified."));
        }

        let now = Utc::now();
        if now >= appointment.hold_deadline() {
            self.mark_payment_failed(&appointment, "hold expired", auth_token)
                .await?;
            return Err(BookingError::HoldExpired);
        }

        // Plan re-check: a downgrade between hold and verification refuses
        // the confirmation rather than confirming on a lapsed entitlement.
        let plan = self
            .plans
            .plan_for_clinic(appointment.clinic_id, Some(auth_token))
            .await?;
        if !plan.allow_online_payments {
            return Err(BookingError::OnlinePaymentsNotAllowed {
                available_modes: plan.available_modes(),
            });
        }

        let provider = request.proof.provider();
        let credentials = self
            .credentials
            .active_gateway(appointment.clinic_id, provider, Some(auth_token))
            .await?;
        let gateway = gateway_for(
            credentials,
            self.state.http.clone(),
            &self.state.config.razorpay_api_base,
            &self.state.config.cashfree_api_base,
        );

        if let Err(e) = gateway.verify_payment_proof(&request.proof) {
            return match e {
                GatewayError::SignatureMismatch | GatewayError::ProviderMismatch => {
                    self.mark_payment_failed(&appointment, "signature mismatch", auth_token)
                        .await?;
                    Err(BookingError::SignatureMismatch)
                }
                other => Err(other.into()),
            };
        }

        let transaction_id = request.proof.transaction_id().to_string();
        let outcome = self
            .hold
            .with_slot_lock(appointment.slot_id, || {
                self.finalizer
                    .finalize(&appointment, &transaction_id, Some(auth_token))
            })
            .await?;

        if outcome == FinalizeOutcome::Confirmed {
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
                "payment.verified",
                Some(patient_id),
                appointment.id,
                json!({ "provider": provider, "transaction_id": transaction_id }),
            );
        }

        let message = match outcome {
            FinalizeOutcome::Confirmed => "Payment verified; booking confirmed.",
            FinalizeOutcome::AlreadyConfirmed => "Payment already verified.",
        };
        Ok(VerifyPaymentResponse {
            appointment_id: appointment.id,
            status: AppointmentStatus::Confirmed,
            payment_status: PaymentStatus::Paid,
            message: message.to_string(),
        })
    }

    async fn load_appointment(
        &self,
        appointment_id: Uuid,
        auth_token: &str,
    ) -> Result<Appointment, BookingError> {
        let path = format!(
            "/rest/v1/appointments?id=eq.{}&deleted_at=is.null&limit=1",
            appointment_id
        );
        let rows: Vec<Appointment> = self
            .state
            .supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await?;

        rows.into_iter()
            .next()
            .ok_or(BookingError::AppointmentNotFound)
    }

    /// Guarded failure mark: only rows still in a pending state move, so a
    /// confirmation that raced us is never clobbered.
    async fn mark_payment_failed(
        &self,
        appointment: &Appointment,
        reason: &str,
        auth_token: &str,
    ) -> Result<(), BookingError> {
        warn!(
            "Marking payment failed for appointment {}: {}",
            appointment.id, reason
        );

        let path = format!(
            "/rest/v1/appointments?id=eq.{}&status=in.(pending,pending_payment)",
            appointment.id
        );
        let body = json!({
            "payment_status": PaymentStatus::Failed,
            "updated_at": Utc::now().to_rfc3339(),
        });
        let _: Value = self
            .state
            .supabase
            .request(Method::PATCH, &path, Some(auth_token), Some(body))
            .await?;

        notify::dispatch(
            self.state.notifier.clone(),
            NotificationEvent::PaymentFailed {
                appointment_id: appointment.id,
                patient_id: appointment.patient_id,
                reason: reason.to_string(),
            },
        );
        Ok(())
    }
}

fn confirmed_response(appointment: &Appointment, message: &str) -> VerifyPaymentResponse {
    VerifyPaymentResponse {
        appointment_id: appointment.id,
        status: AppointmentStatus::Confirmed,
        payment_status: PaymentStatus::Paid,
        message: message.to_string(),
    }
}
