// libs/booking-cell/src/services/hold.rs
use chrono::{Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_database::SupabaseClient;

use crate::models::{
    Appointment, AppointmentStatus, BookingError, HoldAction, PaymentMode, PaymentStatus, Slot,
    HOLD_MINUTES,
};

const LOCK_TIMEOUT_SECONDS: i64 = 30;
const MAX_LOCK_ATTEMPTS: u32 = 3;
const LOCK_RETRY_BASE_MS: u64 = 100;

/// Owns the per-slot critical section and the hold lifecycle. All writes
/// that can race on a slot funnel through `with_slot_lock`.
pub struct HoldManager {
    supabase: Arc<SupabaseClient>,
}

impl HoldManager {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    /// Run `f` while holding the advisory lock for `slot_id`. The lock is an
    /// insert into `booking_locks`; the unique key on `lock_key` is the
    /// mutual exclusion. Always released on the way out, including when `f`
    /// fails.
    pub async fn with_slot_lock<T, F, Fut>(&self, slot_id: Uuid, f: F) -> Result<T, BookingError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BookingError>>,
    {
        let lock_key = format!("slot_{}", slot_id);

        if !self.acquire_lock(&lock_key, slot_id).await? {
            return Err(BookingError::LockUnavailable);
        }

        let result = f().await;

        if let Err(e) = self.release_lock(&lock_key).await {
            // The row expires on its own; the next acquirer cleans it up.
            warn!("Failed to release lock {}: {}", lock_key, e);
        }

        result
    }

    async fn acquire_lock(&self, lock_key: &str, slot_id: Uuid) -> Result<bool, BookingError> {
        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            let now = Utc::now();
            let body = json!({
                "lock_key": lock_key,
                "slot_id": slot_id,
                "acquired_at": now.to_rfc3339(),
                "expires_at": (now + Duration::seconds(LOCK_TIMEOUT_SECONDS)).to_rfc3339(),
            });

            match self
                .supabase
                .request::<Value>(Method::POST, "/rest/v1/booking_locks", None, Some(body))
                .await
            {
                Ok(_) => {
                    debug!("Acquired lock {} (attempt {})", lock_key, attempt);
                    return Ok(true);
                }
                Err(e) if e.is_conflict() => {
                    self.cleanup_expired_lock(lock_key).await?;
                    if attempt < MAX_LOCK_ATTEMPTS {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            LOCK_RETRY_BASE_MS * attempt as u64,
                        ))
                        .await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!("Lock {} contended after {} attempts", lock_key, MAX_LOCK_ATTEMPTS);
        Ok(false)
    }

    /// A crashed holder leaves its row behind; deleting rows past
    /// `expires_at` lets the next caller through.
    async fn cleanup_expired_lock(&self, lock_key: &str) -> Result<(), BookingError> {
        let path = format!(
            "/rest/v1/booking_locks?lock_key=eq.{}&expires_at=lt.{}",
            lock_key,
            urlencoding::encode(&Utc::now().to_rfc3339())
        );
        let _: Value = self.supabase.request(Method::DELETE, &path, None, None).await?;
        Ok(())
    }

    async fn release_lock(&self, lock_key: &str) -> Result<(), BookingError> {
        let path = format!("/rest/v1/booking_locks?lock_key=eq.{}", lock_key);
        let _: Value = self.supabase.request(Method::DELETE, &path, None, None).await?;
        Ok(())
    }

    /// Claims read while deciding a hold. Confirmed rows always win; holds
    /// count only while their deadline is in the future.
    async fn slot_claims(
        &self,
        slot_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<Vec<Appointment>, BookingError> {
        let path = format!(
            "/rest/v1/appointments?slot_id=eq.{}&deleted_at=is.null&status=in.(confirmed,pending_payment)&order=created_at.desc",
            slot_id
        );
        Ok(self
            .supabase
            .request(Method::GET, &path, auth_token, None)
            .await?)
    }

    /// Decide a hold request under the slot lock, in claim order:
    /// confirmed beats everything, a live foreign hold blocks, the caller's
    /// own live hold refreshes, and otherwise a new hold row is created.
    /// Lapsed holds are ignored here; the sweeper retires them.
    ///
    /// Must only be called from within `with_slot_lock` for the same slot.
    pub async fn acquire_or_refresh(
        &self,
        slot: &Slot,
        patient_id: Uuid,
        reschedule_from_slot_id: Option<Uuid>,
        auth_token: Option<&str>,
    ) -> Result<HoldAction, BookingError> {
        let now = Utc::now();
        let claims = self.slot_claims(slot.id, auth_token).await?;

        if claims
            .iter()
            .any(|a| a.status == AppointmentStatus::Confirmed)
        {
            return Err(BookingError::AlreadyConfirmed);
        }

        let live_hold = claims.iter().find(|a| a.hold_active(now));

        if let Some(hold) = live_hold {
            if hold.patient_id != patient_id {
                let retry_after = (hold.hold_deadline() - now).num_seconds().max(1);
                return Err(BookingError::SlotBlocked {
                    retry_after_seconds: retry_after,
                });
            }
            return self.refresh_hold(hold.id, now, auth_token).await;
        }

        self.create_hold(slot, patient_id, reschedule_from_slot_id, now, auth_token)
            .await
    }

    async fn refresh_hold(
        &self,
        appointment_id: Uuid,
        now: chrono::DateTime<Utc>,
        auth_token: Option<&str>,
    ) -> Result<HoldAction, BookingError> {
        debug!("Refreshing hold on appointment {}", appointment_id);

        let path = format!(
            "/rest/v1/appointments?id=eq.{}&status=eq.pending_payment",
            appointment_id
        );
        let body = json!({
            "payment_expiry": (now + Duration::minutes(HOLD_MINUTES)).to_rfc3339(),
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

        rows.into_iter()
            .next()
            .map(HoldAction::Refreshed)
            .ok_or(BookingError::HoldExpired)
    }

    async fn create_hold(
        &self,
        slot: &Slot,
        patient_id: Uuid,
        reschedule_from_slot_id: Option<Uuid>,
        now: chrono::DateTime<Utc>,
        auth_token: Option<&str>,
    ) -> Result<HoldAction, BookingError> {
        debug!("Creating hold on slot {} for patient {}", slot.id, patient_id);

        let body = json!({
            "slot_id": slot.id,
            "clinic_id": slot.clinic_id,
            "doctor_id": slot.doctor_id,
            "patient_id": patient_id,
            "status": AppointmentStatus::PendingPayment,
            "payment_status": PaymentStatus::Pending,
            "payment_mode": PaymentMode::Online,
            "amount": slot.amount,
            "payment_expiry": (now + Duration::minutes(HOLD_MINUTES)).to_rfc3339(),
            "reschedule_from_slot_id": reschedule_from_slot_id,
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });

        let rows: Vec<Appointment> = self
            .supabase
            .request_with_headers(
                Method::POST,
                "/rest/v1/appointments",
                auth_token,
                Some(body),
                Some(representation_headers()),
            )
            .await?;

        rows.into_iter()
            .next()
            .map(HoldAction::Created)
            .ok_or_else(|| BookingError::Database("Insert returned no row".to_string()))
    }

    /// Free/offline path: the slot must have no confirmed appointment and no
    /// live hold by anyone, including the caller.
    pub async fn ensure_slot_unclaimed(
        &self,
        slot_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<(), BookingError> {
        let now = Utc::now();
        let claims = self.slot_claims(slot_id, auth_token).await?;

        if claims
            .iter()
            .any(|a| a.status == AppointmentStatus::Confirmed)
        {
            return Err(BookingError::AlreadyConfirmed);
        }

        if let Some(hold) = claims.iter().find(|a| a.hold_active(now)) {
            let retry_after = (hold.hold_deadline() - now).num_seconds().max(1);
            return Err(BookingError::SlotBlocked {
                retry_after_seconds: retry_after,
            });
        }

        Ok(())
    }
}

pub(crate) fn representation_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("Prefer", HeaderValue::from_static("return=representation"));
    headers
}
