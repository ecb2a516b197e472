// libs/booking-cell/src/services/sweeper.rs
use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use shared_database::SupabaseClient;

use crate::models::{
    Appointment, AppointmentStatus, BookingError, PaymentStatus, SweepReport, HOLD_MINUTES,
    SAFETY_MINUTES, STALE_PENDING_HOURS, SWEEP_INTERVAL_SECONDS,
};
use crate::services::hold::representation_headers;

/// Background reclamation of lapsed state. Holds expire on read everywhere
/// else; the sweeper is what eventually writes that fact down, reopens
/// slots, and clears out the debris.
pub struct ExpirySweeper {
    supabase: Arc<SupabaseClient>,
    interval: std::time::Duration,
}

#[derive(Debug, Deserialize)]
struct SlotIdRow {
    slot_id: Uuid,
}

fn enc(ts: String) -> String {
    urlencoding::encode(&ts).into_owned()
}

impl ExpirySweeper {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self {
            supabase,
            interval: std::time::Duration::from_secs(SWEEP_INTERVAL_SECONDS),
        }
    }

    pub fn with_interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run forever. A failed pass is logged and retried next tick; the
    /// sweeper never takes the process down.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(report) if report.total() > 0 => {
                    info!(
                        "Sweep: {} holds expired, {} slots released, {} purged, {} stale cancelled",
                        report.expired_holds,
                        report.released_slots,
                        report.purged_holds,
                        report.cancelled_stale
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Sweep pass failed: {}", e),
            }
        }
    }

    /// One pass, in order: expire lapsed holds, reopen their slots, purge
    /// failed holds past the safety window, cancel stale free/offline
    /// requests. Each step is a guarded bulk write.
    pub async fn sweep_once(&self) -> Result<SweepReport, BookingError> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let expired = self.expire_lapsed_holds(now).await?;
        report.expired_holds = expired.len();

        if !expired.is_empty() {
            report.released_slots = self.release_slots(&expired).await?;
        }

        report.purged_holds = self.purge_failed_holds(now).await?;
        report.cancelled_stale = self.cancel_stale_pending(now).await?;

        Ok(report)
    }

    /// Mark holds whose deadline has passed as failed. Deadline is
    /// `payment_expiry` when present, else `created_at + HOLD_MINUTES` for
    /// legacy rows, mirroring how reads derive it.
    async fn expire_lapsed_holds(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, BookingError> {
        let now_enc = enc(now.to_rfc3339());
        let fallback_cutoff = enc((now - Duration::minutes(HOLD_MINUTES)).to_rfc3339());

        let path = format!(
            "/rest/v1/appointments?status=eq.pending_payment&payment_status=eq.pending&deleted_at=is.null&or=(payment_expiry.lt.{},and(payment_expiry.is.null,created_at.lt.{}))",
            now_enc, fallback_cutoff
        );
        let body = json!({
            "payment_status": PaymentStatus::Failed,
            "updated_at": now.to_rfc3339(),
        });

        let rows: Vec<Appointment> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                None,
                Some(body),
                Some(representation_headers()),
            )
            .await?;

        Ok(rows)
    }

    /// Reopen slots whose only claim was an expired hold. A slot with a
    /// confirmed appointment stays booked even if stale holds also
    /// reference it.
    async fn release_slots(&self, expired: &[Appointment]) -> Result<usize, BookingError> {
        let slot_ids: HashSet<Uuid> = expired.iter().map(|a| a.slot_id).collect();
        let id_list = slot_ids
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let path = format!(
            "/rest/v1/appointments?slot_id=in.({})&status=eq.confirmed&deleted_at=is.null&select=slot_id",
            id_list
        );
        let confirmed: Vec<SlotIdRow> = self
            .supabase
            .request(Method::GET, &path, None, None)
            .await?;
        let keep: HashSet<Uuid> = confirmed.into_iter().map(|r| r.slot_id).collect();

        let releasable: Vec<String> = slot_ids
            .iter()
            .filter(|id| !keep.contains(id))
            .map(Uuid::to_string)
            .collect();
        if releasable.is_empty() {
            return Ok(0);
        }

        let path = format!(
            "/rest/v1/slots?id=in.({})&is_booked=eq.true",
            releasable.join(",")
        );
        let rows: Vec<serde_json::Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                None,
                Some(json!({ "is_booked": false })),
                Some(representation_headers()),
            )
            .await?;

        Ok(rows.len())
    }

    /// Soft-delete failed holds once they are older than the safety window.
    /// Until then a late webhook can still find and inspect the row.
    async fn purge_failed_holds(&self, now: DateTime<Utc>) -> Result<usize, BookingError> {
        let cutoff = enc((now - Duration::minutes(SAFETY_MINUTES)).to_rfc3339());

        let path = format!(
            "/rest/v1/appointments?status=eq.pending_payment&payment_status=eq.failed&deleted_at=is.null&updated_at=lt.{}",
            cutoff
        );
        let body = json!({ "deleted_at": now.to_rfc3339() });

        let rows: Vec<serde_json::Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                None,
                Some(body),
                Some(representation_headers()),
            )
            .await?;

        Ok(rows.len())
    }

    /// Free/offline requests the clinic never actioned get cancelled after
    /// a day so they stop cluttering worklists.
    async fn cancel_stale_pending(&self, now: DateTime<Utc>) -> Result<usize, BookingError> {
        let cutoff = enc((now - Duration::hours(STALE_PENDING_HOURS)).to_rfc3339());

        let path = format!(
            "/rest/v1/appointments?status=eq.pending&deleted_at=is.null&created_at=lt.{}",
            cutoff
        );
        let body = json!({
            "status": AppointmentStatus::Cancelled,
            "updated_at": now.to_rfc3339(),
        });

        let rows: Vec<serde_json::Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                None,
                Some(body),
                Some(representation_headers()),
            )
            .await?;

        Ok(rows.len())
    }
}
