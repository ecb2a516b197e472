// libs/booking-cell/src/models.rs
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use payment_gateway_cell::{GatewayError, GatewayProvider, PaymentProof};

/// How long an online-payment hold keeps a slot off the market.
pub const HOLD_MINUTES: i64 = 10;

/// Failed holds stay visible (soft-deleted only after this) so a webhook
/// that races the sweeper can still find its appointment row.
pub const SAFETY_MINUTES: i64 = 15;

/// Free/offline requests the clinic never actioned are cancelled after this.
pub const STALE_PENDING_HOURS: i64 = 24;

/// Expiry sweeper cadence.
pub const SWEEP_INTERVAL_SECONDS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    Free,
    Online,
    Offline,
}

impl std::fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentMode::Free => write!(f, "free"),
            PaymentMode::Online => write!(f, "online"),
            PaymentMode::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Appointment,
    Break,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub doctor_id: Uuid,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub kind: SlotKind,
    pub payment_mode: PaymentMode,
    /// Price in minor currency units (paise). Zero for free slots.
    pub amount: i64,
    pub is_booked: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Slot {
    pub fn is_bookable(&self) -> bool {
        self.kind == SlotKind::Appointment && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    PendingPayment,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl AppointmentStatus {
    /// Single source of truth for the appointment state machine. Terminal
    /// states admit no transitions, which is what makes guarded updates
    /// (`status=in.(pending,pending_payment)`) safe against double writes.
    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (PendingPayment, Confirmed)
                | (PendingPayment, Cancelled)
                | (Confirmed, Completed)
                | (Confirmed, Cancelled)
                | (Confirmed, NoShow)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Cancelled | AppointmentStatus::Completed | AppointmentStatus::NoShow
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Pending | AppointmentStatus::PendingPayment
        )
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::PendingPayment => "pending_payment",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::NoShow => "no_show",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    NotRequired,
    Pending,
    Paid,
    Failed,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentStatus::NotRequired => "not_required",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub slot_id: Uuid,
    pub clinic_id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub status: AppointmentStatus,
    pub payment_status: PaymentStatus,
    pub payment_mode: PaymentMode,
    /// Amount due in minor units, captured from the slot at booking time.
    pub amount: i64,
    pub provider: Option<GatewayProvider>,
    pub gateway_order_id: Option<String>,
    /// Checkout session handle for providers that issue one (Cashfree).
    pub payment_session_id: Option<String>,
    /// When the payment hold lapses. Refreshing a hold pushes this forward.
    pub payment_expiry: Option<DateTime<Utc>>,
    /// Set when this booking supersedes a confirmed appointment on another
    /// slot; confirmation releases that slot atomically.
    pub reschedule_from_slot_id: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// The instant this hold stops blocking the slot. Rows written before
    /// `payment_expiry` existed fall back to `created_at + HOLD_MINUTES`.
    pub fn hold_deadline(&self) -> DateTime<Utc> {
        self.payment_expiry
            .unwrap_or(self.created_at + Duration::minutes(HOLD_MINUTES))
    }

    /// A hold is live state derived at read time, never a stored flag.
    pub fn hold_active(&self, now: DateTime<Utc>) -> bool {
        self.status == AppointmentStatus::PendingPayment
            && self.payment_status == PaymentStatus::Pending
            && self.deleted_at.is_none()
            && now < self.hold_deadline()
    }
}

/// Immutable payment ledger row, written once on confirmation. The unique
/// index on `gateway_payment_id` is what makes replays detectable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub clinic_id: Uuid,
    pub amount: i64,
    pub provider: GatewayProvider,
    pub gateway_payment_id: String,
    pub gateway_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicPlan {
    pub clinic_id: Uuid,
    pub plan_name: String,
    pub allow_online_payments: bool,
    pub status: String,
}

impl ClinicPlan {
    pub fn basic(clinic_id: Uuid) -> Self {
        Self {
            clinic_id,
            plan_name: "basic".to_string(),
            allow_online_payments: false,
            status: "active".to_string(),
        }
    }

    pub fn available_modes(&self) -> Vec<PaymentMode> {
        let mut modes = vec![PaymentMode::Free, PaymentMode::Offline];
        if self.allow_online_payments {
            modes.push(PaymentMode::Online);
        }
        modes
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub slot_id: Uuid,
    /// Client's declared intent; must agree with the slot's configured mode.
    pub payment_method: Option<PaymentMode>,
    pub provider: Option<GatewayProvider>,
    pub reschedule_from_slot_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BookingResponse {
    pub appointment_id: Uuid,
    pub status: AppointmentStatus,
    pub payment_mode: PaymentMode,
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<GatewayProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_session_id: Option<String>,
    /// Seconds until the payment hold lapses; online bookings only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    pub appointment_id: Uuid,
    pub proof: PaymentProof,
}

#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub appointment_id: Uuid,
    pub status: AppointmentStatus,
    pub payment_status: PaymentStatus,
    pub message: String,
}

/// What a hold request did under the slot lock.
#[derive(Debug, Clone)]
pub enum HoldAction {
    Created(Appointment),
    Refreshed(Appointment),
}

impl HoldAction {
    pub fn appointment(&self) -> &Appointment {
        match self {
            HoldAction::Created(a) | HoldAction::Refreshed(a) => a,
        }
    }

    pub fn into_appointment(self) -> Appointment {
        match self {
            HoldAction::Created(a) | HoldAction::Refreshed(a) => a,
        }
    }
}

/// Disposition of a verified webhook. Every variant acknowledges with 200;
/// only the error paths make the provider retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    AlreadyProcessed,
    Ignored,
}

/// Result of the guarded confirm transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Confirmed,
    AlreadyConfirmed,
}

/// One pass of the expiry sweeper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_holds: usize,
    pub released_slots: usize,
    pub purged_holds: usize,
    pub cancelled_stale: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired_holds + self.purged_holds + self.cancelled_stale
    }
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("Slot not found or not bookable")]
    SlotNotFound,

    #[error("Appointment not found")]
    AppointmentNotFound,

    #[error("Slot is already booked")]
    AlreadyConfirmed,

    #[error("Slot is temporarily held by another patient; retry in {retry_after_seconds}s")]
    SlotBlocked { retry_after_seconds: i64 },

    #[error("Slot accepts {slot_mode} payment, not {requested}")]
    PaymentModeMismatch {
        slot_mode: PaymentMode,
        requested: PaymentMode,
    },

    #[error("Online payments are not enabled for this clinic")]
    OnlinePaymentsNotAllowed { available_modes: Vec<PaymentMode> },

    #[error("Payment window has expired")]
    HoldExpired,

    #[error("Payment signature verification failed")]
    SignatureMismatch,

    #[error("Malformed webhook payload: {0}")]
    InvalidWebhook(String),

    #[error("Could not acquire the slot lock; please retry")]
    LockUnavailable,

    #[error("Not authorized to act on this booking")]
    NotAuthorized,

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<shared_database::SupabaseError> for BookingError {
    fn from(e: shared_database::SupabaseError) -> Self {
        BookingError::Database(e.to_string())
    }
}
