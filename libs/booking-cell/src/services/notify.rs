// libs/booking-cell/src/services/notify.rs
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_database::SupabaseClient;

use crate::models::PaymentMode;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    BookingCreated {
        appointment_id: Uuid,
        patient_id: Uuid,
        doctor_id: Uuid,
        clinic_id: Uuid,
        payment_mode: PaymentMode,
    },
    BookingConfirmed {
        appointment_id: Uuid,
        patient_id: Uuid,
        clinic_id: Uuid,
    },
    PaymentFailed {
        appointment_id: Uuid,
        patient_id: Uuid,
        reason: String,
    },
}

impl NotificationEvent {
    fn recipient(&self) -> Uuid {
        match self {
            NotificationEvent::BookingCreated { patient_id, .. }
            | NotificationEvent::BookingConfirmed { patient_id, .. }
            | NotificationEvent::PaymentFailed { patient_id, .. } => *patient_id,
        }
    }
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn notify(&self, event: NotificationEvent) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn record(
        &self,
        action: &str,
        actor_id: Option<Uuid>,
        entity_id: Uuid,
        details: Value,
    ) -> anyhow::Result<()>;
}

/// Writes notification rows that the delivery worker drains.
pub struct SupabaseNotificationSender {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseNotificationSender {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }
}

#[async_trait]
impl NotificationSender for SupabaseNotificationSender {
    async fn notify(&self, event: NotificationEvent) -> anyhow::Result<()> {
        let body = json!({
            "recipient_id": event.recipient(),
            "payload": event,
            "status": "queued",
            "created_at": Utc::now().to_rfc3339(),
        });

        let _: Value = self
            .supabase
            .request(Method::POST, "/rest/v1/notifications", None, Some(body))
            .await?;

        debug!("Notification queued");
        Ok(())
    }
}

pub struct SupabaseAuditLogger {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseAuditLogger {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }
}

#[async_trait]
impl AuditLogger for SupabaseAuditLogger {
    async fn record(
        &self,
        action: &str,
        actor_id: Option<Uuid>,
        entity_id: Uuid,
        details: Value,
    ) -> anyhow::Result<()> {
        let body = json!({
            "action": action,
            "actor_id": actor_id,
            "entity_id": entity_id,
            "details": details,
            "created_at": Utc::now().to_rfc3339(),
        });

        let _: Value = self
            .supabase
            .request(Method::POST, "/rest/v1/audit_log", None, Some(body))
            .await?;

        Ok(())
    }
}

/// Fire-and-forget delivery. A lost notification never fails a booking; the
/// error is logged and the request proceeds.
pub fn dispatch(sender: Arc<dyn NotificationSender>, event: NotificationEvent) {
    tokio::spawn(async move {
        if let Err(e) = sender.notify(event).await {
            warn!("Notification delivery failed: {:#}", e);
        }
    });
}

/// Fire-and-forget audit write, same contract as `dispatch`.
pub fn audit(
    logger: Arc<dyn AuditLogger>,
    action: &'static str,
    actor_id: Option<Uuid>,
    entity_id: Uuid,
    details: Value,
) {
    tokio::spawn(async move {
        if let Err(e) = logger.record(action, actor_id, entity_id, details).await {
            warn!("Audit write failed for {}: {:#}", action, e);
        }
    });
}
