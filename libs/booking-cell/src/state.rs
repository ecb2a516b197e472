// libs/booking-cell/src/state.rs
use std::sync::Arc;

use shared_config::AppConfig;
use shared_database::SupabaseClient;

use crate::services::notify::{
    AuditLogger, NotificationSender, SupabaseAuditLogger, SupabaseNotificationSender,
};

/// Everything the booking cell needs at runtime, constructed once at startup
/// and shared across requests. Collaborators sit behind trait objects so
/// tests can swap in recorders.
pub struct BookingState {
    pub config: Arc<AppConfig>,
    /// PostgREST client carrying the caller's bearer token per request.
    pub supabase: Arc<SupabaseClient>,
    /// Service-role client for flows without a user session (webhooks,
    /// sweeper).
    pub service_supabase: Arc<SupabaseClient>,
    pub http: reqwest::Client,
    pub notifier: Arc<dyn NotificationSender>,
    pub audit: Arc<dyn AuditLogger>,
}

impl BookingState {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let http = reqwest::Client::new();
        let supabase = Arc::new(SupabaseClient::with_client(http.clone(), &config));
        let service_supabase = Arc::new(SupabaseClient::service(http.clone(), &config));
        let notifier = Arc::new(SupabaseNotificationSender::new(service_supabase.clone()));
        let audit = Arc::new(SupabaseAuditLogger::new(service_supabase.clone()));

        Self {
            config,
            supabase,
            service_supabase,
            http,
            notifier,
            audit,
        }
    }

    /// Test seam: same wiring as `new` but with injected collaborators.
    pub fn with_collaborators(
        config: Arc<AppConfig>,
        notifier: Arc<dyn NotificationSender>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        let http = reqwest::Client::new();
        let supabase = Arc::new(SupabaseClient::with_client(http.clone(), &config));
        let service_supabase = Arc::new(SupabaseClient::service(http.clone(), &config));

        Self {
            config,
            supabase,
            service_supabase,
            http,
            notifier,
            audit,
        }
    }
}
