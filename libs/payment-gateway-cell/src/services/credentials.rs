// libs/payment-gateway-cell/src/services/credentials.rs
use reqwest::Method;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use shared_database::SupabaseClient;

use crate::models::{GatewayCredentials, GatewayError, GatewayProvider};

/// Read-only lookup of per-clinic gateway credentials.
pub struct CredentialsStore {
    supabase: Arc<SupabaseClient>,
}

impl CredentialsStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    /// Resolve the active gateway configuration for a clinic. A missing or
    /// deactivated row is a misconfiguration the caller surfaces as a 500
    /// with a descriptive message, not a silent fallback.
    pub async fn active_gateway(
        &self,
        clinic_id: Uuid,
        provider: GatewayProvider,
        auth_token: Option<&str>,
    ) -> Result<GatewayCredentials, GatewayError> {
        debug!("Resolving {} credentials for clinic {}", provider, clinic_id);

        let path = format!(
            "/rest/v1/payment_gateways?clinic_id=eq.{}&provider=eq.{}&is_active=eq.true&limit=1",
            clinic_id, provider
        );

        let rows: Vec<GatewayCredentials> = self
            .supabase
            .request(Method::GET, &path, auth_token, None)
            .await
            .map_err(|e| GatewayError::CredentialsLookup(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or(GatewayError::NotConfigured {
                provider,
                clinic_id,
            })
    }
}
