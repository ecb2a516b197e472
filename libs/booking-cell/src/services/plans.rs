// libs/booking-cell/src/services/plans.rs
use reqwest::Method;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use shared_database::SupabaseClient;

use crate::models::{BookingError, ClinicPlan};

/// Subscription lookup backing the online-payment gate. Clinics without an
/// active plan row fall back to the basic plan, which does not include
/// online payments.
pub struct PlanService {
    supabase: Arc<SupabaseClient>,
}

impl PlanService {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    pub async fn plan_for_clinic(
        &self,
        clinic_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<ClinicPlan, BookingError> {
        let path = format!(
            "/rest/v1/clinic_plans?clinic_id=eq.{}&status=eq.active&limit=1",
            clinic_id
        );

        let rows: Vec<ClinicPlan> = self
            .supabase
            .request(Method::GET, &path, auth_token, None)
            .await?;

        Ok(rows.into_iter().next().unwrap_or_else(|| {
            debug!("No active plan for clinic {}, assuming basic", clinic_id);
            ClinicPlan::basic(clinic_id)
        }))
    }
}
