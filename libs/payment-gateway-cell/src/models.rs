// libs/payment-gateway-cell/src/models.rs
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayProvider {
    Razorpay,
    Cashfree,
}

impl GatewayProvider {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "razorpay" => Some(GatewayProvider::Razorpay),
            "cashfree" => Some(GatewayProvider::Cashfree),
            _ => None,
        }
    }
}

impl fmt::Display for GatewayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayProvider::Razorpay => write!(f, "razorpay"),
            GatewayProvider::Cashfree => write!(f, "cashfree"),
        }
    }
}

/// Per-clinic gateway credentials, loaded from the `payment_gateways`
/// table. The webhook secret is distinct from the API secret for
/// providers that issue one (Razorpay); Cashfree signs webhooks with the
/// API secret itself.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayCredentials {
    pub clinic_id: Uuid,
    pub provider: GatewayProvider,
    pub api_key: String,
    pub api_secret: String,
    pub webhook_secret: Option<String>,
    pub is_active: bool,
}

impl GatewayCredentials {
    pub fn webhook_secret(&self) -> &str {
        self.webhook_secret.as_deref().unwrap_or(&self.api_secret)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOrderRequest {
    /// Amount in minor currency units (paise).
    pub amount: i64,
    pub currency: String,
    /// Application-generated reference, carried in provider metadata so the
    /// webhook reconciler can correlate even when the order id is lost.
    pub booking_ref: String,
    pub customer_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub provider: GatewayProvider,
    pub order_id: String,
    /// Cashfree hands the client a session token alongside the order id.
    pub payment_session_id: Option<String>,
    pub amount: i64,
    pub currency: String,
}

/// Caller-supplied proof of a completed checkout, verified locally against
/// the stored gateway secret.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum PaymentProof {
    Razorpay {
        order_id: String,
        payment_id: String,
        signature: String,
    },
    Cashfree {
        order_id: String,
        order_amount: String,
        reference_id: String,
        tx_status: String,
        signature: String,
    },
}

impl PaymentProof {
    pub fn provider(&self) -> GatewayProvider {
        match self {
            PaymentProof::Razorpay { .. } => GatewayProvider::Razorpay,
            PaymentProof::Cashfree { .. } => GatewayProvider::Cashfree,
        }
    }

    /// The gateway transaction id, used as the payment ledger idempotency
    /// key once verification succeeds.
    pub fn transaction_id(&self) -> &str {
        match self {
            PaymentProof::Razorpay { payment_id, .. } => payment_id,
            PaymentProof::Cashfree { reference_id, .. } => reference_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("No active {provider} gateway configured for clinic {clinic_id}")]
    NotConfigured {
        provider: GatewayProvider,
        clinic_id: Uuid,
    },

    #[error("Gateway API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Signature verification failed")]
    SignatureMismatch,

    #[error("Proof is for a different provider")]
    ProviderMismatch,

    #[error("Gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Credentials lookup failed: {0}")]
    CredentialsLookup(String),
}
