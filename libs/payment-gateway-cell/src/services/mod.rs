pub mod cashfree;
pub mod credentials;
pub mod razorpay;

use async_trait::async_trait;

use crate::models::{
    CreateOrderRequest, GatewayCredentials, GatewayError, GatewayOrder, GatewayProvider,
    PaymentProof,
};

/// Uniform interface over the interchangeable payment providers. One
/// instance is scoped to a single clinic's credentials; the HTTP client is
/// shared process-wide and injected at construction.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> GatewayProvider;

    async fn create_order(&self, req: &CreateOrderRequest) -> Result<GatewayOrder, GatewayError>;

    /// Recompute the provider's integrity proof from the stored secret and
    /// compare against the caller-supplied one. Byte-for-byte, constant
    /// time.
    fn verify_payment_proof(&self, proof: &PaymentProof) -> Result<(), GatewayError>;

    /// Verify a webhook delivery over the raw request body. `timestamp`
    /// comes from a companion header for providers that include it in the
    /// signed payload.
    fn verify_webhook_signature(
        &self,
        raw_body: &[u8],
        signature: &str,
        timestamp: Option<&str>,
    ) -> Result<(), GatewayError>;
}

pub fn gateway_for(
    credentials: GatewayCredentials,
    http: reqwest::Client,
    razorpay_api_base: &str,
    cashfree_api_base: &str,
) -> Box<dyn PaymentGateway> {
    match credentials.provider {
        GatewayProvider::Razorpay => Box::new(razorpay::RazorpayGateway::new(
            http,
            razorpay_api_base.to_string(),
            credentials,
        )),
        GatewayProvider::Cashfree => Box::new(cashfree::CashfreeGateway::new(
            http,
            cashfree_api_base.to_string(),
            credentials,
        )),
    }
}

/// Decode a lowercase/uppercase hex signature into raw bytes. Returns
/// `None` on odd length or non-hex characters.
pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
