// libs/payment-gateway-cell/src/services/razorpay.rs
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::models::{
    CreateOrderRequest, GatewayCredentials, GatewayError, GatewayOrder, GatewayProvider,
    PaymentProof,
};
use crate::services::{decode_hex, PaymentGateway};

type HmacSha256 = Hmac<Sha256>;

pub struct RazorpayGateway {
    http: reqwest::Client,
    api_base: String,
    credentials: GatewayCredentials,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrderResponse {
    id: String,
    amount: i64,
    currency: String,
}

impl RazorpayGateway {
    pub fn new(http: reqwest::Client, api_base: String, credentials: GatewayCredentials) -> Self {
        Self {
            http,
            api_base,
            credentials,
        }
    }

    fn verify_hex_hmac(&self, secret: &str, message: &[u8], signature: &str) -> Result<(), GatewayError> {
        let expected = decode_hex(signature).ok_or(GatewayError::SignatureMismatch)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| GatewayError::SignatureMismatch)?;
        mac.update(message);
        mac.verify_slice(&expected)
            .map_err(|_| GatewayError::SignatureMismatch)
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn provider(&self) -> GatewayProvider {
        GatewayProvider::Razorpay
    }

    async fn create_order(&self, req: &CreateOrderRequest) -> Result<GatewayOrder, GatewayError> {
        let url = format!("{}/v1/orders", self.api_base);
        debug!("Creating Razorpay order for booking {}", req.booking_ref);

        let body = json!({
            "amount": req.amount,
            "currency": req.currency,
            "receipt": req.booking_ref,
            "notes": {
                "booking_ref": req.booking_ref,
                "customer_id": req.customer_id,
            }
        });

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.credentials.api_key, Some(&self.credentials.api_secret))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Razorpay order creation failed ({}): {}", status, body);
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let order: RazorpayOrderResponse = response.json().await?;

        Ok(GatewayOrder {
            provider: GatewayProvider::Razorpay,
            order_id: order.id,
            payment_session_id: None,
            amount: order.amount,
            currency: order.currency,
        })
    }

    fn verify_payment_proof(&self, proof: &PaymentProof) -> Result<(), GatewayError> {
        let PaymentProof::Razorpay {
            order_id,
            payment_id,
            signature,
        } = proof
        else {
            return Err(GatewayError::ProviderMismatch);
        };

        // Checkout proof is HMAC-SHA256 over "<order_id>|<payment_id>".
        let message = format!("{}|{}", order_id, payment_id);
        self.verify_hex_hmac(&self.credentials.api_secret, message.as_bytes(), signature)
    }

    fn verify_webhook_signature(
        &self,
        raw_body: &[u8],
        signature: &str,
        _timestamp: Option<&str>,
    ) -> Result<(), GatewayError> {
        // x-razorpay-signature is HMAC-SHA256 over the raw body, keyed by
        // the webhook secret configured in the dashboard.
        self.verify_hex_hmac(self.credentials.webhook_secret(), raw_body, signature)
    }
}
