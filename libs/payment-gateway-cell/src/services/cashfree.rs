// libs/payment-gateway-cell/src/services/cashfree.rs
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::models::{
    CreateOrderRequest, GatewayCredentials, GatewayError, GatewayOrder, GatewayProvider,
    PaymentProof,
};
use crate::services::PaymentGateway;

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2023-08-01";

pub struct CashfreeGateway {
    http: reqwest::Client,
    api_base: String,
    credentials: GatewayCredentials,
}

#[derive(Debug, Deserialize)]
struct CashfreeOrderResponse {
    order_id: String,
    payment_session_id: String,
    order_amount: f64,
    order_currency: String,
}

impl CashfreeGateway {
    pub fn new(http: reqwest::Client, api_base: String, credentials: GatewayCredentials) -> Self {
        Self {
            http,
            api_base,
            credentials,
        }
    }

    fn verify_base64_hmac(&self, secret: &str, message: &[u8], signature: &str) -> Result<(), GatewayError> {
        let expected = BASE64
            .decode(signature)
            .map_err(|_| GatewayError::SignatureMismatch)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| GatewayError::SignatureMismatch)?;
        mac.update(message);
        mac.verify_slice(&expected)
            .map_err(|_| GatewayError::SignatureMismatch)
    }
}

#[async_trait]
impl PaymentGateway for CashfreeGateway {
    fn provider(&self) -> GatewayProvider {
        GatewayProvider::Cashfree
    }

    async fn create_order(&self, req: &CreateOrderRequest) -> Result<GatewayOrder, GatewayError> {
        let url = format!("{}/pg/orders", self.api_base);
        debug!("Creating Cashfree order for booking {}", req.booking_ref);

        // Cashfree takes the amount in major units.
        let body = json!({
            "order_id": req.booking_ref,
            "order_amount": req.amount as f64 / 100.0,
            "order_currency": req.currency,
            "customer_details": {
                "customer_id": req.customer_id,
            },
            "order_tags": {
                "booking_ref": req.booking_ref,
            }
        });

        let response = self
            .http
            .post(&url)
            .header("x-client-id", &self.credentials.api_key)
            .header("x-client-secret", &self.credentials.api_secret)
            .header("x-api-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Cashfree order creation failed ({}): {}", status, body);
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let order: CashfreeOrderResponse = response.json().await?;

        Ok(GatewayOrder {
            provider: GatewayProvider::Cashfree,
            order_id: order.order_id,
            payment_session_id: Some(order.payment_session_id),
            amount: (order.order_amount * 100.0).round() as i64,
            currency: order.order_currency,
        })
    }

    fn verify_payment_proof(&self, proof: &PaymentProof) -> Result<(), GatewayError> {
        let PaymentProof::Cashfree {
            order_id,
            order_amount,
            reference_id,
            tx_status,
            signature,
        } = proof
        else {
            return Err(GatewayError::ProviderMismatch);
        };

        // Checkout proof is base64 HMAC-SHA256 over the concatenated
        // transaction fields, in this exact order.
        let message = format!("{}{}{}{}", order_id, order_amount, reference_id, tx_status);
        self.verify_base64_hmac(&self.credentials.api_secret, message.as_bytes(), signature)
    }

    fn verify_webhook_signature(
        &self,
        raw_body: &[u8],
        signature: &str,
        timestamp: Option<&str>,
    ) -> Result<(), GatewayError> {
        // x-webhook-signature is base64 HMAC-SHA256 over
        // "<x-webhook-timestamp><raw body>".
        let timestamp = timestamp.ok_or(GatewayError::SignatureMismatch)?;
        let mut message = Vec::with_capacity(timestamp.len() + raw_body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(raw_body);
        self.verify_base64_hmac(self.credentials.webhook_secret(), &message, signature)
    }
}
