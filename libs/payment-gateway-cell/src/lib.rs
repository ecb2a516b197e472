pub mod models;
pub mod services;

pub use models::{
    CreateOrderRequest, GatewayCredentials, GatewayError, GatewayOrder, GatewayProvider,
    PaymentProof,
};
pub use services::cashfree::CashfreeGateway;
pub use services::credentials::CredentialsStore;
pub use services::razorpay::RazorpayGateway;
pub use services::{gateway_for, PaymentGateway};
