//! Configuration for the payment reconciliation core

use crate::error::{PaymentError, PaymentResult};
use crate::gateway::PaypalConfig;

/// Webhook secrets and gateway API credentials
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub stripe_webhook_secret: String,
    pub razorpay_webhook_secret: String,
    pub paypal: PaypalConfig,
}

impl PaymentConfig {
    /// Load configuration from environment variables.
    ///
    /// Required: `STRIPE_WEBHOOK_SECRET`, `RAZORPAY_WEBHOOK_SECRET`,
    /// `PAYPAL_CLIENT_ID`, `PAYPAL_CLIENT_SECRET`, `PAYPAL_WEBHOOK_ID`.
    /// Optional: `PAYPAL_API_BASE` (defaults to the live endpoint).
    pub fn from_env() -> PaymentResult<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            stripe_webhook_secret: require_env("STRIPE_WEBHOOK_SECRET")?,
            razorpay_webhook_secret: require_env("RAZORPAY_WEBHOOK_SECRET")?,
            paypal: PaypalConfig {
                client_id: require_env("PAYPAL_CLIENT_ID")?,
                client_secret: require_env("PAYPAL_CLIENT_SECRET")?,
                webhook_id: require_env("PAYPAL_WEBHOOK_ID")?,
                api_base: std::env::var("PAYPAL_API_BASE")
                    .unwrap_or_else(|_| PaypalConfig::LIVE_API_BASE.to_string()),
            },
        })
    }
}

fn require_env(name: &str) -> PaymentResult<String> {
    std::env::var(name).map_err(|_| PaymentError::Config(format!("{} is not set", name)))
}
