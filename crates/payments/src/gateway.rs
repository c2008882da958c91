//! Gateway collaborator boundary
//!
//! The reconciliation core depends on gateway CONTRACTS (identifiers,
//! webhook shapes, a live status fetch) but does not own the SDKs. The
//! traits here are the seam: production wires real clients, tests wire
//! doubles.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{PaymentError, PaymentResult};
use crate::transactions::Transaction;

/// Subscription status as reported by a gateway's live API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewaySubscriptionStatus {
    Active,
    Completed,
    Cancelled,
    Halted,
    Authenticated,
    Pending,
    Other(String),
}

impl GatewaySubscriptionStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "active" => GatewaySubscriptionStatus::Active,
            "completed" => GatewaySubscriptionStatus::Completed,
            "cancelled" | "canceled" | "expired" => GatewaySubscriptionStatus::Cancelled,
            "halted" | "suspended" => GatewaySubscriptionStatus::Halted,
            "authenticated" => GatewaySubscriptionStatus::Authenticated,
            "created" | "pending" => GatewaySubscriptionStatus::Pending,
            other => GatewaySubscriptionStatus::Other(other.to_string()),
        }
    }
}

/// Live subscription-status fetch.
///
/// Webhook payloads embed a status, but payloads can be stale or replayed;
/// implementations must hit the gateway's API, not echo the payload.
#[async_trait]
pub trait SubscriptionStatusFetcher: Send + Sync {
    async fn fetch_status(
        &self,
        external_subscription_id: &str,
    ) -> PaymentResult<GatewaySubscriptionStatus>;
}

/// PayPal signature verification headers, forwarded by the HTTP layer
#[derive(Debug, Clone)]
pub struct PaypalSignatureHeaders {
    pub transmission_id: String,
    pub transmission_time: String,
    pub cert_url: String,
    pub auth_algo: String,
    pub transmission_sig: String,
}

/// PayPal webhook verification.
///
/// Unlike Stripe/Razorpay, PayPal signatures are not verified with a local
/// HMAC; PayPal exposes a verification API call instead.
#[async_trait]
pub trait PaypalWebhookVerifier: Send + Sync {
    async fn verify(
        &self,
        headers: &PaypalSignatureHeaders,
        event: &serde_json::Value,
    ) -> PaymentResult<bool>;
}

/// Post-payment notification hooks owned by external collaborators
/// (invoice email, library/access updates). Failures here are logged by the
/// pipeline and never roll back financial state.
#[async_trait]
pub trait PurchaseNotifier: Send + Sync {
    async fn purchase_completed(&self, transaction: &Transaction) -> PaymentResult<()>;
    async fn invoice_ready(&self, transaction: &Transaction) -> PaymentResult<()>;
}

/// Default notifier that only logs; used until a collaborator is wired in
pub struct LogOnlyNotifier;

#[async_trait]
impl PurchaseNotifier for LogOnlyNotifier {
    async fn purchase_completed(&self, transaction: &Transaction) -> PaymentResult<()> {
        tracing::info!(
            transaction_id = %transaction.id,
            user_id = %transaction.user_id,
            "Purchase completed (no notifier configured)"
        );
        Ok(())
    }

    async fn invoice_ready(&self, transaction: &Transaction) -> PaymentResult<()> {
        tracing::info!(
            transaction_id = %transaction.id,
            invoice_number = ?transaction.invoice_number,
            "Invoice ready (no notifier configured)"
        );
        Ok(())
    }
}

/// PayPal API configuration
#[derive(Debug, Clone)]
pub struct PaypalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: String,
    pub api_base: String,
}

impl PaypalConfig {
    pub const LIVE_API_BASE: &'static str = "https://api-m.paypal.com";
}

#[derive(Debug, Deserialize)]
struct OauthTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    verification_status: String,
}

/// reqwest-backed implementation of PayPal's verify-webhook-signature API.
///
/// All outbound calls carry a bounded timeout so a hanging gateway cannot
/// pin webhook workers during an outage.
pub struct PaypalVerificationClient {
    config: PaypalConfig,
    http: reqwest::Client,
}

impl PaypalVerificationClient {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(config: PaypalConfig) -> PaymentResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PaymentError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    async fn access_token(&self) -> PaymentResult<String> {
        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.config.api_base))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PaymentError::Gateway(format!(
                "PayPal token request failed with status {}",
                response.status()
            )));
        }

        let token: OauthTokenResponse = response.json().await?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl PaypalWebhookVerifier for PaypalVerificationClient {
    async fn verify(
        &self,
        headers: &PaypalSignatureHeaders,
        event: &serde_json::Value,
    ) -> PaymentResult<bool> {
        let token = self.access_token().await?;

        let body = serde_json::json!({
            "transmission_id": headers.transmission_id,
            "transmission_time": headers.transmission_time,
            "cert_url": headers.cert_url,
            "auth_algo": headers.auth_algo,
            "transmission_sig": headers.transmission_sig,
            "webhook_id": self.config.webhook_id,
            "webhook_event": event,
        });

        let response = self
            .http
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.config.api_base
            ))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PaymentError::Gateway(format!(
                "PayPal verification request failed with status {}",
                response.status()
            )));
        }

        let verification: VerifyResponse = response.json().await?;
        Ok(verification.verification_status == "SUCCESS")
    }
}
