//! Webhook processing pipeline
//!
//! Control flow per delivery: signature verification, then the event-dedup
//! gate, then reconciliation, then post-commit notifications. The dedup
//! insert and every financial or lifecycle mutation share one database
//! transaction, so the uncommitted dedup row serializes concurrent
//! duplicates on the uniqueness constraint, and a processing failure rolls
//! the dedup row back for the gateway's retry. Subscription activation for
//! a paid artist subscription rides the same transaction as the paid flip
//! and the ledger credit.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::PgPool;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::PaymentConfig;
use crate::correlation::{Gateway, GatewayCorrelation, ItemType};
use crate::dedup::EventDedupLedger;
use crate::error::{PaymentError, PaymentResult};
use crate::gateway::{PaypalSignatureHeaders, PaypalWebhookVerifier, PurchaseNotifier, SubscriptionStatusFetcher};
use crate::reconcile::ReconciliationEngine;
use crate::subscriptions::SubscriptionLifecycle;
use crate::transactions::Transaction;

type HmacSha256 = Hmac<Sha256>;

/// Stripe rejects events older than this relative to the signature timestamp
const STRIPE_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// How a webhook delivery was resolved. Every variant maps to HTTP 200;
/// only `PaymentError`s surface as non-2xx (inviting gateway retry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event caused a state transition
    Processed,
    /// Event ID already recorded; no side effects
    Duplicate,
    /// Event type has no handler; durably recorded
    Ignored,
    /// Event correlates to no known transaction; durably recorded
    Unknown,
}

/// Stripe event envelope: `{id, type, data: {object}}`
#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

/// Razorpay event envelope: `{event, payload}`. The event ID travels in the
/// `x-razorpay-event-id` header, not the body.
#[derive(Debug, Deserialize)]
pub struct RazorpayEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

/// PayPal event envelope: `{id, event_type, resource}`
#[derive(Debug, Deserialize)]
pub struct PaypalEvent {
    pub id: String,
    pub event_type: String,
    pub resource: serde_json::Value,
}

/// Webhook-driven reconciliation pipeline
pub struct WebhookProcessor {
    pool: PgPool,
    config: PaymentConfig,
    razorpay_status: Arc<dyn SubscriptionStatusFetcher>,
    paypal_verifier: Arc<dyn PaypalWebhookVerifier>,
    notifier: Arc<dyn PurchaseNotifier>,
}

impl WebhookProcessor {
    pub fn new(
        pool: PgPool,
        config: PaymentConfig,
        razorpay_status: Arc<dyn SubscriptionStatusFetcher>,
        paypal_verifier: Arc<dyn PaypalWebhookVerifier>,
        notifier: Arc<dyn PurchaseNotifier>,
    ) -> Self {
        Self {
            pool,
            config,
            razorpay_status,
            paypal_verifier,
            notifier,
        }
    }

    // ------------------------------------------------------------------
    // Stripe
    // ------------------------------------------------------------------

    /// Verify and process a Stripe webhook delivery
    pub async fn handle_stripe(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> PaymentResult<WebhookOutcome> {
        verify_stripe_signature(
            &self.config.stripe_webhook_secret,
            payload,
            signature_header,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let event: StripeEvent = serde_json::from_str(payload)
            .map_err(|e| PaymentError::InvalidPayload(format!("Stripe event: {}", e)))?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        let object = &event.data.object;

        match event.event_type.as_str() {
            "payment_intent.succeeded" => {
                let correlation = GatewayCorrelation::Stripe {
                    payment_intent_id: string_field(object, "id"),
                    subscription_id: None,
                };
                self.process_paid(Gateway::Stripe, &event.id, &event.event_type, &correlation, None)
                    .await
            }
            "invoice.payment_succeeded" => {
                // Recurring billing: correlate via the subscription the
                // invoice belongs to, not the invoice's own identifiers.
                let correlation = GatewayCorrelation::Stripe {
                    payment_intent_id: None,
                    subscription_id: string_field(object, "subscription"),
                };
                let period_end = object
                    .get("period_end")
                    .and_then(|v| v.as_i64())
                    .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
                self.process_paid(
                    Gateway::Stripe,
                    &event.id,
                    &event.event_type,
                    &correlation,
                    period_end,
                )
                .await
            }
            "payment_intent.payment_failed" => {
                let correlation = GatewayCorrelation::Stripe {
                    payment_intent_id: string_field(object, "id"),
                    subscription_id: None,
                };
                self.process_failed(Gateway::Stripe, &event.id, &event.event_type, &correlation)
                    .await
            }
            "invoice.payment_failed" => {
                let correlation = GatewayCorrelation::Stripe {
                    payment_intent_id: None,
                    subscription_id: string_field(object, "subscription"),
                };
                self.process_failed(Gateway::Stripe, &event.id, &event.event_type, &correlation)
                    .await
            }
            "customer.subscription.deleted" => {
                self.process_gateway_cancellation(
                    Gateway::Stripe,
                    &event.id,
                    &event.event_type,
                    string_field(object, "id").as_deref(),
                )
                .await
            }
            _ => {
                self.record_unhandled(Gateway::Stripe, &event.id, &event.event_type)
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Razorpay
    // ------------------------------------------------------------------

    /// Verify and process a Razorpay webhook delivery.
    /// `event_id` comes from the `x-razorpay-event-id` header.
    pub async fn handle_razorpay(
        &self,
        payload: &str,
        signature: &str,
        event_id: &str,
    ) -> PaymentResult<WebhookOutcome> {
        verify_razorpay_signature(&self.config.razorpay_webhook_secret, payload, signature)?;

        let event: RazorpayEvent = serde_json::from_str(payload)
            .map_err(|e| PaymentError::InvalidPayload(format!("Razorpay event: {}", e)))?;

        tracing::info!(
            event_id = %event_id,
            event_type = %event.event,
            "Processing Razorpay webhook event"
        );

        match event.event.as_str() {
            "payment.captured" => {
                let payment = event
                    .payload
                    .pointer("/payment/entity")
                    .ok_or_else(|| {
                        PaymentError::InvalidPayload("payment.captured without payment entity".to_string())
                    })?;
                let correlation = GatewayCorrelation::Razorpay {
                    subscription_id: None,
                    order_id: string_field(payment, "order_id"),
                    payment_id: string_field(payment, "id"),
                };
                self.process_paid(Gateway::Razorpay, event_id, &event.event, &correlation, None)
                    .await
            }
            "subscription.charged" => {
                let subscription = event
                    .payload
                    .pointer("/subscription/entity")
                    .ok_or_else(|| {
                        PaymentError::InvalidPayload(
                            "subscription.charged without subscription entity".to_string(),
                        )
                    })?;
                let correlation = GatewayCorrelation::Razorpay {
                    subscription_id: string_field(subscription, "id"),
                    order_id: None,
                    payment_id: event
                        .payload
                        .pointer("/payment/entity")
                        .and_then(|p| string_field(p, "id")),
                };
                // Razorpay reports the current billing period end as a unix
                // timestamp; authoritative over local clock math.
                let period_end = subscription
                    .get("current_end")
                    .and_then(|v| v.as_i64())
                    .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
                self.process_paid(
                    Gateway::Razorpay,
                    event_id,
                    &event.event,
                    &correlation,
                    period_end,
                )
                .await
            }
            "subscription.activated"
            | "subscription.cancelled"
            | "subscription.halted"
            | "subscription.completed"
            | "subscription.authenticated" => {
                let external_id = event
                    .payload
                    .pointer("/subscription/entity")
                    .and_then(|s| string_field(s, "id"));
                self.process_lifecycle_sync(
                    Gateway::Razorpay,
                    event_id,
                    &event.event,
                    external_id.as_deref(),
                )
                .await
            }
            _ => {
                self.record_unhandled(Gateway::Razorpay, event_id, &event.event)
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // PayPal
    // ------------------------------------------------------------------

    /// Verify (via PayPal's verification API) and process a PayPal delivery
    pub async fn handle_paypal(
        &self,
        payload: &str,
        headers: &PaypalSignatureHeaders,
    ) -> PaymentResult<WebhookOutcome> {
        let raw: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| PaymentError::InvalidPayload(format!("PayPal event: {}", e)))?;

        let verified = self.paypal_verifier.verify(headers, &raw).await?;
        if !verified {
            tracing::warn!("PayPal webhook signature verification failed");
            return Err(PaymentError::SignatureInvalid);
        }

        let event: PaypalEvent = serde_json::from_value(raw)
            .map_err(|e| PaymentError::InvalidPayload(format!("PayPal event: {}", e)))?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing PayPal webhook event"
        );

        let resource = &event.resource;

        match event.event_type.as_str() {
            "PAYMENT.CAPTURE.COMPLETED" => {
                // The capture's parent order is what we stored at creation.
                let payment_id = resource
                    .pointer("/supplementary_data/related_ids/order_id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .or_else(|| string_field(resource, "id"));
                let correlation = GatewayCorrelation::Paypal {
                    subscription_id: None,
                    payment_id,
                };
                self.process_paid(Gateway::Paypal, &event.id, &event.event_type, &correlation, None)
                    .await
            }
            "BILLING.SUBSCRIPTION.ACTIVATED" | "BILLING.SUBSCRIPTION.RENEWED" => {
                let correlation = GatewayCorrelation::Paypal {
                    subscription_id: string_field(resource, "id"),
                    payment_id: None,
                };
                let period_end = resource
                    .pointer("/billing_info/next_billing_time")
                    .and_then(|v| v.as_str())
                    .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());
                self.process_paid(
                    Gateway::Paypal,
                    &event.id,
                    &event.event_type,
                    &correlation,
                    period_end,
                )
                .await
            }
            "BILLING.SUBSCRIPTION.CANCELLED" | "BILLING.SUBSCRIPTION.EXPIRED" => {
                self.process_gateway_cancellation(
                    Gateway::Paypal,
                    &event.id,
                    &event.event_type,
                    string_field(resource, "id").as_deref(),
                )
                .await
            }
            _ => {
                self.record_unhandled(Gateway::Paypal, &event.id, &event.event_type)
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Pipeline stages
    // ------------------------------------------------------------------

    /// Dedup gate, paid reconciliation and (for artist subscriptions)
    /// activation in one transaction, then post-commit notifications.
    async fn process_paid(
        &self,
        gateway: Gateway,
        event_id: &str,
        event_type: &str,
        correlation: &GatewayCorrelation,
        period_end_hint: Option<OffsetDateTime>,
    ) -> PaymentResult<WebhookOutcome> {
        let mut tx = self.pool.begin().await?;

        if !EventDedupLedger::record_if_new(&mut tx, gateway, event_id, event_type).await? {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event, acknowledging without reprocessing"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        let reconciled = ReconciliationEngine::mark_paid_in_tx(&mut tx, correlation).await?;

        let Some(reconciled) = reconciled else {
            // Commit anyway: the event is durably recorded as intentionally
            // ignored, so redeliveries short-circuit.
            tx.commit().await?;
            tracing::warn!(
                event_id = %event_id,
                event_type = %event_type,
                gateway = %gateway,
                "Webhook event matches no transaction, acknowledged without mutation"
            );
            return Ok(WebhookOutcome::Unknown);
        };

        // Subscription activation joins the paid flip and the ledger credit
        // in the same atomic unit. An activation failure rolls everything
        // back, dedup row included, so the gateway's retry reprocesses the
        // event instead of leaving a paid-but-unactivated subscription.
        if reconciled.newly_paid
            && reconciled.transaction.item_type() == Some(ItemType::ArtistSubscription)
        {
            SubscriptionLifecycle::activate_or_renew_in_tx(
                &mut tx,
                &reconciled.transaction,
                reconciled.transaction.subscription_id.as_deref(),
                period_end_hint,
            )
            .await?;
        }

        tx.commit().await?;

        if reconciled.newly_paid {
            self.notify_paid(&reconciled.transaction).await;
        }

        Ok(WebhookOutcome::Processed)
    }

    /// Dedup gate + failed reconciliation in one transaction
    async fn process_failed(
        &self,
        gateway: Gateway,
        event_id: &str,
        event_type: &str,
        correlation: &GatewayCorrelation,
    ) -> PaymentResult<WebhookOutcome> {
        let mut tx = self.pool.begin().await?;

        if !EventDedupLedger::record_if_new(&mut tx, gateway, event_id, event_type).await? {
            return Ok(WebhookOutcome::Duplicate);
        }

        let transaction = ReconciliationEngine::mark_failed_in_tx(&mut tx, correlation).await?;
        tx.commit().await?;

        match transaction {
            Some(_) => Ok(WebhookOutcome::Processed),
            None => Ok(WebhookOutcome::Unknown),
        }
    }

    /// Dedup gate + gateway-initiated cancellation, in one transaction.
    /// A concurrent duplicate blocks on the dedup uniqueness constraint
    /// until the first delivery commits.
    async fn process_gateway_cancellation(
        &self,
        gateway: Gateway,
        event_id: &str,
        event_type: &str,
        external_subscription_id: Option<&str>,
    ) -> PaymentResult<WebhookOutcome> {
        let Some(external_id) = external_subscription_id else {
            return Err(PaymentError::InvalidPayload(format!(
                "{} event without subscription ID",
                event_type
            )));
        };

        let mut tx = self.pool.begin().await?;

        if !EventDedupLedger::record_if_new(&mut tx, gateway, event_id, event_type).await? {
            return Ok(WebhookOutcome::Duplicate);
        }

        let cancelled = SubscriptionLifecycle::cancel_by_gateway_in_tx(&mut tx, external_id).await?;
        tx.commit().await?;

        match cancelled {
            Some(_) => Ok(WebhookOutcome::Processed),
            None => Ok(WebhookOutcome::Unknown),
        }
    }

    /// Dedup gate + gateway-truth status sync for subscription lifecycle
    /// events. The webhook payload's embedded status is never trusted.
    async fn process_lifecycle_sync(
        &self,
        gateway: Gateway,
        event_id: &str,
        event_type: &str,
        external_subscription_id: Option<&str>,
    ) -> PaymentResult<WebhookOutcome> {
        let Some(external_id) = external_subscription_id else {
            return Err(PaymentError::InvalidPayload(format!(
                "{} event without subscription ID",
                event_type
            )));
        };

        // Live-fetch the status before opening the transaction; a pool
        // connection must not sit idle-in-transaction across a gateway call.
        let gateway_status = self.razorpay_status.fetch_status(external_id).await?;

        let mut tx = self.pool.begin().await?;

        if !EventDedupLedger::record_if_new(&mut tx, gateway, event_id, event_type).await? {
            return Ok(WebhookOutcome::Duplicate);
        }

        let synced =
            SubscriptionLifecycle::apply_gateway_status_in_tx(&mut tx, external_id, &gateway_status)
                .await?;
        tx.commit().await?;

        match synced {
            Some(_) => Ok(WebhookOutcome::Processed),
            None => Ok(WebhookOutcome::Unknown),
        }
    }

    /// Durably record an event type we do not handle
    async fn record_unhandled(
        &self,
        gateway: Gateway,
        event_id: &str,
        event_type: &str,
    ) -> PaymentResult<WebhookOutcome> {
        let dedup = EventDedupLedger::new(self.pool.clone());
        let is_new = dedup.record_ignored(gateway, event_id, event_type).await?;

        if !is_new {
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            gateway = %gateway,
            "Received unhandled webhook event type, no handler configured"
        );

        Ok(WebhookOutcome::Ignored)
    }

    /// Post-commit collaborator notifications for a fresh paid transition.
    /// Notifier failures are logged and never unwind committed financial
    /// state.
    async fn notify_paid(&self, transaction: &Transaction) {
        if let Err(e) = self.notifier.purchase_completed(transaction).await {
            tracing::error!(
                transaction_id = %transaction.id,
                error = %e,
                "Failed to send purchase notification"
            );
        }

        if let Err(e) = self.notifier.invoice_ready(transaction).await {
            tracing::error!(
                transaction_id = %transaction.id,
                error = %e,
                "Failed to send invoice notification"
            );
        }
    }
}

/// Extract an owned string field from a JSON object
fn string_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// Verify a Stripe signature header (`t=...,v1=...`): HMAC-SHA256 over
/// `"{t}.{payload}"`, with a bounded timestamp tolerance.
pub fn verify_stripe_signature(
    webhook_secret: &str,
    payload: &str,
    signature_header: &str,
    now_unix: i64,
) -> PaymentResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1]),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(PaymentError::SignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(PaymentError::SignatureInvalid)?;

    if (now_unix - timestamp).abs() > STRIPE_TIMESTAMP_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Stripe webhook timestamp outside tolerance"
        );
        return Err(PaymentError::SignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| PaymentError::SignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed.as_bytes().ct_eq(v1_signature.as_bytes()).into() {
        Ok(())
    } else {
        tracing::warn!("Stripe webhook signature mismatch");
        Err(PaymentError::SignatureInvalid)
    }
}

/// Verify a Razorpay signature: HMAC-SHA256 hex over the raw body
pub fn verify_razorpay_signature(
    webhook_secret: &str,
    payload: &str,
    signature: &str,
) -> PaymentResult<()> {
    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|_| PaymentError::SignatureInvalid)?;
    mac.update(payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed.as_bytes().ct_eq(signature.as_bytes()).into() {
        Ok(())
    } else {
        tracing::warn!("Razorpay webhook signature mismatch");
        Err(PaymentError::SignatureInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stripe_header_for(secret: &str, payload: &str, timestamp: i64) -> String {
        let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn test_stripe_signature_valid() {
        let secret = "whsec_test_secret";
        let payload = r#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;
        let now = 1_700_000_000;
        let header = stripe_header_for(secret, payload, now);

        assert!(verify_stripe_signature(secret, payload, &header, now).is_ok());
    }

    #[test]
    fn test_stripe_signature_tampered_payload() {
        let secret = "whsec_test_secret";
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = stripe_header_for(secret, payload, now);

        let result = verify_stripe_signature(secret, r#"{"id":"evt_2"}"#, &header, now);
        assert!(matches!(result, Err(PaymentError::SignatureInvalid)));
    }

    #[test]
    fn test_stripe_signature_stale_timestamp() {
        let secret = "whsec_test_secret";
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let header = stripe_header_for(secret, payload, signed_at);

        // 6 minutes later: outside the 5-minute tolerance
        let result = verify_stripe_signature(secret, payload, &header, signed_at + 360);
        assert!(matches!(result, Err(PaymentError::SignatureInvalid)));
    }

    #[test]
    fn test_stripe_signature_malformed_header() {
        let result =
            verify_stripe_signature("whsec_x", "{}", "not-a-signature-header", 1_700_000_000);
        assert!(matches!(result, Err(PaymentError::SignatureInvalid)));
    }

    #[test]
    fn test_razorpay_signature_round_trip() {
        let secret = "rzp_webhook_secret";
        let payload = r#"{"event":"payment.captured"}"#;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());

        assert!(verify_razorpay_signature(secret, payload, &sig).is_ok());
        assert!(matches!(
            verify_razorpay_signature(secret, payload, "deadbeef"),
            Err(PaymentError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_stripe_event_envelope_parses() {
        let payload = r#"{
            "id": "evt_123",
            "type": "invoice.payment_succeeded",
            "data": {"object": {"subscription": "sub_9", "period_end": 1700000000}}
        }"#;
        let event: StripeEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(event.event_type, "invoice.payment_succeeded");
        assert_eq!(
            string_field(&event.data.object, "subscription").as_deref(),
            Some("sub_9")
        );
    }

    #[test]
    fn test_razorpay_event_envelope_parses() {
        let payload = r#"{
            "event": "subscription.charged",
            "payload": {
                "subscription": {"entity": {"id": "sub_r1", "current_end": 1700000000}},
                "payment": {"entity": {"id": "pay_r1"}}
            }
        }"#;
        let event: RazorpayEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.event, "subscription.charged");
        let sub = event.payload.pointer("/subscription/entity").unwrap();
        assert_eq!(string_field(sub, "id").as_deref(), Some("sub_r1"));
    }

    #[test]
    fn test_paypal_event_envelope_parses() {
        let payload = r#"{
            "id": "WH-evt-1",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "cap_1",
                "supplementary_data": {"related_ids": {"order_id": "ord_1"}}
            }
        }"#;
        let event: PaypalEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.event_type, "PAYMENT.CAPTURE.COMPLETED");
        assert_eq!(
            event
                .resource
                .pointer("/supplementary_data/related_ids/order_id")
                .and_then(|v| v.as_str()),
            Some("ord_1")
        );
    }

    // ------------------------------------------------------------------
    // Database-backed pipeline tests
    // ------------------------------------------------------------------

    use crate::correlation::ItemType;
    use crate::gateway::{GatewaySubscriptionStatus, LogOnlyNotifier, PaypalConfig};
    use crate::ledger::ArtistEarningsLedger;
    use crate::subscriptions::{SubscriptionLifecycle, SUB_ACTIVE, SUB_CANCELLED};
    use crate::transactions::{NewTransaction, TransactionStore};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    const TEST_STRIPE_SECRET: &str = "whsec_test_secret";
    const TEST_RAZORPAY_SECRET: &str = "rzp_webhook_secret";

    struct FixedStatusFetcher(GatewaySubscriptionStatus);

    #[async_trait::async_trait]
    impl SubscriptionStatusFetcher for FixedStatusFetcher {
        async fn fetch_status(&self, _id: &str) -> PaymentResult<GatewaySubscriptionStatus> {
            Ok(self.0.clone())
        }
    }

    struct ApproveAllVerifier;

    #[async_trait::async_trait]
    impl PaypalWebhookVerifier for ApproveAllVerifier {
        async fn verify(
            &self,
            _headers: &PaypalSignatureHeaders,
            _event: &serde_json::Value,
        ) -> PaymentResult<bool> {
            Ok(true)
        }
    }

    fn test_processor(pool: PgPool, status: GatewaySubscriptionStatus) -> WebhookProcessor {
        WebhookProcessor::new(
            pool,
            PaymentConfig {
                stripe_webhook_secret: TEST_STRIPE_SECRET.to_string(),
                razorpay_webhook_secret: TEST_RAZORPAY_SECRET.to_string(),
                paypal: PaypalConfig {
                    client_id: "cid".to_string(),
                    client_secret: "cs".to_string(),
                    webhook_id: "wh_1".to_string(),
                    api_base: "http://localhost:1".to_string(),
                },
            },
            Arc::new(FixedStatusFetcher(status)),
            Arc::new(ApproveAllVerifier),
            Arc::new(LogOnlyNotifier),
        )
    }

    fn razorpay_signature_for(payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(TEST_RAZORPAY_SECRET.as_bytes()).unwrap();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn create_pending(
        pool: &PgPool,
        item_type: ItemType,
        amount: rust_decimal::Decimal,
        platform_fee: rust_decimal::Decimal,
        currency: &str,
        correlation: GatewayCorrelation,
        metadata: Option<serde_json::Value>,
    ) -> Transaction {
        TransactionStore::new(pool.clone())
            .create_pending(NewTransaction {
                user_id: Uuid::new_v4(),
                artist_id: Uuid::new_v4(),
                item_type,
                item_id: Uuid::new_v4(),
                amount,
                currency: currency.to_string(),
                platform_fee,
                artist_share: amount - platform_fee,
                correlation,
                metadata,
            })
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_redelivered_capture_credits_artist_once(pool: PgPool) {
        let txn = create_pending(
            &pool,
            ItemType::Song,
            dec!(1000),
            dec!(150),
            "INR",
            GatewayCorrelation::Stripe {
                payment_intent_id: Some("pi_inr_1".to_string()),
                subscription_id: None,
            },
            None,
        )
        .await;

        let processor = test_processor(pool.clone(), GatewaySubscriptionStatus::Active);
        let payload =
            r#"{"id":"evt_cap_1","type":"payment_intent.succeeded","data":{"object":{"id":"pi_inr_1"}}}"#;
        let header = stripe_header_for(
            TEST_STRIPE_SECRET,
            payload,
            OffsetDateTime::now_utc().unix_timestamp(),
        );

        let first = processor.handle_stripe(payload, &header).await.unwrap();
        assert_eq!(first, WebhookOutcome::Processed);

        let second = processor.handle_stripe(payload, &header).await.unwrap();
        assert_eq!(second, WebhookOutcome::Duplicate);

        let paid = TransactionStore::new(pool.clone()).get(txn.id).await.unwrap();
        assert!(paid.is_paid());
        assert_eq!(paid.amount_usd, Some(dec!(9.45)));
        assert_eq!(paid.exchange_rate, Some(dec!(0.01111975)));
        assert_eq!(paid.exchange_rate_source.as_deref(), Some("static"));
        assert!(paid.invoice_number.is_some());

        // Exactly one credit and the balance moved exactly once
        let ledger = ArtistEarningsLedger::new(pool);
        let entries = ledger.entries(txn.artist_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount_usd, dec!(9.45));

        let balance = ledger.balance(txn.artist_id).await.unwrap().unwrap();
        assert_eq!(balance.total_earned, dec!(9.45));
        assert_eq!(balance.available_balance, dec!(9.45));
        assert_eq!(balance.total_paid_out, dec!(0));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_paid_subscription_activates_with_the_paid_flip(pool: PgPool) {
        let txn = create_pending(
            &pool,
            ItemType::ArtistSubscription,
            dec!(10),
            dec!(2),
            "USD",
            GatewayCorrelation::Stripe {
                payment_intent_id: None,
                subscription_id: Some("sub_stripe_42".to_string()),
            },
            Some(serde_json::json!({"cycle": "1m"})),
        )
        .await;

        let period_end = OffsetDateTime::now_utc().unix_timestamp() + 30 * 86_400;
        let payload = format!(
            r#"{{"id":"evt_inv_1","type":"invoice.payment_succeeded","data":{{"object":{{"subscription":"sub_stripe_42","period_end":{}}}}}}}"#,
            period_end
        );
        let header = stripe_header_for(
            TEST_STRIPE_SECRET,
            &payload,
            OffsetDateTime::now_utc().unix_timestamp(),
        );

        let processor = test_processor(pool.clone(), GatewaySubscriptionStatus::Active);
        let outcome = processor.handle_stripe(&payload, &header).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let lifecycle = SubscriptionLifecycle::new(pool);
        let sub = lifecycle.get(txn.user_id, txn.artist_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SUB_ACTIVE);
        assert_eq!(sub.external_subscription_id.as_deref(), Some("sub_stripe_42"));
        assert_eq!(
            sub.valid_until,
            OffsetDateTime::from_unix_timestamp(period_end).unwrap()
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_gateway_cancellation_preserves_period_end(pool: PgPool) {
        let txn = create_pending(
            &pool,
            ItemType::ArtistSubscription,
            dec!(10),
            dec!(2),
            "USD",
            GatewayCorrelation::Stripe {
                payment_intent_id: None,
                subscription_id: Some("sub_del_1".to_string()),
            },
            Some(serde_json::json!({"cycle": "1m"})),
        )
        .await;

        let lifecycle = SubscriptionLifecycle::new(pool.clone());
        let period_end = OffsetDateTime::from_unix_timestamp(
            OffsetDateTime::now_utc().unix_timestamp() + 20 * 86_400,
        )
        .unwrap();
        lifecycle
            .activate_or_renew(&txn, Some("sub_del_1"), Some(period_end))
            .await
            .unwrap();

        let payload =
            r#"{"id":"evt_del_1","type":"customer.subscription.deleted","data":{"object":{"id":"sub_del_1"}}}"#;
        let header = stripe_header_for(
            TEST_STRIPE_SECRET,
            payload,
            OffsetDateTime::now_utc().unix_timestamp(),
        );

        let processor = test_processor(pool.clone(), GatewaySubscriptionStatus::Active);
        let outcome = processor.handle_stripe(payload, &header).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let sub = lifecycle.get(txn.user_id, txn.artist_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SUB_CANCELLED);
        assert!(sub.cancelled_at.is_some());
        // Gateway cancellation keeps access until the already-paid period end
        assert_eq!(sub.valid_until, period_end);

        let redelivery = processor.handle_stripe(payload, &header).await.unwrap();
        assert_eq!(redelivery, WebhookOutcome::Duplicate);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_razorpay_lifecycle_sync_trusts_gateway_not_payload(pool: PgPool) {
        let txn = create_pending(
            &pool,
            ItemType::ArtistSubscription,
            dec!(500),
            dec!(75),
            "INR",
            GatewayCorrelation::Razorpay {
                subscription_id: Some("sub_rzp_9".to_string()),
                order_id: None,
                payment_id: None,
            },
            Some(serde_json::json!({"cycle": "1m"})),
        )
        .await;

        let lifecycle = SubscriptionLifecycle::new(pool.clone());
        let period_end = OffsetDateTime::from_unix_timestamp(
            OffsetDateTime::now_utc().unix_timestamp() + 25 * 86_400,
        )
        .unwrap();
        lifecycle
            .activate_or_renew(&txn, Some("sub_rzp_9"), Some(period_end))
            .await
            .unwrap();

        // The payload claims the subscription is active; the live fetch
        // says halted. Gateway truth wins.
        let payload = r#"{"event":"subscription.halted","payload":{"subscription":{"entity":{"id":"sub_rzp_9","status":"active"}}}}"#;
        let signature = razorpay_signature_for(payload);

        let processor = test_processor(pool.clone(), GatewaySubscriptionStatus::Halted);
        let outcome = processor
            .handle_razorpay(payload, &signature, "evt_rzp_halt_1")
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let sub = lifecycle.get(txn.user_id, txn.artist_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SUB_CANCELLED);
    }
}
