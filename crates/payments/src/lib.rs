// Payments crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Reconciliation operations carry many correlation fields
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Encore Payment Reconciliation Core
//!
//! Converts asynchronous, possibly-duplicated, possibly-out-of-order gateway
//! webhook events (Stripe/Razorpay/PayPal) into idempotent transaction state
//! transitions, subscription activation, and artist earnings crediting.
//! Financial side effects happen exactly once under at-least-once delivery.
//!
//! ## Components
//!
//! - **Event Dedup Ledger**: one row per gateway event ID, ever
//! - **Transaction Store**: intended payments, `pending → paid|failed`
//! - **Reconciliation Engine**: webhook → atomic paid/failed transition
//! - **Subscription Lifecycle**: renewals, cancellations, gateway-truth sync
//! - **Artist Earnings Ledger**: append-only credits/debits + balance
//! - **Payout Workflow**: overdraft-guarded balance debits
//! - **Invariants**: runnable consistency checks over all of the above

pub mod config;
pub mod correlation;
pub mod dedup;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod payouts;
pub mod rates;
pub mod reconcile;
pub mod subscriptions;
pub mod transactions;
pub mod webhooks;


// Config
pub use config::PaymentConfig;

// Correlation
pub use correlation::{BillingCycle, CorrelationField, Gateway, GatewayCorrelation, ItemType};

// Dedup
pub use dedup::EventDedupLedger;

// Error
pub use error::{PaymentError, PaymentResult};

// Gateway boundary
pub use gateway::{
    GatewaySubscriptionStatus, LogOnlyNotifier, PaypalConfig, PaypalSignatureHeaders,
    PaypalVerificationClient, PaypalWebhookVerifier, PurchaseNotifier, SubscriptionStatusFetcher,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{ArtistBalance, ArtistEarningsLedger, CreditParams, LedgerEntry};

// Payouts
pub use payouts::{Payout, PayoutRequest, PayoutService};

// Reconciliation
pub use reconcile::{Reconciliation, ReconciliationEngine};

// Subscriptions
pub use subscriptions::{Subscription, SubscriptionLifecycle};

// Transactions
pub use transactions::{NewTransaction, Transaction, TransactionStore};

// Webhooks
pub use webhooks::{
    verify_razorpay_signature, verify_stripe_signature, PaypalEvent, RazorpayEvent, StripeEvent,
    WebhookOutcome, WebhookProcessor,
};

use sqlx::PgPool;
use std::sync::Arc;

/// Main payment service that combines all reconciliation functionality
pub struct PaymentService {
    pub transactions: TransactionStore,
    pub engine: ReconciliationEngine,
    pub subscriptions: SubscriptionLifecycle,
    pub ledger: ArtistEarningsLedger,
    pub payouts: PayoutService,
    pub dedup: EventDedupLedger,
    pub invariants: InvariantChecker,
    pub webhooks: WebhookProcessor,
}

impl PaymentService {
    /// Create a payment service with explicit config and collaborators
    pub fn new(
        config: PaymentConfig,
        pool: PgPool,
        razorpay_status: Arc<dyn SubscriptionStatusFetcher>,
        notifier: Arc<dyn PurchaseNotifier>,
    ) -> PaymentResult<Self> {
        let paypal_verifier = Arc::new(PaypalVerificationClient::new(config.paypal.clone())?);
        Ok(Self::with_verifier(
            config,
            pool,
            razorpay_status,
            paypal_verifier,
            notifier,
        ))
    }

    /// Create a payment service with an injected PayPal verifier
    /// (tests wire a double here)
    pub fn with_verifier(
        config: PaymentConfig,
        pool: PgPool,
        razorpay_status: Arc<dyn SubscriptionStatusFetcher>,
        paypal_verifier: Arc<dyn PaypalWebhookVerifier>,
        notifier: Arc<dyn PurchaseNotifier>,
    ) -> Self {
        Self {
            transactions: TransactionStore::new(pool.clone()),
            engine: ReconciliationEngine::new(pool.clone()),
            subscriptions: SubscriptionLifecycle::new(pool.clone()),
            ledger: ArtistEarningsLedger::new(pool.clone()),
            payouts: PayoutService::new(pool.clone()),
            dedup: EventDedupLedger::new(pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            webhooks: WebhookProcessor::new(
                pool,
                config,
                razorpay_status,
                paypal_verifier,
                notifier,
            ),
        }
    }

    /// Create a payment service from environment variables
    pub fn from_env(
        pool: PgPool,
        razorpay_status: Arc<dyn SubscriptionStatusFetcher>,
        notifier: Arc<dyn PurchaseNotifier>,
    ) -> PaymentResult<Self> {
        let config = PaymentConfig::from_env()?;
        Self::new(config, pool, razorpay_status, notifier)
    }
}
