//! Error types for the payment reconciliation core

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors that can occur during payment reconciliation
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Webhook signature did not verify against the configured secret.
    /// Logged as a potential security event by callers.
    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    /// Webhook payload could not be parsed or is missing required fields
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    /// No static exchange rate configured for this currency.
    /// Intentionally retryable: indicates a config gap needing operator attention.
    #[error("No exchange rate configured for currency '{0}'")]
    UnsupportedCurrency(String),

    /// Payout request exceeds the artist's available balance
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },

    /// Amount failed validation (non-positive, or split doesn't add up)
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Attempted a state transition on an already-terminal record
    #[error("Already resolved: {0}")]
    AlreadyResolved(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Error talking to an external gateway (status fetch, PayPal verification)
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Whether the gateway should be told to redeliver this event.
    ///
    /// Gateways retry on non-2xx. Transient/operator-fixable failures want a
    /// retry; validation failures do not (redelivery would fail identically).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentError::UnsupportedCurrency(_)
                | PaymentError::Gateway(_)
                | PaymentError::Database(_)
                | PaymentError::Internal(_)
        )
    }
}

impl From<sqlx::Error> for PaymentError {
    fn from(e: sqlx::Error) -> Self {
        PaymentError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(e: reqwest::Error) -> Self {
        PaymentError::Gateway(e.to_string())
    }
}

pub type PaymentResult<T> = Result<T, PaymentError>;
