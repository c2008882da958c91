//! Transaction store
//!
//! One row per purchase or subscription-billing attempt. Rows are created
//! `pending` when the payment intent/order is created, before the gateway
//! confirms anything, and are moved to `paid`/`failed` only by the
//! reconciliation engine. Rows are never deleted.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction as PgTx};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::correlation::{GatewayCorrelation, ItemType};
use crate::error::{PaymentError, PaymentResult};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PAID: &str = "paid";
pub const STATUS_FAILED: &str = "failed";

/// A purchase or subscription-billing attempt
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub artist_id: Uuid,
    pub item_type: String,
    pub item_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub platform_fee: Decimal,
    pub artist_share: Decimal,
    pub status: String,
    pub gateway: String,
    pub payment_intent_id: Option<String>,
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub subscription_id: Option<String>,
    pub amount_usd: Option<Decimal>,
    pub exchange_rate: Option<Decimal>,
    pub exchange_rate_source: Option<String>,
    pub exchange_rate_at: Option<OffsetDateTime>,
    pub invoice_number: Option<i64>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Transaction {
    pub fn is_paid(&self) -> bool {
        self.status == STATUS_PAID
    }

    pub fn is_pending(&self) -> bool {
        self.status == STATUS_PENDING
    }

    pub fn item_type(&self) -> Option<ItemType> {
        ItemType::from_str(&self.item_type)
    }
}

/// Parameters for creating a pending transaction
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub artist_id: Uuid,
    pub item_type: ItemType,
    pub item_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub platform_fee: Decimal,
    pub artist_share: Decimal,
    pub correlation: GatewayCorrelation,
    pub metadata: Option<serde_json::Value>,
}

const SELECT_COLUMNS: &str = r#"
    id, user_id, artist_id, item_type, item_id,
    amount, currency, platform_fee, artist_share, status, gateway,
    payment_intent_id, order_id, payment_id, subscription_id,
    amount_usd, exchange_rate, exchange_rate_source, exchange_rate_at,
    invoice_number, metadata, created_at, updated_at
"#;

/// Repository over the `transactions` table
pub struct TransactionStore {
    pool: PgPool,
}

impl TransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a `pending` transaction at payment-intent/order creation time.
    ///
    /// The artist/platform split must add up exactly; this is validated here
    /// in addition to the database CHECK so callers get a typed error.
    pub async fn create_pending(&self, new: NewTransaction) -> PaymentResult<Transaction> {
        if new.amount <= Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(format!(
                "amount must be positive, got {}",
                new.amount
            )));
        }
        if new.platform_fee < Decimal::ZERO || new.artist_share < Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(
                "fee and artist share must be non-negative".to_string(),
            ));
        }
        if new.artist_share + new.platform_fee != new.amount {
            return Err(PaymentError::InvalidAmount(format!(
                "artist share {} + platform fee {} != amount {}",
                new.artist_share, new.platform_fee, new.amount
            )));
        }

        let (payment_intent_id, order_id, payment_id, subscription_id) =
            correlation_columns(&new.correlation);

        let transaction: Transaction = sqlx::query_as(&format!(
            r#"
            INSERT INTO transactions (
                user_id, artist_id, item_type, item_id,
                amount, currency, platform_fee, artist_share, gateway,
                payment_intent_id, order_id, payment_id, subscription_id, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(new.user_id)
        .bind(new.artist_id)
        .bind(new.item_type.as_str())
        .bind(new.item_id)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.platform_fee)
        .bind(new.artist_share)
        .bind(new.correlation.gateway().as_str())
        .bind(payment_intent_id)
        .bind(order_id)
        .bind(payment_id)
        .bind(subscription_id)
        .bind(new.metadata.unwrap_or_else(|| serde_json::json!({})))
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            transaction_id = %transaction.id,
            gateway = %transaction.gateway,
            item_type = %transaction.item_type,
            amount = %transaction.amount,
            currency = %transaction.currency,
            "Created pending transaction"
        );

        Ok(transaction)
    }

    pub async fn get(&self, id: Uuid) -> PaymentResult<Transaction> {
        let transaction: Option<Transaction> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        transaction.ok_or_else(|| PaymentError::NotFound(format!("Transaction {}", id)))
    }

    /// Locate the transaction matching a gateway correlation, row-locked for
    /// the duration of the caller's reconciliation transaction.
    ///
    /// Returns `None` when nothing matches: an expected "unknown event" case
    /// (e.g. an event for a transaction created by another system).
    pub async fn find_by_correlation(
        tx: &mut PgTx<'_, Postgres>,
        correlation: &GatewayCorrelation,
    ) -> PaymentResult<Option<Transaction>> {
        let Some((field, value)) = correlation.lookup_filter() else {
            return Ok(None);
        };

        // Column name comes from CorrelationField::column(), never from input.
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM transactions
            WHERE gateway = $1 AND {} = $2
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
            field.column()
        );

        let transaction: Option<Transaction> = sqlx::query_as(&sql)
            .bind(correlation.gateway().as_str())
            .bind(value)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(transaction)
    }

    /// All billing attempts correlated to one external subscription,
    /// newest first
    pub async fn find_by_subscription_ref(
        &self,
        external_subscription_id: &str,
    ) -> PaymentResult<Vec<Transaction>> {
        let transactions: Vec<Transaction> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM transactions
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(external_subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }
}

/// Destructure a correlation bag into its column values. All populated
/// fields are stored at creation time; lookup priority applies only on read.
fn correlation_columns(
    correlation: &GatewayCorrelation,
) -> (
    Option<&str>,
    Option<&str>,
    Option<&str>,
    Option<&str>,
) {
    match correlation {
        GatewayCorrelation::Stripe {
            payment_intent_id,
            subscription_id,
        } => (
            payment_intent_id.as_deref(),
            None,
            None,
            subscription_id.as_deref(),
        ),
        GatewayCorrelation::Razorpay {
            subscription_id,
            order_id,
            payment_id,
        } => (
            None,
            order_id.as_deref(),
            payment_id.as_deref(),
            subscription_id.as_deref(),
        ),
        GatewayCorrelation::Paypal {
            subscription_id,
            payment_id,
        } => (
            None,
            None,
            payment_id.as_deref(),
            subscription_id.as_deref(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::Gateway;

    #[test]
    fn test_correlation_columns_stripe() {
        let corr = GatewayCorrelation::Stripe {
            payment_intent_id: Some("pi_1".to_string()),
            subscription_id: None,
        };
        let (pi, order, payment, sub) = correlation_columns(&corr);
        assert_eq!(pi, Some("pi_1"));
        assert_eq!(order, None);
        assert_eq!(payment, None);
        assert_eq!(sub, None);
        assert_eq!(corr.gateway(), Gateway::Stripe);
    }

    #[test]
    fn test_correlation_columns_razorpay_keeps_all_fields() {
        let corr = GatewayCorrelation::Razorpay {
            subscription_id: Some("sub_1".to_string()),
            order_id: Some("order_1".to_string()),
            payment_id: Some("pay_1".to_string()),
        };
        let (pi, order, payment, sub) = correlation_columns(&corr);
        assert_eq!(pi, None);
        assert_eq!(order, Some("order_1"));
        assert_eq!(payment, Some("pay_1"));
        assert_eq!(sub, Some("sub_1"));
    }

    #[test]
    fn test_transaction_status_helpers() {
        assert_eq!(STATUS_PENDING, "pending");
        assert_eq!(STATUS_PAID, "paid");
        assert_eq!(STATUS_FAILED, "failed");
    }
}
