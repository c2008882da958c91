//! Reconciliation engine
//!
//! Converts verified gateway events into at-most-once transaction state
//! transitions. The paid transition, invoice-number allocation, USD
//! normalization and the earnings-ledger credit all happen in one database
//! transaction: a crediting failure rolls back the paid flip, so a
//! transaction can never be marked paid without its corresponding credit.
//!
//! `paid` is sticky-terminal. A stray `failed` event arriving after `paid`
//! (gateways make no ordering promises) is logged and ignored.

use sqlx::{PgPool, Postgres, Transaction as PgTx};

use crate::correlation::GatewayCorrelation;
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{ArtistEarningsLedger, CreditParams};
use crate::rates::{self, RATE_SOURCE_STATIC};
use crate::transactions::{Transaction, TransactionStore, STATUS_FAILED, STATUS_PENDING};

/// Result of a paid-side reconciliation
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub transaction: Transaction,
    /// False when the event was an idempotent redelivery for an
    /// already-resolved transaction. Downstream side effects (subscription
    /// renewal, notifications) fire only when this is true.
    pub newly_paid: bool,
}

pub struct ReconciliationEngine {
    pool: PgPool,
}

impl ReconciliationEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Mark the transaction matching `correlation` as paid.
    ///
    /// Returns `None` when no transaction matches (expected "unknown event"
    /// case: caller logs and acknowledges the gateway without mutation).
    pub async fn mark_paid(
        &self,
        correlation: &GatewayCorrelation,
    ) -> PaymentResult<Option<Reconciliation>> {
        let mut tx = self.pool.begin().await?;
        let result = Self::mark_paid_in_tx(&mut tx, correlation).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Paid-side transition inside an existing transaction scope.
    ///
    /// The webhook pipeline uses this so the event-dedup insert, the paid
    /// flip and the ledger credit commit or roll back as one unit.
    pub async fn mark_paid_in_tx(
        tx: &mut PgTx<'_, Postgres>,
        correlation: &GatewayCorrelation,
    ) -> PaymentResult<Option<Reconciliation>> {
        let Some(transaction) = TransactionStore::find_by_correlation(tx, correlation).await?
        else {
            tracing::info!(
                gateway = %correlation.gateway(),
                "No transaction matches gateway correlation, ignoring event"
            );
            return Ok(None);
        };

        if transaction.is_paid() {
            tracing::info!(
                transaction_id = %transaction.id,
                "Transaction already paid, idempotent redelivery"
            );
            return Ok(Some(Reconciliation {
                transaction,
                newly_paid: false,
            }));
        }

        if transaction.status == STATUS_FAILED {
            // Terminal state; a capture landing here means the earlier failed
            // event was stale or the gateway retried out of band. Never
            // flipped automatically, flagged for an operator instead.
            tracing::error!(
                transaction_id = %transaction.id,
                "Capture event for a transaction already marked failed, manual review needed"
            );
            return Ok(Some(Reconciliation {
                transaction,
                newly_paid: false,
            }));
        }

        let (amount_usd, rate) = rates::usd_amount(transaction.artist_share, &transaction.currency)?;

        let (invoice_number,): (i64,) = sqlx::query_as("SELECT nextval('invoice_number_seq')")
            .fetch_one(&mut **tx)
            .await?;

        let updated: Transaction = sqlx::query_as(
            r#"
            UPDATE transactions SET
                status = 'paid',
                amount_usd = $2,
                exchange_rate = $3,
                exchange_rate_source = $4,
                exchange_rate_at = NOW(),
                invoice_number = $5,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING
                id, user_id, artist_id, item_type, item_id,
                amount, currency, platform_fee, artist_share, status, gateway,
                payment_intent_id, order_id, payment_id, subscription_id,
                amount_usd, exchange_rate, exchange_rate_source, exchange_rate_at,
                invoice_number, metadata, created_at, updated_at
            "#,
        )
        .bind(transaction.id)
        .bind(amount_usd)
        .bind(rate)
        .bind(RATE_SOURCE_STATIC)
        .bind(invoice_number)
        .fetch_one(&mut **tx)
        .await?;

        let source = updated
            .item_type()
            .map(|t| t.ledger_source().to_string())
            .ok_or_else(|| {
                PaymentError::Internal(format!("Unknown item type '{}'", updated.item_type))
            })?;

        ArtistEarningsLedger::credit_earnings(
            tx,
            CreditParams {
                artist_id: updated.artist_id,
                transaction_id: updated.id,
                amount: updated.artist_share,
                currency: updated.currency.clone(),
                amount_usd,
                gross_amount: updated.amount,
                source,
            },
        )
        .await?;

        tracing::info!(
            transaction_id = %updated.id,
            gateway = %updated.gateway,
            invoice_number = invoice_number,
            amount_usd = %amount_usd,
            exchange_rate = %rate,
            "Transaction marked paid and artist credited"
        );

        Ok(Some(Reconciliation {
            transaction: updated,
            newly_paid: true,
        }))
    }

    /// Mark the transaction matching `correlation` as failed.
    ///
    /// `pending → failed` only. A failed event after `paid` is ignored
    /// (paid is sticky-terminal); after `failed` it is an idempotent no-op.
    pub async fn mark_failed(
        &self,
        correlation: &GatewayCorrelation,
    ) -> PaymentResult<Option<Transaction>> {
        let mut tx = self.pool.begin().await?;
        let result = Self::mark_failed_in_tx(&mut tx, correlation).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Failure-side transition inside an existing transaction scope
    pub async fn mark_failed_in_tx(
        tx: &mut PgTx<'_, Postgres>,
        correlation: &GatewayCorrelation,
    ) -> PaymentResult<Option<Transaction>> {
        let Some(transaction) = TransactionStore::find_by_correlation(tx, correlation).await?
        else {
            tracing::info!(
                gateway = %correlation.gateway(),
                "No transaction matches gateway correlation for failure event"
            );
            return Ok(None);
        };

        if transaction.status != STATUS_PENDING {
            if transaction.is_paid() {
                tracing::warn!(
                    transaction_id = %transaction.id,
                    "Failed event arrived after paid, ignoring (paid is terminal)"
                );
            }
            return Ok(Some(transaction));
        }

        let updated: Transaction = sqlx::query_as(
            r#"
            UPDATE transactions SET status = 'failed', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING
                id, user_id, artist_id, item_type, item_id,
                amount, currency, platform_fee, artist_share, status, gateway,
                payment_intent_id, order_id, payment_id, subscription_id,
                amount_usd, exchange_rate, exchange_rate_source, exchange_rate_at,
                invoice_number, metadata, created_at, updated_at
            "#,
        )
        .bind(transaction.id)
        .fetch_one(&mut **tx)
        .await?;

        tracing::info!(
            transaction_id = %updated.id,
            "Transaction marked failed"
        );

        Ok(Some(updated))
    }
}
