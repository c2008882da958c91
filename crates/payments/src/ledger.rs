//! Artist earnings ledger
//!
//! Double-entry style movement log feeding a denormalized balance. Ledger
//! rows are append-only; the `(entry_type, ref_id)` uniqueness constraint
//! guarantees at most one credit per transaction and one debit per payout,
//! which is the idempotency backstop even if a caller invokes credit twice.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction as PgTx};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};

pub const ENTRY_CREDIT: &str = "credit";
pub const ENTRY_DEBIT: &str = "debit";

/// One immutable accounting movement
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub artist_id: Uuid,
    pub entry_type: String,
    pub source: String,
    pub ref_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub amount_usd: Decimal,
    pub gross_amount: Option<Decimal>,
    pub created_at: OffsetDateTime,
}

/// Denormalized running total, one row per artist
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ArtistBalance {
    pub artist_id: Uuid,
    pub total_earned: Decimal,
    pub available_balance: Decimal,
    pub total_paid_out: Decimal,
    pub currency: String,
    pub updated_at: OffsetDateTime,
}

/// Parameters for crediting an artist for a paid transaction
#[derive(Debug, Clone)]
pub struct CreditParams {
    pub artist_id: Uuid,
    pub transaction_id: Uuid,
    /// Artist share in the charge currency
    pub amount: Decimal,
    pub currency: String,
    /// Artist share normalized to USD; this is what moves the balance
    pub amount_usd: Decimal,
    /// Gross (pre-fee) transaction amount, kept for audit
    pub gross_amount: Decimal,
    /// `song`, `album` or `subscription`
    pub source: String,
}

/// Earnings crediting and balance reads
pub struct ArtistEarningsLedger {
    pool: PgPool,
}

impl ArtistEarningsLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Credit an artist for a paid transaction, inside the caller's
    /// reconciliation transaction.
    ///
    /// No-op if a credit for this transaction already exists. Otherwise the
    /// credit row insert and the balance increment happen together; a failure
    /// in either aborts the caller's whole atomic unit.
    pub async fn credit_earnings(
        tx: &mut PgTx<'_, Postgres>,
        params: CreditParams,
    ) -> PaymentResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO artist_ledger (
                artist_id, entry_type, source, ref_id,
                amount, currency, amount_usd, gross_amount
            )
            VALUES ($1, 'credit', $2, $3, $4, $5, $6, $7)
            ON CONFLICT (entry_type, ref_id) DO NOTHING
            "#,
        )
        .bind(params.artist_id)
        .bind(&params.source)
        .bind(params.transaction_id)
        .bind(params.amount)
        .bind(&params.currency)
        .bind(params.amount_usd)
        .bind(params.gross_amount)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tracing::warn!(
                artist_id = %params.artist_id,
                transaction_id = %params.transaction_id,
                "Credit already recorded for transaction, skipping"
            );
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO artist_balances (artist_id, total_earned, available_balance, total_paid_out, currency)
            VALUES ($1, $2, $2, 0, 'USD')
            ON CONFLICT (artist_id) DO UPDATE SET
                total_earned = artist_balances.total_earned + EXCLUDED.total_earned,
                available_balance = artist_balances.available_balance + EXCLUDED.available_balance,
                updated_at = NOW()
            "#,
        )
        .bind(params.artist_id)
        .bind(params.amount_usd)
        .execute(&mut **tx)
        .await?;

        tracing::info!(
            artist_id = %params.artist_id,
            transaction_id = %params.transaction_id,
            amount_usd = %params.amount_usd,
            source = %params.source,
            "Credited artist earnings"
        );

        Ok(true)
    }

    /// Debit the balance for a payout, inside the caller's transaction.
    ///
    /// The overdraft check belongs to the payout workflow, which holds the
    /// balance row lock; this only records the movement.
    pub async fn debit_for_payout(
        tx: &mut PgTx<'_, Postgres>,
        artist_id: Uuid,
        payout_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) -> PaymentResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO artist_ledger (
                artist_id, entry_type, source, ref_id, amount, currency, amount_usd
            )
            VALUES ($1, 'debit', 'payout', $2, $3, $4, $3)
            ON CONFLICT (entry_type, ref_id) DO NOTHING
            "#,
        )
        .bind(artist_id)
        .bind(payout_id)
        .bind(amount)
        .bind(currency)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(PaymentError::AlreadyResolved(format!(
                "Debit already recorded for payout {}",
                payout_id
            )));
        }

        let updated = sqlx::query(
            r#"
            UPDATE artist_balances SET
                available_balance = available_balance - $2,
                total_paid_out = total_paid_out + $2,
                updated_at = NOW()
            WHERE artist_id = $1
            "#,
        )
        .bind(artist_id)
        .bind(amount)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(PaymentError::NotFound(format!(
                "Balance for artist {}",
                artist_id
            )));
        }

        Ok(())
    }

    /// Current balance for an artist; zero balance if never credited
    pub async fn balance(&self, artist_id: Uuid) -> PaymentResult<Option<ArtistBalance>> {
        let balance: Option<ArtistBalance> = sqlx::query_as(
            r#"
            SELECT artist_id, total_earned, available_balance, total_paid_out, currency, updated_at
            FROM artist_balances
            WHERE artist_id = $1
            "#,
        )
        .bind(artist_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance)
    }

    /// Movement history for an artist, newest first
    pub async fn entries(&self, artist_id: Uuid) -> PaymentResult<Vec<LedgerEntry>> {
        let entries: Vec<LedgerEntry> = sqlx::query_as(
            r#"
            SELECT id, artist_id, entry_type, source, ref_id,
                   amount, currency, amount_usd, gross_amount, created_at
            FROM artist_ledger
            WHERE artist_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(artist_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn credit_params(artist_id: Uuid, transaction_id: Uuid, usd: Decimal) -> CreditParams {
        CreditParams {
            artist_id,
            transaction_id,
            amount: usd,
            currency: "USD".to_string(),
            amount_usd: usd,
            gross_amount: usd,
            source: "song".to_string(),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_second_credit_for_same_transaction_is_noop(pool: PgPool) {
        let artist_id = Uuid::new_v4();
        let transaction_id = Uuid::new_v4();

        let mut tx = pool.begin().await.unwrap();
        let first =
            ArtistEarningsLedger::credit_earnings(&mut tx, credit_params(artist_id, transaction_id, dec!(9.45)))
                .await
                .unwrap();
        tx.commit().await.unwrap();
        assert!(first);

        let mut tx = pool.begin().await.unwrap();
        let second =
            ArtistEarningsLedger::credit_earnings(&mut tx, credit_params(artist_id, transaction_id, dec!(9.45)))
                .await
                .unwrap();
        tx.commit().await.unwrap();
        assert!(!second);

        let ledger = ArtistEarningsLedger::new(pool);
        assert_eq!(ledger.entries(artist_id).await.unwrap().len(), 1);

        let balance = ledger.balance(artist_id).await.unwrap().unwrap();
        assert_eq!(balance.total_earned, dec!(9.45));
        assert_eq!(balance.available_balance, dec!(9.45));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_balance_equation_holds_across_credit_and_debit(pool: PgPool) {
        let artist_id = Uuid::new_v4();
        let payout_id = Uuid::new_v4();

        let mut tx = pool.begin().await.unwrap();
        ArtistEarningsLedger::credit_earnings(&mut tx, credit_params(artist_id, Uuid::new_v4(), dec!(20)))
            .await
            .unwrap();
        ArtistEarningsLedger::debit_for_payout(&mut tx, artist_id, payout_id, dec!(5), "USD")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let ledger = ArtistEarningsLedger::new(pool.clone());
        let balance = ledger.balance(artist_id).await.unwrap().unwrap();
        assert_eq!(balance.total_earned, dec!(20));
        assert_eq!(balance.total_paid_out, dec!(5));
        assert_eq!(
            balance.available_balance,
            balance.total_earned - balance.total_paid_out
        );

        // A second debit for the same payout is refused
        let mut tx = pool.begin().await.unwrap();
        let duplicate =
            ArtistEarningsLedger::debit_for_payout(&mut tx, artist_id, payout_id, dec!(5), "USD").await;
        assert!(matches!(duplicate, Err(PaymentError::AlreadyResolved(_))));
    }
}
