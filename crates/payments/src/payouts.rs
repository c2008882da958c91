//! Payout request workflow
//!
//! Requesting a payout debits the artist balance atomically: the payout row,
//! the debit ledger row and the balance decrement are one database
//! transaction, guarded against overdraft by a row lock on the balance.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::ledger::ArtistEarningsLedger;

pub const PAYOUT_REQUESTED: &str = "requested";
pub const PAYOUT_PAID: &str = "paid";

/// A payout request and its processing state
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Payout {
    pub id: Uuid,
    pub artist_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub destination: String,
    pub status: String,
    pub processed_by: Option<Uuid>,
    pub processed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Parameters for requesting a payout
#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub artist_id: Uuid,
    pub amount: Decimal,
    /// Payout email/account at the disbursement provider
    pub destination: String,
}

const SELECT_COLUMNS: &str = r#"
    id, artist_id, amount, currency, destination, status,
    processed_by, processed_at, created_at
"#;

pub struct PayoutService {
    pool: PgPool,
}

impl PayoutService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Request a payout, debiting the available balance.
    ///
    /// The balance row is locked for the duration of the transaction, so
    /// two concurrent requests cannot both pass the overdraft check.
    pub async fn request_payout(&self, request: PayoutRequest) -> PaymentResult<Payout> {
        if request.amount <= Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(format!(
                "payout amount must be positive, got {}",
                request.amount
            )));
        }

        let mut tx = self.pool.begin().await?;

        let available: Option<(Decimal,)> = sqlx::query_as(
            "SELECT available_balance FROM artist_balances WHERE artist_id = $1 FOR UPDATE",
        )
        .bind(request.artist_id)
        .fetch_optional(&mut *tx)
        .await?;

        let available = available.map(|(b,)| b).unwrap_or(Decimal::ZERO);

        if request.amount > available {
            return Err(PaymentError::InsufficientBalance {
                available,
                requested: request.amount,
            });
        }

        let payout: Payout = sqlx::query_as(&format!(
            r#"
            INSERT INTO artist_payouts (artist_id, amount, currency, destination)
            VALUES ($1, $2, 'USD', $3)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(request.artist_id)
        .bind(request.amount)
        .bind(&request.destination)
        .fetch_one(&mut *tx)
        .await?;

        ArtistEarningsLedger::debit_for_payout(
            &mut tx,
            request.artist_id,
            payout.id,
            request.amount,
            "USD",
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            payout_id = %payout.id,
            artist_id = %request.artist_id,
            amount = %request.amount,
            "Payout requested and balance debited"
        );

        Ok(payout)
    }

    /// Admin-side completion: `requested → paid`, never reversed.
    /// Rejects a second completion attempt.
    pub async fn mark_paid(&self, payout_id: Uuid, admin_id: Uuid) -> PaymentResult<Payout> {
        let payout: Option<Payout> = sqlx::query_as(&format!(
            r#"
            UPDATE artist_payouts SET
                status = 'paid',
                processed_by = $2,
                processed_at = NOW()
            WHERE id = $1 AND status = 'requested'
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(payout_id)
        .bind(admin_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(payout) = payout {
            tracing::info!(
                payout_id = %payout_id,
                admin_id = %admin_id,
                "Payout marked paid"
            );
            return Ok(payout);
        }

        // Distinguish "already paid" from "never existed" for the caller
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT status FROM artist_payouts WHERE id = $1")
                .bind(payout_id)
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            Some((status,)) if status == PAYOUT_PAID => Err(PaymentError::AlreadyResolved(
                format!("Payout {} is already paid", payout_id),
            )),
            Some((status,)) => Err(PaymentError::Internal(format!(
                "Payout {} in unexpected status '{}'",
                payout_id, status
            ))),
            None => Err(PaymentError::NotFound(format!("Payout {}", payout_id))),
        }
    }

    /// Payout history for an artist, newest first
    pub async fn history(&self, artist_id: Uuid) -> PaymentResult<Vec<Payout>> {
        let payouts: Vec<Payout> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM artist_payouts
            WHERE artist_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(artist_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }
}
