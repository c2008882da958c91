//! Event deduplication ledger
//!
//! Gateways deliver webhooks at-least-once; the same event can arrive twice,
//! concurrently, or days apart. Every event ID is recorded here under a
//! uniqueness constraint, and the insert is the atomic dedup gate: the loser
//! of a concurrent race gets a conflict and must short-circuit.
//!
//! The dedup insert runs inside the SAME database transaction as the
//! reconciliation work it guards. A failed reconciliation therefore rolls
//! the dedup row back too, and the gateway's retry can reprocess the event
//! instead of finding it permanently black-holed.

use sqlx::{PgPool, Postgres, Transaction};

use crate::correlation::Gateway;
use crate::error::PaymentResult;

/// Append-only log of every gateway event ever seen
pub struct EventDedupLedger {
    pool: PgPool,
}

impl EventDedupLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record an event inside the caller's transaction.
    ///
    /// Returns `true` if this is the first sighting. Returns `false` on a
    /// duplicate, in which case the caller must short-circuit without side
    /// effects and acknowledge the gateway.
    pub async fn record_if_new(
        tx: &mut Transaction<'_, Postgres>,
        gateway: Gateway,
        event_id: &str,
        event_type: &str,
    ) -> PaymentResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_events (gateway, event_id, event_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (gateway, event_id) DO NOTHING
            "#,
        )
        .bind(gateway.as_str())
        .bind(event_id)
        .bind(event_type)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    /// Durably record an event we intentionally do not process (unhandled
    /// type, unknown correlation), so redeliveries short-circuit cheaply.
    pub async fn record_ignored(
        &self,
        gateway: Gateway,
        event_id: &str,
        event_type: &str,
    ) -> PaymentResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_events (gateway, event_id, event_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (gateway, event_id) DO NOTHING
            "#,
        )
        .bind(gateway.as_str())
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    /// Whether an event has been recorded (read-only, for diagnostics)
    pub async fn has_seen(&self, gateway: Gateway, event_id: &str) -> PaymentResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1::BIGINT FROM webhook_events WHERE gateway = $1 AND event_id = $2",
        )
        .bind(gateway.as_str())
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}
