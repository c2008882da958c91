//! Subscription lifecycle management
//!
//! At most one subscription row exists per (user, artist) pair; renewals
//! upsert into it. `valid_until` only ever moves forward (SQL `GREATEST`),
//! so out-of-order renewal webhooks cannot shorten access.
//!
//! Lifecycle events carry a status in their payload, but payloads can be
//! stale or reordered. `sync_from_gateway_truth` re-fetches the status
//! directly from the gateway and maps that, never the embedded value.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction as PgTx};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::correlation::BillingCycle;
use crate::error::{PaymentError, PaymentResult};
use crate::gateway::{GatewaySubscriptionStatus, SubscriptionStatusFetcher};
use crate::transactions::Transaction;

pub const SUB_ACTIVE: &str = "active";
pub const SUB_CANCELLED: &str = "cancelled";
pub const SUB_COMPLETED: &str = "completed";

/// Recurring access grant from one user to one artist
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub artist_id: Uuid,
    pub cycle: String,
    pub status: String,
    pub is_recurring: bool,
    pub gateway: String,
    pub external_subscription_id: Option<String>,
    pub transaction_id: Option<Uuid>,
    pub started_at: OffsetDateTime,
    pub valid_until: OffsetDateTime,
    pub cancelled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

const SELECT_COLUMNS: &str = r#"
    id, user_id, artist_id, cycle, status, is_recurring, gateway,
    external_subscription_id, transaction_id, started_at, valid_until,
    cancelled_at, created_at, updated_at
"#;

/// Map a live-fetched gateway status onto the local status column.
/// Statuses with no local meaning (authenticated, pending) map to `None`
/// and leave the row unchanged.
fn map_gateway_status(status: &GatewaySubscriptionStatus) -> Option<&'static str> {
    match status {
        GatewaySubscriptionStatus::Active => Some(SUB_ACTIVE),
        GatewaySubscriptionStatus::Completed => Some(SUB_COMPLETED),
        GatewaySubscriptionStatus::Cancelled | GatewaySubscriptionStatus::Halted => {
            Some(SUB_CANCELLED)
        }
        GatewaySubscriptionStatus::Authenticated
        | GatewaySubscriptionStatus::Pending
        | GatewaySubscriptionStatus::Other(_) => None,
    }
}

pub struct SubscriptionLifecycle {
    pool: PgPool,
}

impl SubscriptionLifecycle {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert the subscription for a paid artist-subscription transaction.
    pub async fn activate_or_renew(
        &self,
        transaction: &Transaction,
        external_ref: Option<&str>,
        period_end_hint: Option<OffsetDateTime>,
    ) -> PaymentResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let subscription =
            Self::activate_or_renew_in_tx(&mut tx, transaction, external_ref, period_end_hint)
                .await?;
        tx.commit().await?;
        Ok(subscription)
    }

    /// Upsert inside the caller's transaction. The webhook pipeline uses
    /// this so the paid flip, the ledger credit and the subscription
    /// activation commit or roll back as one unit.
    ///
    /// `period_end_hint` is the gateway's authoritative period end when the
    /// webhook carried one; preferred over local clock math to avoid drift.
    /// Without a hint, access extends by the billing cycle's day count from
    /// now. Either way `valid_until` never retreats.
    pub async fn activate_or_renew_in_tx(
        tx: &mut PgTx<'_, Postgres>,
        transaction: &Transaction,
        external_ref: Option<&str>,
        period_end_hint: Option<OffsetDateTime>,
    ) -> PaymentResult<Subscription> {
        let cycle = transaction
            .metadata
            .get("cycle")
            .and_then(|v| v.as_str())
            .and_then(BillingCycle::from_str)
            .unwrap_or(BillingCycle::Monthly);

        let valid_until = period_end_hint
            .unwrap_or_else(|| OffsetDateTime::now_utc() + Duration::days(cycle.days()));

        let external_id = external_ref.or(transaction.subscription_id.as_deref());

        let subscription: Subscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                user_id, artist_id, cycle, status, is_recurring, gateway,
                external_subscription_id, transaction_id, valid_until
            )
            VALUES ($1, $2, $3, 'active', $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, artist_id) DO UPDATE SET
                status = 'active',
                cycle = EXCLUDED.cycle,
                is_recurring = EXCLUDED.is_recurring,
                gateway = EXCLUDED.gateway,
                external_subscription_id = COALESCE(EXCLUDED.external_subscription_id, subscriptions.external_subscription_id),
                transaction_id = EXCLUDED.transaction_id,
                valid_until = GREATEST(subscriptions.valid_until, EXCLUDED.valid_until),
                cancelled_at = NULL,
                updated_at = NOW()
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(transaction.user_id)
        .bind(transaction.artist_id)
        .bind(cycle.as_str())
        .bind(external_id.is_some())
        .bind(&transaction.gateway)
        .bind(external_id)
        .bind(transaction.id)
        .bind(valid_until)
        .fetch_one(&mut **tx)
        .await?;

        tracing::info!(
            user_id = %transaction.user_id,
            artist_id = %transaction.artist_id,
            transaction_id = %transaction.id,
            cycle = %cycle.as_str(),
            valid_until = %subscription.valid_until,
            "Subscription activated or renewed"
        );

        Ok(subscription)
    }

    /// User-initiated cancellation: immediate revocation.
    /// Distinct from gateway-initiated cancellation, which lets access run
    /// until the already-paid period ends.
    pub async fn cancel_by_user(&self, artist_id: Uuid, user_id: Uuid) -> PaymentResult<Subscription> {
        let subscription: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = 'cancelled',
                valid_until = NOW(),
                cancelled_at = NOW(),
                updated_at = NOW()
            WHERE user_id = $1 AND artist_id = $2
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(artist_id)
        .fetch_optional(&self.pool)
        .await?;

        let subscription = subscription.ok_or_else(|| {
            PaymentError::NotFound(format!(
                "Subscription for user {} and artist {}",
                user_id, artist_id
            ))
        })?;

        tracing::info!(
            user_id = %user_id,
            artist_id = %artist_id,
            "Subscription cancelled by user, access revoked immediately"
        );

        Ok(subscription)
    }

    /// Gateway-initiated cancellation: access runs until period end
    pub async fn cancel_by_gateway(
        &self,
        external_subscription_id: &str,
    ) -> PaymentResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;
        let subscription = Self::cancel_by_gateway_in_tx(&mut tx, external_subscription_id).await?;
        tx.commit().await?;
        Ok(subscription)
    }

    /// Gateway-initiated cancellation inside the caller's transaction, so
    /// the webhook pipeline's dedup insert and the cancellation commit as
    /// one unit.
    pub async fn cancel_by_gateway_in_tx(
        tx: &mut PgTx<'_, Postgres>,
        external_subscription_id: &str,
    ) -> PaymentResult<Option<Subscription>> {
        let subscription: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = 'cancelled',
                cancelled_at = NOW(),
                updated_at = NOW()
            WHERE external_subscription_id = $1
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(external_subscription_id)
        .fetch_optional(&mut **tx)
        .await?;

        match &subscription {
            Some(sub) => {
                tracing::info!(
                    subscription_id = %sub.id,
                    external_subscription_id = %external_subscription_id,
                    valid_until = %sub.valid_until,
                    "Subscription cancelled by gateway, access runs until period end"
                );
            }
            None => {
                tracing::info!(
                    external_subscription_id = %external_subscription_id,
                    "Gateway cancellation for unknown subscription, ignoring"
                );
            }
        }

        Ok(subscription)
    }

    /// Reconcile local status against gateway ground truth.
    ///
    /// The webhook only tells us WHICH subscription changed; the status is
    /// fetched live so replayed or reordered lifecycle events cannot
    /// regress the local record.
    pub async fn sync_from_gateway_truth(
        &self,
        external_subscription_id: &str,
        fetcher: &dyn SubscriptionStatusFetcher,
    ) -> PaymentResult<Option<Subscription>> {
        // Fetch before opening the transaction; an open transaction must
        // not span an external network call.
        let gateway_status = fetcher.fetch_status(external_subscription_id).await?;

        let mut tx = self.pool.begin().await?;
        let subscription =
            Self::apply_gateway_status_in_tx(&mut tx, external_subscription_id, &gateway_status)
                .await?;
        tx.commit().await?;
        Ok(subscription)
    }

    /// Apply an already-fetched gateway status inside the caller's
    /// transaction. Statuses with no local mapping leave the row unchanged.
    pub async fn apply_gateway_status_in_tx(
        tx: &mut PgTx<'_, Postgres>,
        external_subscription_id: &str,
        gateway_status: &GatewaySubscriptionStatus,
    ) -> PaymentResult<Option<Subscription>> {
        let Some(local_status) = map_gateway_status(gateway_status) else {
            tracing::info!(
                external_subscription_id = %external_subscription_id,
                gateway_status = ?gateway_status,
                "Gateway status has no local mapping, leaving subscription unchanged"
            );
            return Ok(None);
        };

        let subscription: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = $2,
                cancelled_at = CASE WHEN $2 = 'cancelled' THEN NOW() ELSE cancelled_at END,
                updated_at = NOW()
            WHERE external_subscription_id = $1
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(external_subscription_id)
        .bind(local_status)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(sub) = &subscription {
            tracing::info!(
                subscription_id = %sub.id,
                external_subscription_id = %external_subscription_id,
                status = %local_status,
                "Subscription status synced from gateway truth"
            );
        }

        Ok(subscription)
    }

    /// Active subscription for a (user, artist) pair, if any
    pub async fn get(&self, user_id: Uuid, artist_id: Uuid) -> PaymentResult<Option<Subscription>> {
        let subscription: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions WHERE user_id = $1 AND artist_id = $2"
        ))
        .bind(user_id)
        .bind(artist_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_status_mapping() {
        assert_eq!(
            map_gateway_status(&GatewaySubscriptionStatus::Active),
            Some("active")
        );
        assert_eq!(
            map_gateway_status(&GatewaySubscriptionStatus::Completed),
            Some("completed")
        );
        assert_eq!(
            map_gateway_status(&GatewaySubscriptionStatus::Cancelled),
            Some("cancelled")
        );
        assert_eq!(
            map_gateway_status(&GatewaySubscriptionStatus::Halted),
            Some("cancelled")
        );
        assert_eq!(
            map_gateway_status(&GatewaySubscriptionStatus::Authenticated),
            None
        );
        assert_eq!(
            map_gateway_status(&GatewaySubscriptionStatus::Other("created".to_string())),
            None
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_out_of_order_renewal_never_shortens_access(pool: PgPool) {
        use crate::correlation::{GatewayCorrelation, ItemType};
        use crate::transactions::{NewTransaction, TransactionStore};
        use rust_decimal_macros::dec;

        let store = TransactionStore::new(pool.clone());
        let txn = store
            .create_pending(NewTransaction {
                user_id: Uuid::new_v4(),
                artist_id: Uuid::new_v4(),
                item_type: ItemType::ArtistSubscription,
                item_id: Uuid::new_v4(),
                amount: dec!(10),
                currency: "USD".to_string(),
                platform_fee: dec!(2),
                artist_share: dec!(8),
                correlation: GatewayCorrelation::Stripe {
                    payment_intent_id: None,
                    subscription_id: Some("sub_ooo_1".to_string()),
                },
                metadata: Some(serde_json::json!({"cycle": "1m"})),
            })
            .await
            .unwrap();

        let lifecycle = SubscriptionLifecycle::new(pool);
        let base = OffsetDateTime::now_utc().unix_timestamp();
        let far = OffsetDateTime::from_unix_timestamp(base + 60 * 86_400).unwrap();
        let near = OffsetDateTime::from_unix_timestamp(base + 10 * 86_400).unwrap();

        let first = lifecycle
            .activate_or_renew(&txn, Some("sub_ooo_1"), Some(far))
            .await
            .unwrap();
        assert_eq!(first.valid_until, far);

        // A late renewal carrying an older period end must not shorten access
        let second = lifecycle
            .activate_or_renew(&txn, Some("sub_ooo_1"), Some(near))
            .await
            .unwrap();
        assert_eq!(second.valid_until, far);
        assert_eq!(second.status, SUB_ACTIVE);
    }
}
