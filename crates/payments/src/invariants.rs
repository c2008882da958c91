//! Financial invariants
//!
//! Runnable consistency checks for the reconciliation core. Each invariant
//! is a real SQL query; checks only read, never write. Run after webhook
//! replays or before payout batches to confirm the system is in a valid
//! state.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::PaymentResult;

/// A single detected inconsistency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Record(s) affected
    pub record_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may be wrong
    Critical,
    /// Data inconsistency needing attention
    High,
    /// Should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of a full invariant run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceEquationRow {
    artist_id: Uuid,
    total_earned: rust_decimal::Decimal,
    available_balance: rust_decimal::Decimal,
    total_paid_out: rust_decimal::Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidTransactionRow {
    id: Uuid,
    artist_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct SplitMismatchRow {
    id: Uuid,
    amount: rust_decimal::Decimal,
    platform_fee: rust_decimal::Decimal,
    artist_share: rust_decimal::Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct PayoutRow {
    id: Uuid,
    artist_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateSubRow {
    user_id: Uuid,
    artist_id: Uuid,
    sub_count: i64,
}

/// Service for running financial invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary
    pub async fn run_all_checks(&self) -> PaymentResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_balance_equation().await?);
        violations.extend(self.check_paid_has_usd_fields().await?);
        violations.extend(self.check_paid_has_credit().await?);
        violations.extend(self.check_split_adds_up().await?);
        violations.extend(self.check_payout_has_debit().await?);
        violations.extend(self.check_single_subscription_per_pair().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: availableBalance = totalEarned - totalPaidOut
    ///
    /// The database CHECK constraint should make this unreachable; a
    /// violation means writes bypassed the ledger services.
    async fn check_balance_equation(&self) -> PaymentResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceEquationRow> = sqlx::query_as(
            r#"
            SELECT artist_id, total_earned, available_balance, total_paid_out
            FROM artist_balances
            WHERE available_balance != total_earned - total_paid_out
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "balance_equation".to_string(),
                record_ids: vec![row.artist_id],
                description: format!(
                    "Artist balance broken: available {} != earned {} - paid out {}",
                    row.available_balance, row.total_earned, row.total_paid_out
                ),
                context: serde_json::json!({
                    "total_earned": row.total_earned,
                    "available_balance": row.available_balance,
                    "total_paid_out": row.total_paid_out,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: every paid transaction carries its USD normalization
    /// fields, stamped atomically with the paid flip
    async fn check_paid_has_usd_fields(&self) -> PaymentResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidTransactionRow> = sqlx::query_as(
            r#"
            SELECT id, artist_id FROM transactions
            WHERE status = 'paid'
              AND (amount_usd IS NULL OR exchange_rate IS NULL OR exchange_rate_at IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_has_usd_fields".to_string(),
                record_ids: vec![row.id],
                description: "Paid transaction missing USD normalization fields".to_string(),
                context: serde_json::json!({ "artist_id": row.artist_id }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: every paid transaction has exactly one ledger credit
    async fn check_paid_has_credit(&self) -> PaymentResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidTransactionRow> = sqlx::query_as(
            r#"
            SELECT t.id, t.artist_id FROM transactions t
            WHERE t.status = 'paid'
              AND NOT EXISTS (
                  SELECT 1 FROM artist_ledger l
                  WHERE l.entry_type = 'credit' AND l.ref_id = t.id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_has_credit".to_string(),
                record_ids: vec![row.id],
                description: "Paid transaction has no corresponding ledger credit".to_string(),
                context: serde_json::json!({ "artist_id": row.artist_id }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: artistShare + platformFee = amount on every transaction
    async fn check_split_adds_up(&self) -> PaymentResult<Vec<InvariantViolation>> {
        let rows: Vec<SplitMismatchRow> = sqlx::query_as(
            r#"
            SELECT id, amount, platform_fee, artist_share FROM transactions
            WHERE artist_share + platform_fee != amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "split_adds_up".to_string(),
                record_ids: vec![row.id],
                description: format!(
                    "Transaction split broken: {} + {} != {}",
                    row.artist_share, row.platform_fee, row.amount
                ),
                context: serde_json::json!({
                    "amount": row.amount,
                    "platform_fee": row.platform_fee,
                    "artist_share": row.artist_share,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: every payout has exactly one ledger debit
    async fn check_payout_has_debit(&self) -> PaymentResult<Vec<InvariantViolation>> {
        let rows: Vec<PayoutRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.artist_id FROM artist_payouts p
            WHERE NOT EXISTS (
                SELECT 1 FROM artist_ledger l
                WHERE l.entry_type = 'debit' AND l.ref_id = p.id
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "payout_has_debit".to_string(),
                record_ids: vec![row.id],
                description: "Payout has no corresponding ledger debit".to_string(),
                context: serde_json::json!({ "artist_id": row.artist_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: at most one subscription per (user, artist) pair
    async fn check_single_subscription_per_pair(&self) -> PaymentResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateSubRow> = sqlx::query_as(
            r#"
            SELECT user_id, artist_id, COUNT(*) as sub_count
            FROM subscriptions
            GROUP BY user_id, artist_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_subscription_per_pair".to_string(),
                record_ids: vec![row.user_id, row.artist_id],
                description: format!(
                    "(user, artist) pair has {} subscription rows (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> PaymentResult<Vec<InvariantViolation>> {
        match name {
            "balance_equation" => self.check_balance_equation().await,
            "paid_has_usd_fields" => self.check_paid_has_usd_fields().await,
            "paid_has_credit" => self.check_paid_has_credit().await,
            "split_adds_up" => self.check_split_adds_up().await,
            "payout_has_debit" => self.check_payout_has_debit().await,
            "single_subscription_per_pair" => self.check_single_subscription_per_pair().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "balance_equation",
            "paid_has_usd_fields",
            "paid_has_credit",
            "split_adds_up",
            "payout_has_debit",
            "single_subscription_per_pair",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"balance_equation"));
        assert!(checks.contains(&"paid_has_credit"));
    }
}
