//! Billing consistency checks
//!
//! Runnable read-only checks over the billing tables. Because every webhook
//! transition writes absolute state, the tables should satisfy these at any
//! point between events; a violation means a transition was applied wrong
//! or something wrote around the reconciler.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// A single failed consistency check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Affected entity ids (users, orders or subscriptions)
    pub entity_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may be wrong
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
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

/// Summary of a full sweep.
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
struct MultipleSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct EntitlementMismatchRow {
    user_id: Uuid,
    current_plan_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    order_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct OverRefundRow {
    order_id: Uuid,
    total_cents: i32,
    refunded_amount_cents: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    stripe_event_id: String,
    event_type: String,
    processing_started_at: OffsetDateTime,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_live_subscription().await?);
        violations.extend(self.check_entitlement_backed_by_subscription().await?);
        violations.extend(self.check_paid_orders_have_reference().await?);
        violations.extend(self.check_refunded_orders_have_refund_id().await?);
        violations.extend(self.check_refunds_bounded_by_total().await?);
        violations.extend(self.check_no_stuck_webhook_events().await?);

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

    /// Invariant 1: At most one non-canceled subscription per user
    ///
    /// Two live subscriptions would double-bill and make the entitlement
    /// ambiguous.
    async fn check_single_live_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('pending', 'active', 'past_due')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_live_subscription".to_string(),
                entity_ids: vec![row.user_id],
                description: format!(
                    "User has {} live subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: An entitled user has a live subscription for that plan
    ///
    /// `users.current_plan_id` is written only by the reconciler alongside
    /// the subscription row; a plan without a backing live subscription
    /// means a cancellation failed to revoke.
    async fn check_entitlement_backed_by_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<EntitlementMismatchRow> = sqlx::query_as(
            r#"
            SELECT u.id as user_id, u.current_plan_id
            FROM users u
            WHERE u.current_plan_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM subscriptions s
                  WHERE s.user_id = u.id
                    AND s.plan_id = u.current_plan_id
                    AND s.status IN ('pending', 'active', 'past_due')
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "entitlement_backed_by_subscription".to_string(),
                entity_ids: vec![row.user_id],
                description: "User keeps plan entitlement without a live subscription".to_string(),
                context: serde_json::json!({ "current_plan_id": row.current_plan_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Paid orders carry the payment reference
    ///
    /// The reference arrives with the completion event that marks the order
    /// paid; without it the order cannot be refunded.
    async fn check_paid_orders_have_reference(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            r#"
            SELECT id as order_id, status
            FROM orders
            WHERE status = 'paid' AND payment_reference IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_orders_have_reference".to_string(),
                entity_ids: vec![row.order_id],
                description: "Paid order has no payment reference".to_string(),
                context: serde_json::json!({ "status": row.status }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: Refunded orders carry a provider refund id
    async fn check_refunded_orders_have_refund_id(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            r#"
            SELECT id as order_id, status
            FROM orders
            WHERE status = 'refunded' AND refund_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refunded_orders_have_refund_id".to_string(),
                entity_ids: vec![row.order_id],
                description: "Refunded order has no provider refund id".to_string(),
                context: serde_json::json!({ "status": row.status }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Cumulative refunds never exceed the order total
    async fn check_refunds_bounded_by_total(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverRefundRow> = sqlx::query_as(
            r#"
            SELECT id as order_id, total_cents, refunded_amount_cents
            FROM orders
            WHERE refunded_amount_cents > total_cents
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refunds_bounded_by_total".to_string(),
                entity_ids: vec![row.order_id],
                description: format!(
                    "Order refunded {} cents against a {} cent total",
                    row.refunded_amount_cents, row.total_cents
                ),
                context: serde_json::json!({
                    "total_cents": row.total_cents,
                    "refunded_amount_cents": row.refunded_amount_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 6: No webhook event stays claimed for over 30 minutes
    ///
    /// The claim either completes (success) or is released for redelivery;
    /// a long-lived 'processing' row means a handler died without cleanup
    /// and the stale-claim takeover window is the only thing unblocking it.
    async fn check_no_stuck_webhook_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_started_at
            FROM stripe_webhook_events
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - INTERVAL '30 minutes'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhook_events".to_string(),
                entity_ids: vec![],
                description: format!(
                    "Webhook event {} ({}) stuck in processing since {}",
                    row.stripe_event_id, row.event_type, row.processing_started_at
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_display_is_stable() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn summary_serializes_for_the_admin_endpoint() {
        let summary = InvariantCheckSummary {
            checked_at: OffsetDateTime::UNIX_EPOCH,
            checks_run: 6,
            checks_passed: 6,
            checks_failed: 0,
            violations: vec![],
            healthy: true,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["healthy"], true);
        assert_eq!(json["checks_run"], 6);
    }
}
