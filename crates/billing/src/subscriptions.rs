//! Subscription state reconciliation and admin cancellation
//!
//! The provider is the single source of truth for subscription state:
//! every transition here overwrites local fields with absolute values from
//! the event payload, never applies a delta, and therefore converges to
//! the provider's state regardless of delivery order. The reconciler is
//! the only writer of subscription rows; the admin cancellation path talks
//! to the provider and waits for the resulting webhook.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use nestling_shared::SubscriptionStatus;

use crate::catalog::CatalogService;
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionObject;

/// Map a provider subscription status onto the local lifecycle.
///
/// The provider's vocabulary is wider than ours; everything collapses onto
/// the four local states. Unknown strings map to `Pending` so a new
/// provider status degrades to "not yet entitled" rather than failing.
pub fn map_provider_status(provider_status: &str) -> SubscriptionStatus {
    match provider_status {
        "active" | "trialing" => SubscriptionStatus::Active,
        "past_due" | "unpaid" => SubscriptionStatus::PastDue,
        "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::Pending,
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub stripe_subscription_id: String,
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, stripe_subscription_id, status, \
     current_period_start, current_period_end, cancel_at_period_end";

#[derive(Clone)]
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    pub async fn find_by_provider_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE stripe_subscription_id = $1"
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    pub async fn find_by_id(&self, id: Uuid) -> BillingResult<Subscription> {
        sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }

    /// Bridge-flow completion: record the pending local subscription for a
    /// checkout session this application created.
    ///
    /// This is the only insertion point for subscription rows. It runs on
    /// the subscription-mode `checkout_session.completed` event, which
    /// carries our own session metadata (user, plan) — the `subscription.*`
    /// reconciler path stays strictly lookup-only.
    pub async fn record_from_checkout(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        stripe_subscription_id: &str,
    ) -> BillingResult<()> {
        // Idempotent under redelivery: the unique provider id makes the
        // second insert a no-op.
        sqlx::query(
            r#"
            INSERT INTO subscriptions (user_id, plan_id, stripe_subscription_id, status)
            VALUES ($1, $2, $3, 'pending')
            ON CONFLICT (stripe_subscription_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            subscription_id = %stripe_subscription_id,
            "Recorded pending subscription from checkout"
        );

        Ok(())
    }

    /// Reconcile a `subscription.created` / `subscription.updated` payload.
    ///
    /// Looks up the local row by provider id; an absent row is an orphan
    /// (logged and skipped — this path never fabricates subscriptions).
    /// Status, period bounds and `cancel_at_period_end` are overwritten
    /// verbatim from the payload. Canceled rows are terminal and ignored.
    pub async fn apply_provider_state(
        &self,
        catalog: &CatalogService,
        payload: &SubscriptionObject,
    ) -> BillingResult<()> {
        let local = match self.find_by_provider_id(&payload.id).await? {
            Some(sub) => sub,
            None => {
                tracing::warn!(
                    subscription_id = %payload.id,
                    provider_status = %payload.status,
                    "Orphan subscription event, no local row; skipping"
                );
                return Ok(());
            }
        };

        // A missing plan for the event's price is a catalog defect, not a
        // skippable condition.
        let plan = match payload.price_id() {
            Some(price_id) => catalog.plan_by_price_id(price_id).await?,
            None => catalog.plan_by_id(local.plan_id).await?,
        };

        let status = map_provider_status(&payload.status);
        let period_start = payload.current_period_start.map(to_timestamp).transpose()?;
        let period_end = payload.current_period_end.map(to_timestamp).transpose()?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2,
                plan_id = $3,
                current_period_start = $4,
                current_period_end = $5,
                cancel_at_period_end = $6,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1 AND status <> 'canceled'
            "#,
        )
        .bind(&payload.id)
        .bind(status.as_str())
        .bind(plan.id)
        .bind(period_start)
        .bind(period_end)
        .bind(payload.cancel_at_period_end)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tracing::info!(
                subscription_id = %payload.id,
                "Subscription already canceled; ignoring provider state event"
            );
            tx.rollback().await?;
            return Ok(());
        }

        // Keep the owner's entitlement in lockstep with the subscription.
        let plan_for_profile = if status == SubscriptionStatus::Canceled {
            None
        } else {
            Some(plan.id)
        };
        sqlx::query("UPDATE users SET current_plan_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(local.user_id)
            .bind(plan_for_profile)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %payload.id,
            user_id = %local.user_id,
            status = %status,
            cancel_at_period_end = payload.cancel_at_period_end,
            "Subscription state reconciled"
        );

        Ok(())
    }

    /// Reconcile `subscription.deleted`: terminal cancellation.
    ///
    /// Sets `canceled`, clears `cancel_at_period_end`, and revokes the
    /// owner's entitlement in the same transaction.
    pub async fn apply_deleted(&self, payload: &SubscriptionObject) -> BillingResult<()> {
        let local = match self.find_by_provider_id(&payload.id).await? {
            Some(sub) => sub,
            None => {
                tracing::warn!(
                    subscription_id = %payload.id,
                    "Orphan subscription.deleted, no local row; skipping"
                );
                return Ok(());
            }
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', cancel_at_period_end = FALSE, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(&payload.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE users SET current_plan_id = NULL, updated_at = NOW() WHERE id = $1")
            .bind(local.user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %payload.id,
            user_id = %local.user_id,
            "Subscription canceled, entitlement revoked"
        );

        Ok(())
    }

    /// Reconcile `invoice.payment_succeeded` for a subscription id.
    ///
    /// Absolute set to `active` — this is how a past_due subscription
    /// recovers, and it holds from any prior status. No matching row is a
    /// skip (the invoice may predate our bridge or belong elsewhere).
    pub async fn apply_payment_succeeded(&self, stripe_subscription_id: &str) -> BillingResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'active', updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            tracing::warn!(
                subscription_id = %stripe_subscription_id,
                "Payment succeeded for unknown subscription; skipping"
            );
        } else {
            tracing::info!(
                subscription_id = %stripe_subscription_id,
                "Subscription active after successful payment"
            );
        }

        Ok(())
    }

    /// Reconcile `invoice.payment_failed`: mark past_due.
    ///
    /// Never cancels by itself — cancellation arrives only via
    /// `subscription.deleted`. Canceled rows stay canceled.
    pub async fn apply_payment_failed(&self, stripe_subscription_id: &str) -> BillingResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'past_due', updated_at = NOW()
            WHERE stripe_subscription_id = $1 AND status <> 'canceled'
            "#,
        )
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            tracing::warn!(
                subscription_id = %stripe_subscription_id,
                "Payment failed for unknown or canceled subscription; skipping"
            );
        } else {
            tracing::warn!(
                subscription_id = %stripe_subscription_id,
                "Subscription past_due after failed payment"
            );
        }

        Ok(())
    }

    /// Admin action: cancel the subscription at the provider.
    ///
    /// Deliberately writes no local state. The provider emits
    /// `subscription.updated` (period-end cancellation) or
    /// `subscription.deleted` (immediate), and the reconciler applies it —
    /// keeping a single writer for subscription rows and avoiding a race
    /// between this synchronous call and the asynchronous event.
    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        at_period_end: bool,
    ) -> BillingResult<()> {
        let local = self.find_by_id(subscription_id).await?;

        if SubscriptionStatus::parse(&local.status) == Some(SubscriptionStatus::Canceled) {
            return Err(BillingError::Validation(format!(
                "subscription {subscription_id} is already canceled"
            )));
        }

        let provider_id: stripe::SubscriptionId =
            local.stripe_subscription_id.parse().map_err(|_| {
                BillingError::Internal(format!(
                    "invalid provider subscription id {}",
                    local.stripe_subscription_id
                ))
            })?;

        if at_period_end {
            self.stripe
                .retry("subscription.update", || {
                    let params = stripe::UpdateSubscription {
                        cancel_at_period_end: Some(true),
                        ..Default::default()
                    };
                    stripe::Subscription::update(self.stripe.inner(), &provider_id, params)
                })
                .await?;
        } else {
            self.stripe
                .retry("subscription.cancel", || {
                    let params = stripe::CancelSubscription {
                        cancellation_details: None,
                        invoice_now: None,
                        prorate: None,
                    };
                    stripe::Subscription::cancel(self.stripe.inner(), &provider_id, params)
                })
                .await?;
        }

        tracing::info!(
            subscription_id = %subscription_id,
            provider_subscription_id = %local.stripe_subscription_id,
            at_period_end = at_period_end,
            "Requested cancellation at provider; local state follows via webhook"
        );

        Ok(())
    }
}

fn to_timestamp(unix: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|e| BillingError::MalformedPayload(format!("invalid timestamp {unix}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_collapses_onto_local_lifecycle() {
        assert_eq!(map_provider_status("active"), SubscriptionStatus::Active);
        assert_eq!(map_provider_status("trialing"), SubscriptionStatus::Active);
        assert_eq!(map_provider_status("past_due"), SubscriptionStatus::PastDue);
        assert_eq!(map_provider_status("unpaid"), SubscriptionStatus::PastDue);
        assert_eq!(
            map_provider_status("canceled"),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            map_provider_status("incomplete_expired"),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            map_provider_status("incomplete"),
            SubscriptionStatus::Pending
        );
    }

    #[test]
    fn unknown_provider_status_degrades_to_pending() {
        // Forward compatibility: a status we have never seen must not
        // grant or revoke entitlement.
        assert_eq!(
            map_provider_status("some_future_status"),
            SubscriptionStatus::Pending
        );
    }

    #[test]
    fn timestamp_conversion_rejects_out_of_range() {
        assert!(to_timestamp(1_700_000_000).is_ok());
        assert!(to_timestamp(i64::MAX).is_err());
    }
}
