//! Order refunds through the payment provider
//!
//! Refunds run synchronously against the provider and must succeed there
//! before any local write. The local write then accumulates the refunded
//! amount and flips the order terminal once fully covered.

use sqlx::PgPool;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::orders::{Order, OrderService};

/// Outcome of a refund call, echoed back to the admin caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RefundOutcome {
    pub order_id: Uuid,
    pub refund_id: String,
    pub amount_cents: i64,
    pub fully_refunded: bool,
}

#[derive(Clone)]
pub struct RefundService {
    stripe: StripeClient,
    pool: PgPool,
}

impl RefundService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Refund a paid order, in full or partially.
    ///
    /// `amount_cents = None` refunds the full remaining balance. The order
    /// must be `paid` and carry a payment reference from its completion
    /// event; the remaining refundable balance bounds partial amounts.
    /// Provider first, then the local row — if the provider call fails,
    /// nothing local changes and the order stays refundable.
    pub async fn refund_order(
        &self,
        order_service: &OrderService,
        order_id: Uuid,
        amount_cents: Option<i64>,
    ) -> BillingResult<RefundOutcome> {
        let order = order_service
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| BillingError::OrderNotFound(order_id.to_string()))?;
        let payment_reference = refundable_reference(&order)?;

        let remaining = i64::from(order.total_cents) - i64::from(order.refunded_amount_cents);
        let amount = amount_cents.unwrap_or(remaining);
        if amount <= 0 || amount > remaining {
            return Err(BillingError::Validation(format!(
                "refund amount {amount} out of range, refundable balance is {remaining}"
            )));
        }

        let payment_intent: stripe::PaymentIntentId = payment_reference.parse().map_err(|_| {
            BillingError::Internal(format!(
                "order {order_id} has invalid payment reference {payment_reference}"
            ))
        })?;

        let refund = self
            .stripe
            .retry("refund.create", || {
                let mut params = stripe::CreateRefund::new();
                params.payment_intent = Some(payment_intent.clone());
                params.amount = Some(amount);
                stripe::Refund::create(self.stripe.inner(), params)
            })
            .await?;

        let refund_id = refund.id.to_string();
        let updated = order_service
            .record_refund(order_id, &refund_id, amount)
            .await?;

        let fully_refunded = updated.refunded_amount_cents >= updated.total_cents;
        tracing::info!(
            order_id = %order_id,
            refund_id = %refund_id,
            amount_cents = amount,
            fully_refunded = fully_refunded,
            "Order refund completed"
        );

        Ok(RefundOutcome {
            order_id,
            refund_id,
            amount_cents: amount,
            fully_refunded,
        })
    }

    /// Pool handle for invariant sweeps that piggyback on this service.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn refundable_reference(order: &Order) -> BillingResult<&str> {
    if order.status_parsed() != Some(nestling_shared::OrderStatus::Paid) {
        return Err(BillingError::InvalidOrderState(
            order.id,
            order.status.clone(),
            "paid".to_string(),
        ));
    }
    order.payment_reference.as_deref().ok_or_else(|| {
        BillingError::Internal(format!("paid order {} has no payment reference", order.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::OffsetDateTime;

    fn paid_order(total: i32, refunded: i32) -> Order {
        Order {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: "paid".to_string(),
            correlation_key: "ord_test".to_string(),
            payment_reference: Some("pi_123".to_string()),
            total_cents: total,
            customer_name: "Jess Harper".to_string(),
            customer_email: "jess@example.com".to_string(),
            shipping_address: json!({"city": "Portland"}),
            payment_metadata: json!({}),
            refund_id: None,
            refunded_amount_cents: refunded,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn pending_order_is_not_refundable() {
        let mut order = paid_order(2500, 0);
        order.status = "pending".to_string();
        let err = refundable_reference(&order).unwrap_err();
        assert!(matches!(err, BillingError::InvalidOrderState(_, _, _)));
    }

    #[test]
    fn paid_order_without_reference_is_an_internal_defect() {
        let mut order = paid_order(2500, 0);
        order.payment_reference = None;
        let err = refundable_reference(&order).unwrap_err();
        assert!(matches!(err, BillingError::Internal(_)));
    }

    #[test]
    fn paid_order_reference_is_returned() {
        let order = paid_order(2500, 0);
        assert_eq!(refundable_reference(&order).unwrap(), "pi_123");
    }
}
