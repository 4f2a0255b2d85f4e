//! Order persistence and reconciliation transitions
//!
//! Orders are created only by the checkout bridge (as pending, with their
//! line items priced server-side and a correlation key written once). The
//! webhook path may mark an order paid; the refund executor may mark it
//! refunded. Nothing in this module ever creates an order from an inbound
//! event.

use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use nestling_shared::OrderStatus;

use crate::catalog::PricedItem;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub correlation_key: String,
    pub payment_reference: Option<String>,
    pub total_cents: i32,
    pub customer_name: String,
    pub customer_email: String,
    pub shipping_address: Value,
    pub payment_metadata: Value,
    pub refund_id: Option<String>,
    pub refunded_amount_cents: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Order {
    pub fn status_parsed(&self) -> Option<OrderStatus> {
        OrderStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct OrderItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price_cents: i32,
}

#[derive(Debug, Clone)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
}

/// Narrow an amount to the INTEGER column range. Checkout validation
/// bounds totals before they reach persistence, so a failure here means a
/// caller skipped pricing; it is rejected, never wrapped.
fn storage_cents(value: i64, what: &str) -> BillingResult<i32> {
    i32::try_from(value).map_err(|_| {
        BillingError::Validation(format!("{what} {value} exceeds the supported maximum"))
    })
}

/// Decide what a missed paid transition means. A refunded order is
/// terminal, so a late completion for it is a no-op that returns the row
/// untouched; any other miss is a lookup failure.
fn settle_missed_paid_transition(
    existing: Option<Order>,
    correlation_key: &str,
) -> BillingResult<Order> {
    match existing {
        Some(order) if order.status_parsed() == Some(OrderStatus::Refunded) => Ok(order),
        _ => Err(BillingError::OrderNotFound(correlation_key.to_string())),
    }
}

#[derive(Clone)]
pub struct OrderService {
    pool: PgPool,
}

impl OrderService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pending order with its server-priced line items and a
    /// freshly generated correlation key.
    pub async fn create_pending(
        &self,
        user_id: Uuid,
        items: &[PricedItem],
        customer: &CustomerInfo,
        shipping_address: Value,
        total_cents: i64,
    ) -> BillingResult<Order> {
        let correlation_key = format!("ord_{}", Uuid::new_v4().simple());
        let total = storage_cents(total_cents, "order total")?;

        let mut tx = self.pool.begin().await?;

        let order = sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders (
                user_id, status, correlation_key, total_cents,
                customer_name, customer_email, shipping_address
            )
            VALUES ($1, 'pending', $2, $3, $4, $5, $6)
            RETURNING id, user_id, status, correlation_key, payment_reference, total_cents,
                      customer_name, customer_email, shipping_address, payment_metadata,
                      refund_id, refunded_amount_cents, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(&correlation_key)
        .bind(total)
        .bind(&customer.name)
        .bind(&customer.email)
        .bind(&shipping_address)
        .fetch_one(&mut *tx)
        .await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, product_id, product_name, quantity, unit_price_cents)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(order.id)
            .bind(item.product_id)
            .bind(&item.product_name)
            .bind(storage_cents(i64::from(item.quantity), "line quantity")?)
            .bind(item.unit_price_cents)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            user_id = %user_id,
            correlation_key = %order.correlation_key,
            total_cents = total_cents,
            "Created pending order"
        );

        Ok(order)
    }

    /// Fetch a pending order for checkout reuse. The correlation key on the
    /// returned row is the one originally generated; it is never replaced.
    pub async fn find_pending(&self, order_id: Uuid, user_id: Uuid) -> BillingResult<Order> {
        let order = self
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| BillingError::Validation(format!("unknown order {order_id}")))?;

        if order.user_id != user_id {
            return Err(BillingError::Validation(format!(
                "order {order_id} does not belong to user {user_id}"
            )));
        }
        if order.status_parsed() != Some(OrderStatus::Pending) {
            return Err(BillingError::InvalidOrderState(
                order.id,
                order.status.clone(),
                "pending".to_string(),
            ));
        }

        Ok(order)
    }

    pub async fn find_by_id(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, status, correlation_key, payment_reference, total_cents,
                   customer_name, customer_email, shipping_address, payment_metadata,
                   refund_id, refunded_amount_cents, created_at, updated_at
            FROM orders WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    pub async fn items_for_order(&self, order_id: Uuid) -> BillingResult<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(
            "SELECT product_id, product_name, quantity, unit_price_cents \
             FROM order_items WHERE order_id = $1 ORDER BY product_name",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    pub async fn find_by_payment_reference(
        &self,
        payment_reference: &str,
    ) -> BillingResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, status, correlation_key, payment_reference, total_cents,
                   customer_name, customer_email, shipping_address, payment_metadata,
                   refund_id, refunded_amount_cents, created_at, updated_at
            FROM orders WHERE payment_reference = $1
            "#,
        )
        .bind(payment_reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn find_by_correlation_key(&self, correlation_key: &str) -> BillingResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, status, correlation_key, payment_reference, total_cents,
                   customer_name, customer_email, shipping_address, payment_metadata,
                   refund_id, refunded_amount_cents, created_at, updated_at
            FROM orders WHERE correlation_key = $1
            "#,
        )
        .bind(correlation_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    /// Reconciler transition: mark the order matching a correlation key as
    /// paid, recording the payment reference and provider metadata.
    ///
    /// Absolute-state write, idempotent under redelivery; refunded orders
    /// are terminal and left untouched, so a completion delivered after a
    /// refund returns the row unchanged. A missing correlation key is an
    /// `OrderNotFound` failure — this path never creates an order, so a
    /// forged or replayed session cannot manufacture a paid one.
    pub async fn mark_paid(
        &self,
        correlation_key: &str,
        payment_reference: &str,
        payment_metadata: Value,
    ) -> BillingResult<Order> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET status = 'paid',
                payment_reference = $2,
                payment_metadata = payment_metadata || $3,
                updated_at = NOW()
            WHERE correlation_key = $1 AND status <> 'refunded'
            RETURNING id, user_id, status, correlation_key, payment_reference, total_cents,
                      customer_name, customer_email, shipping_address, payment_metadata,
                      refund_id, refunded_amount_cents, created_at, updated_at
            "#,
        )
        .bind(correlation_key)
        .bind(payment_reference)
        .bind(&payment_metadata)
        .fetch_optional(&self.pool)
        .await?;

        let Some(order) = order else {
            let existing = self.find_by_correlation_key(correlation_key).await?;
            let order = settle_missed_paid_transition(existing, correlation_key)?;
            tracing::info!(
                order_id = %order.id,
                correlation_key = %correlation_key,
                "Completion for refunded order ignored"
            );
            return Ok(order);
        };

        tracing::info!(
            order_id = %order.id,
            correlation_key = %correlation_key,
            payment_reference = %payment_reference,
            "Order marked paid"
        );

        Ok(order)
    }

    /// Executor transition: record a refund against a paid order.
    ///
    /// Full refunds (cumulative refunded amount covering the total) move
    /// the order to `refunded`, which is terminal. Partial refunds keep the
    /// order `paid` and accumulate the refunded amount.
    pub async fn record_refund(
        &self,
        order_id: Uuid,
        refund_id: &str,
        amount_cents: i64,
    ) -> BillingResult<Order> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET refunded_amount_cents = refunded_amount_cents + $3,
                refund_id = $2,
                status = CASE
                    WHEN refunded_amount_cents + $3 >= total_cents THEN 'refunded'
                    ELSE status
                END,
                updated_at = NOW()
            WHERE id = $1 AND status = 'paid'
            RETURNING id, user_id, status, correlation_key, payment_reference, total_cents,
                      customer_name, customer_email, shipping_address, payment_metadata,
                      refund_id, refunded_amount_cents, created_at, updated_at
            "#,
        )
        .bind(order_id)
        .bind(refund_id)
        .bind(storage_cents(amount_cents, "refund amount")?)
        .fetch_optional(&self.pool)
        .await?;

        order.ok_or_else(|| {
            BillingError::InvalidOrderState(order_id, "not paid".to_string(), "paid".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_with_status(status: &str) -> Order {
        Order {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: status.to_string(),
            correlation_key: "ord_test".to_string(),
            payment_reference: Some("pi_123".to_string()),
            total_cents: 4900,
            customer_name: "Jess Harper".to_string(),
            customer_email: "jess@example.com".to_string(),
            shipping_address: json!({"city": "Portland"}),
            payment_metadata: json!({}),
            refund_id: None,
            refunded_amount_cents: 0,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn amounts_within_column_range_pass_through() {
        assert_eq!(storage_cents(4900, "order total").unwrap(), 4900);
        assert_eq!(
            storage_cents(i64::from(i32::MAX), "order total").unwrap(),
            i32::MAX
        );
    }

    #[test]
    fn oversized_amount_is_rejected_not_wrapped() {
        // 2,000,000 units at 1999 cents: an `as i32` cast would store this
        // as a negative total.
        let total = 2_000_000_i64 * 1999;
        assert!(matches!(
            storage_cents(total, "order total"),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn late_completion_for_refunded_order_is_a_noop() {
        let order = order_with_status("refunded");
        let resolved = settle_missed_paid_transition(Some(order.clone()), "ord_test").unwrap();
        assert_eq!(resolved.id, order.id);
        assert_eq!(resolved.status, "refunded");
    }

    #[test]
    fn missed_transition_without_order_is_not_found() {
        assert!(matches!(
            settle_missed_paid_transition(None, "ord_missing"),
            Err(BillingError::OrderNotFound(_))
        ));
    }

    #[test]
    fn missed_transition_for_live_order_is_not_found() {
        // A non-refunded row should have matched the update; treat the miss
        // as a lookup failure so the event is retried.
        let order = order_with_status("pending");
        assert!(matches!(
            settle_missed_paid_transition(Some(order), "ord_test"),
            Err(BillingError::OrderNotFound(_))
        ));
    }
}
