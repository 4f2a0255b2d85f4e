//! Plan and product reference data
//!
//! Plans map provider prices to local entitlements; products are the
//! catalog for one-off orders. Both are mutated only by admin tooling —
//! the reconciler reads them and treats a missing plan as a configuration
//! defect.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub stripe_price_id: String,
    pub amount_cents: i32,
    pub billing_interval: String,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub unit_price_cents: i32,
    pub active: bool,
}

/// An order line item as requested by the client: product id and quantity
/// only. Prices are never accepted from the client.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RequestedItem {
    pub product_id: Uuid,
    pub quantity: u32,
}

/// A line item priced server-side from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i32,
}

impl PricedItem {
    pub fn subtotal_cents(&self) -> i64 {
        i64::from(self.unit_price_cents) * i64::from(self.quantity)
    }
}

/// Largest amount (in cents) an order or a single line may reach. Bounded
/// by the INTEGER columns that store totals and quantities.
pub const MAX_AMOUNT_CENTS: i64 = i32::MAX as i64;

/// Price requested items against a catalog snapshot.
///
/// Pure so the validation rules are testable without a database: every
/// product id must resolve to an active catalog row, quantities must be
/// positive, and the resulting prices come from the catalog alone. Line
/// subtotals and the order total are bounded by [`MAX_AMOUNT_CENTS`] so
/// they always fit the INTEGER columns they are persisted into.
pub fn price_items(catalog: &[Product], items: &[RequestedItem]) -> BillingResult<Vec<PricedItem>> {
    if items.is_empty() {
        return Err(BillingError::Validation(
            "order must contain at least one item".to_string(),
        ));
    }

    let priced = items
        .iter()
        .map(|item| {
            if item.quantity == 0 {
                return Err(BillingError::Validation(format!(
                    "quantity for product {} must be positive",
                    item.product_id
                )));
            }
            if i64::from(item.quantity) > MAX_AMOUNT_CENTS {
                return Err(BillingError::Validation(format!(
                    "quantity for product {} exceeds the supported maximum",
                    item.product_id
                )));
            }

            let product = catalog
                .iter()
                .find(|p| p.id == item.product_id && p.active)
                .ok_or_else(|| {
                    BillingError::Validation(format!(
                        "unknown or inactive product {}",
                        item.product_id
                    ))
                })?;

            let priced = PricedItem {
                product_id: product.id,
                product_name: product.name.clone(),
                quantity: item.quantity,
                unit_price_cents: product.unit_price_cents,
            };
            if priced.subtotal_cents() > MAX_AMOUNT_CENTS {
                return Err(BillingError::Validation(format!(
                    "line subtotal for product {} exceeds the supported maximum",
                    item.product_id
                )));
            }
            Ok(priced)
        })
        .collect::<BillingResult<Vec<_>>>()?;

    if order_total_cents(&priced) > MAX_AMOUNT_CENTS {
        return Err(BillingError::Validation(
            "order total exceeds the supported maximum".to_string(),
        ));
    }

    Ok(priced)
}

pub fn order_total_cents(items: &[PricedItem]) -> i64 {
    items.iter().map(PricedItem::subtotal_cents).sum()
}

/// Catalog access plus admin-time provider object creation.
#[derive(Clone)]
pub struct CatalogService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CatalogService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    pub async fn plan_by_id(&self, plan_id: Uuid) -> BillingResult<Plan> {
        sqlx::query_as::<_, Plan>(
            "SELECT id, name, stripe_price_id, amount_cents, billing_interval, active, created_at \
             FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::Validation(format!("unknown plan {plan_id}")))
    }

    /// Resolve a plan by its provider price id. Absence is a configuration
    /// defect (`PlanNotFound`), not a skippable condition.
    pub async fn plan_by_price_id(&self, price_id: &str) -> BillingResult<Plan> {
        sqlx::query_as::<_, Plan>(
            "SELECT id, name, stripe_price_id, amount_cents, billing_interval, active, created_at \
             FROM plans WHERE stripe_price_id = $1",
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::PlanNotFound(price_id.to_string()))
    }

    /// Load the active product rows referenced by an order request.
    pub async fn products_for_items(
        &self,
        items: &[RequestedItem],
    ) -> BillingResult<Vec<Product>> {
        let ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        let products = sqlx::query_as::<_, Product>(
            "SELECT id, name, unit_price_cents, active FROM products WHERE id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(products)
    }

    /// Admin-time only: create a provider price for a new plan and record
    /// the local row. The reconciler never calls this.
    pub async fn create_plan(
        &self,
        name: &str,
        amount_cents: i64,
        interval: &str,
    ) -> BillingResult<Plan> {
        use stripe::{CreatePrice, CreatePriceRecurring, CreatePriceRecurringInterval, Currency};

        if amount_cents <= 0 {
            return Err(BillingError::Validation(
                "plan amount must be positive".to_string(),
            ));
        }
        let amount = i32::try_from(amount_cents).map_err(|_| {
            BillingError::Validation("plan amount exceeds the supported maximum".to_string())
        })?;

        let recurring_interval = match interval {
            "year" | "annual" => CreatePriceRecurringInterval::Year,
            _ => CreatePriceRecurringInterval::Month,
        };

        let price = self
            .stripe
            .retry("price.create", || {
                let mut params = CreatePrice::new(Currency::USD);
                params.unit_amount = Some(amount_cents);
                params.nickname = Some(name);
                params.recurring = Some(CreatePriceRecurring {
                    interval: recurring_interval,
                    interval_count: None,
                    aggregate_usage: None,
                    trial_period_days: None,
                    usage_type: None,
                });
                stripe::Price::create(self.stripe.inner(), params)
            })
            .await?;

        let plan = sqlx::query_as::<_, Plan>(
            r#"
            INSERT INTO plans (name, stripe_price_id, amount_cents, billing_interval, active)
            VALUES ($1, $2, $3, $4, TRUE)
            RETURNING id, name, stripe_price_id, amount_cents, billing_interval, active, created_at
            "#,
        )
        .bind(name)
        .bind(price.id.as_str())
        .bind(amount)
        .bind(interval)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            plan_id = %plan.id,
            price_id = %plan.stripe_price_id,
            amount_cents = amount_cents,
            "Created plan and provider price"
        );

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<Product> {
        vec![
            Product {
                id: Uuid::new_v4(),
                name: "Milestone Cards".to_string(),
                unit_price_cents: 1500,
                active: true,
            },
            Product {
                id: Uuid::new_v4(),
                name: "Photo Book".to_string(),
                unit_price_cents: 4900,
                active: true,
            },
            Product {
                id: Uuid::new_v4(),
                name: "Retired Bundle".to_string(),
                unit_price_cents: 9900,
                active: false,
            },
        ]
    }

    #[test]
    fn prices_items_from_catalog_only() {
        let catalog = catalog();
        let items = vec![
            RequestedItem {
                product_id: catalog[0].id,
                quantity: 2,
            },
            RequestedItem {
                product_id: catalog[1].id,
                quantity: 1,
            },
        ];

        let priced = price_items(&catalog, &items).unwrap();
        assert_eq!(priced[0].unit_price_cents, 1500);
        assert_eq!(priced[0].subtotal_cents(), 3000);
        assert_eq!(order_total_cents(&priced), 7900);
    }

    #[test]
    fn unknown_product_is_rejected() {
        let catalog = catalog();
        let items = vec![
            RequestedItem {
                product_id: catalog[0].id,
                quantity: 1,
            },
            RequestedItem {
                product_id: Uuid::new_v4(),
                quantity: 1,
            },
        ];

        assert!(matches!(
            price_items(&catalog, &items),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn inactive_product_is_rejected() {
        let catalog = catalog();
        let items = vec![RequestedItem {
            product_id: catalog[2].id,
            quantity: 1,
        }];

        assert!(matches!(
            price_items(&catalog, &items),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let catalog = catalog();
        let items = vec![RequestedItem {
            product_id: catalog[0].id,
            quantity: 0,
        }];

        assert!(price_items(&catalog, &items).is_err());
    }

    #[test]
    fn empty_order_is_rejected() {
        assert!(price_items(&catalog(), &[]).is_err());
    }

    #[test]
    fn line_subtotal_beyond_storage_bound_is_rejected() {
        // 2,000,000 units at 1999 cents is 3,998,000,000 cents, past what
        // an INTEGER column can hold. The request must fail validation
        // rather than wrap negative on insert.
        let catalog = vec![Product {
            id: Uuid::new_v4(),
            name: "Photo Book".to_string(),
            unit_price_cents: 1999,
            active: true,
        }];
        let items = vec![RequestedItem {
            product_id: catalog[0].id,
            quantity: 2_000_000,
        }];

        assert!(matches!(
            price_items(&catalog, &items),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn order_total_beyond_storage_bound_is_rejected() {
        // Each line fits on its own but the combined total does not.
        let catalog = vec![
            Product {
                id: Uuid::new_v4(),
                name: "Milestone Cards".to_string(),
                unit_price_cents: i32::MAX / 2,
                active: true,
            },
            Product {
                id: Uuid::new_v4(),
                name: "Photo Book".to_string(),
                unit_price_cents: i32::MAX / 2,
                active: true,
            },
        ];
        let items = vec![
            RequestedItem {
                product_id: catalog[0].id,
                quantity: 1,
            },
            RequestedItem {
                product_id: catalog[1].id,
                quantity: 2,
            },
        ];

        assert!(matches!(
            price_items(&catalog, &items),
            Err(BillingError::Validation(_))
        ));
    }
}
