//! Provider customer management
//!
//! A user gets exactly one provider customer, created lazily on first
//! checkout and reused forever after. The write is guarded so a concurrent
//! pair of checkouts cannot each persist a different customer id.

use sqlx::PgPool;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Resolve the provider customer id for a user, creating it on first
    /// use. Idempotent across repeated and concurrent calls.
    pub async fn get_or_create_customer(&self, user_id: Uuid) -> BillingResult<String> {
        let row: Option<(Option<String>, String, String)> =
            sqlx::query_as("SELECT stripe_customer_id, email, name FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let (existing, email, name) = match row {
            Some(r) => r,
            None => return Err(BillingError::Validation(format!("unknown user {user_id}"))),
        };

        if let Some(customer_id) = existing {
            tracing::debug!(
                user_id = %user_id,
                customer_id = %customer_id,
                "Reusing existing Stripe customer"
            );
            return Ok(customer_id);
        }

        let customer = self
            .stripe
            .retry("customer.create", || {
                let mut metadata = std::collections::HashMap::new();
                metadata.insert("user_id".to_string(), user_id.to_string());
                metadata.insert("platform".to_string(), "nestling".to_string());

                let params = stripe::CreateCustomer {
                    email: Some(&email),
                    name: Some(&name),
                    metadata: Some(metadata),
                    ..Default::default()
                };
                stripe::Customer::create(self.stripe.inner(), params)
            })
            .await?;

        // Write-once: if another checkout raced us and already stored a
        // customer id, keep theirs and use it.
        let updated = sqlx::query(
            r#"
            UPDATE users SET stripe_customer_id = $1, updated_at = NOW()
            WHERE id = $2 AND stripe_customer_id IS NULL
            "#,
        )
        .bind(customer.id.as_str())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let (winner,): (Option<String>,) =
                sqlx::query_as("SELECT stripe_customer_id FROM users WHERE id = $1")
                    .bind(user_id)
                    .fetch_one(&self.pool)
                    .await?;

            if let Some(winner) = winner {
                tracing::info!(
                    user_id = %user_id,
                    kept_customer_id = %winner,
                    orphaned_customer_id = %customer.id,
                    "Concurrent customer creation; keeping the first stored id"
                );
                return Ok(winner);
            }
        }

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created new Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    /// Look up the local user owning a provider customer id.
    pub async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Uuid> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(id,)| id)
            .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))
    }
}
