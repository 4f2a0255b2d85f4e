//! Billing error taxonomy
//!
//! Webhook processing distinguishes rejection (bad signature, malformed
//! payload — the provider must not retry with the same body and succeed)
//! from reconciliation failure (a row we expected is missing — the provider
//! should retry after the configuration defect is fixed). Duplicate event
//! delivery is *not* an error anywhere in this crate.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Webhook signature header failed verification. Rejected before any
    /// parsing of the payload body.
    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    /// The payload passed signature verification but is not a well-formed
    /// event envelope.
    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// Request-level validation failure (unknown product, bad amount, …).
    /// Raised before any provider call is made.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// An event referenced a provider price with no local Plan. This is a
    /// catalog configuration defect, never silently ignored.
    #[error("No plan configured for provider price {0}")]
    PlanNotFound(String),

    /// A payment-mode checkout completed with a correlation key that
    /// matches no local order. The webhook path never creates orders, so
    /// this surfaces as a failure and the provider redelivers.
    #[error("No order found for correlation key {0}")]
    OrderNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    /// The requested financial action is not valid for the order's current
    /// status (e.g. refunding an order that is not paid).
    #[error("Order {0} is {1}, expected {2}")]
    InvalidOrderState(uuid::Uuid, String, String),

    /// Outbound provider call failed after bounded retries.
    #[error("Stripe API error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the webhook ingress should reject the delivery outright
    /// (HTTP 400) rather than ask the provider to retry (HTTP 500).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BillingError::SignatureInvalid | BillingError::MalformedPayload(_)
        )
    }
}
