// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries Stripe error payloads
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Nestling Billing Module
//!
//! Reconciles payment-provider events against local billing state.
//!
//! ## Features
//!
//! - **Webhook ingestion**: Signature-verified Stripe event intake with an
//!   atomic dedup guard (exactly one execution per event id)
//! - **State reconciliation**: Absolute-state subscription and order
//!   transitions that converge under redelivery and reordering
//! - **Checkout bridge**: Hosted checkout sessions for plans and one-off
//!   orders, correlated through versioned session metadata
//! - **Financial actions**: Admin-initiated refunds and cancellations,
//!   applied provider-first
//! - **Invariants**: Runnable consistency checks over the billing tables

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod dedup;
pub mod error;
pub mod events;
pub mod invariants;
pub mod orders;
pub mod refund;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{CatalogService, Plan, PricedItem, Product, RequestedItem};

// Checkout
pub use checkout::{CheckoutService, CheckoutSessionInfo, OrderCheckoutRequest, ReturnUrls};

// Client
pub use client::{StripeClient, StripeConfig};

// Customer
pub use customer::CustomerService;

// Dedup
pub use dedup::{ClaimOutcome, DedupGuard, ProcessedEventRecord};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    CheckoutKind, CheckoutSessionObject, EventType, InvoiceObject, SessionMetadata,
    SubscriptionObject, WebhookEvent,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Orders
pub use orders::{CustomerInfo, Order, OrderItem, OrderService};

// Refund
pub use refund::{RefundOutcome, RefundService};

// Subscriptions
pub use subscriptions::{Subscription, SubscriptionService};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: CatalogService,
    pub checkout: CheckoutService,
    pub customer: CustomerService,
    pub invariants: InvariantChecker,
    pub orders: OrderService,
    pub refund: RefundService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config);
        let catalog = CatalogService::new(stripe.clone(), pool.clone());
        let customer = CustomerService::new(stripe.clone(), pool.clone());
        let orders = OrderService::new(pool.clone());
        let subscriptions = SubscriptionService::new(stripe.clone(), pool.clone());
        let dedup = DedupGuard::new(pool.clone());

        Self {
            checkout: CheckoutService::new(
                stripe.clone(),
                customer.clone(),
                catalog.clone(),
                orders.clone(),
            ),
            invariants: InvariantChecker::new(pool.clone()),
            refund: RefundService::new(stripe.clone(), pool),
            webhooks: WebhookHandler::new(
                stripe,
                dedup,
                subscriptions.clone(),
                catalog.clone(),
                customer.clone(),
                orders.clone(),
            ),
            catalog,
            customer,
            orders,
            subscriptions,
        }
    }
}
