//! Checkout session creation for plans and orders
//!
//! The bridge between local intent and the provider's hosted checkout.
//! Sessions are created with versioned correlation metadata; the webhook
//! path later uses that metadata to find the local rows. All money amounts
//! come from the local catalog — client-supplied prices are never trusted.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    Currency,
};

use crate::catalog::{order_total_cents, price_items, CatalogService, RequestedItem};
use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::events::SessionMetadata;
use crate::orders::{CustomerInfo, OrderService};

/// What the caller gets back: the hosted checkout URL to redirect to.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutSessionInfo {
    pub session_id: String,
    pub url: String,
    /// Local order backing this session, for order-mode checkouts.
    pub order_id: Option<Uuid>,
}

/// Where the hosted checkout returns the user afterwards. Supplied per
/// call so each surface (web, mobile webview) routes to its own pages.
/// The success URL may carry the provider's `{CHECKOUT_SESSION_ID}`
/// placeholder, which is expanded on redirect.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReturnUrls {
    pub success_url: String,
    pub cancel_url: String,
}

impl ReturnUrls {
    fn validate(&self) -> BillingResult<()> {
        for (label, url) in [
            ("success_url", &self.success_url),
            ("cancel_url", &self.cancel_url),
        ] {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                return Err(BillingError::Validation(format!(
                    "{label} must be an absolute http(s) URL"
                )));
            }
        }
        Ok(())
    }
}

/// One-off order checkout request. Items carry product ids and quantities
/// only; pricing happens against the catalog.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OrderCheckoutRequest {
    pub items: Vec<RequestedItem>,
    pub customer_name: String,
    pub customer_email: String,
    pub shipping_address: Value,
    #[serde(flatten)]
    pub return_urls: ReturnUrls,
    /// Retry an abandoned checkout for an existing pending order instead
    /// of creating a new one.
    pub existing_order_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    customers: CustomerService,
    catalog: CatalogService,
    orders: OrderService,
}

impl CheckoutService {
    pub fn new(
        stripe: StripeClient,
        customers: CustomerService,
        catalog: CatalogService,
        orders: OrderService,
    ) -> Self {
        Self {
            stripe,
            customers,
            catalog,
            orders,
        }
    }

    /// Start a subscription checkout for a plan.
    pub async fn create_plan_checkout(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        return_urls: &ReturnUrls,
    ) -> BillingResult<CheckoutSessionInfo> {
        let plan = self.catalog.plan_by_id(plan_id).await?;
        if !plan.active {
            return Err(BillingError::Validation(format!(
                "plan {} is no longer offered",
                plan.name
            )));
        }

        let customer_id = self.customers.get_or_create_customer(user_id).await?;
        let metadata = SessionMetadata::for_plan(user_id, plan_id).to_map();

        let line_items = vec![CreateCheckoutSessionLineItems {
            price: Some(plan.stripe_price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }];

        let session = self
            .create_session(
                user_id,
                &customer_id,
                CheckoutSessionMode::Subscription,
                line_items,
                metadata,
                return_urls,
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            session_id = %session.session_id,
            "Created plan checkout session"
        );

        Ok(session)
    }

    /// Start a payment checkout for a one-off order.
    ///
    /// Creates the pending order first (or reuses an existing pending one,
    /// keeping its original correlation key) so the completion event always
    /// has a local row to land on.
    pub async fn create_order_checkout(
        &self,
        user_id: Uuid,
        request: OrderCheckoutRequest,
    ) -> BillingResult<CheckoutSessionInfo> {
        let order = match request.existing_order_id {
            Some(order_id) => self.orders.find_pending(order_id, user_id).await?,
            None => {
                let catalog = self.catalog.products_for_items(&request.items).await?;
                let priced = price_items(&catalog, &request.items)?;
                let total = order_total_cents(&priced);
                let customer = CustomerInfo {
                    name: request.customer_name.clone(),
                    email: request.customer_email.clone(),
                };
                self.orders
                    .create_pending(user_id, &priced, &customer, request.shipping_address, total)
                    .await?
            }
        };

        let customer_id = self.customers.get_or_create_customer(user_id).await?;
        let metadata =
            SessionMetadata::for_order(user_id, order.correlation_key.clone()).to_map();

        // Rebuild line items from the persisted order so a reused order is
        // charged exactly what was priced at creation time.
        let items = self.orders.items_for_order(order.id).await?;
        let line_items: Vec<CreateCheckoutSessionLineItems> = items
            .iter()
            .map(|item| CreateCheckoutSessionLineItems {
                price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                    currency: Currency::USD,
                    unit_amount: Some(i64::from(item.unit_price_cents)),
                    product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                        name: item.product_name.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                quantity: Some(u64::from(item.quantity.unsigned_abs())),
                ..Default::default()
            })
            .collect();

        let session = self
            .create_session(
                user_id,
                &customer_id,
                CheckoutSessionMode::Payment,
                line_items,
                metadata,
                &request.return_urls,
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            order_id = %order.id,
            correlation_key = %order.correlation_key,
            session_id = %session.session_id,
            "Created order checkout session"
        );

        Ok(CheckoutSessionInfo {
            order_id: Some(order.id),
            ..session
        })
    }

    async fn create_session(
        &self,
        user_id: Uuid,
        customer_id: &str,
        mode: CheckoutSessionMode,
        line_items: Vec<CreateCheckoutSessionLineItems>,
        metadata: HashMap<String, String>,
        return_urls: &ReturnUrls,
    ) -> BillingResult<CheckoutSessionInfo> {
        return_urls.validate()?;

        let customer: stripe::CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::Internal(format!("invalid customer id {customer_id}")))?;

        let client_reference_id = user_id.to_string();

        let params = CreateCheckoutSession {
            customer: Some(customer),
            mode: Some(mode),
            line_items: Some(line_items),
            success_url: Some(&return_urls.success_url),
            cancel_url: Some(&return_urls.cancel_url),
            client_reference_id: Some(&client_reference_id),
            metadata: Some(metadata),
            ..Default::default()
        };

        let session = self
            .stripe
            .retry("checkout_session.create", || {
                CheckoutSession::create(self.stripe.inner(), params.clone())
            })
            .await?;

        let url = session.url.ok_or_else(|| {
            BillingError::Internal("provider returned a session without a URL".to_string())
        })?;

        Ok(CheckoutSessionInfo {
            session_id: session.id.to_string(),
            url,
            order_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(success: &str, cancel: &str) -> ReturnUrls {
        ReturnUrls {
            success_url: success.to_string(),
            cancel_url: cancel.to_string(),
        }
    }

    #[test]
    fn absolute_return_urls_are_accepted() {
        let urls = urls(
            "https://nestlingapp.com/billing?session_id={CHECKOUT_SESSION_ID}",
            "https://nestlingapp.com/billing/cancelled",
        );
        assert!(urls.validate().is_ok());
    }

    #[test]
    fn relative_return_url_is_rejected() {
        let urls = urls("/billing/success", "https://nestlingapp.com/billing");
        assert!(matches!(
            urls.validate(),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn order_request_carries_flattened_return_urls() {
        let body = serde_json::json!({
            "items": [{"product_id": Uuid::new_v4(), "quantity": 1}],
            "customer_name": "Jess Harper",
            "customer_email": "jess@example.com",
            "shipping_address": {"city": "Portland"},
            "success_url": "https://nestlingapp.com/shop/thanks",
            "cancel_url": "https://nestlingapp.com/shop/cart",
        });
        let request: OrderCheckoutRequest = serde_json::from_value(body).unwrap();
        assert_eq!(
            request.return_urls.success_url,
            "https://nestlingapp.com/shop/thanks"
        );
        assert!(request.existing_order_id.is_none());
    }
}
