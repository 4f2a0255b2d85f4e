//! Stripe webhook verification and event dispatch
//!
//! Events arrive at least once and in no guaranteed order. The pipeline is
//! verify, claim, dispatch, settle: the signature gate rejects anything not
//! signed with our endpoint secret, the dedup guard ensures exactly one
//! execution per event id, and every handler applies absolute state so
//! redelivery and reordering converge. A handler failure releases the
//! claim, so the provider's retry gets a clean attempt.

use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::catalog::CatalogService;
use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::dedup::{ClaimOutcome, DedupGuard};
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutKind, CheckoutSessionObject, EventType, InvoiceObject, SessionMetadata,
    SubscriptionObject, WebhookEvent,
};
use crate::orders::OrderService;
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted skew between the signature timestamp and our clock.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a `Stripe-Signature` header against the raw request body.
///
/// The header carries `t=<unix>,v1=<hex hmac>`; the signed payload is
/// `"{t}.{body}"` keyed with the endpoint secret. `now` is passed in so
/// the tolerance window is testable.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => v1_signature = Some(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::SignatureInvalid)?;

    let skew = (now.unix_timestamp() - timestamp).abs();
    if skew > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            skew_secs = skew,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(BillingError::SignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(signed_payload.as_bytes());

    mac.verify_slice(&hex::decode(v1_signature).map_err(|_| BillingError::SignatureInvalid)?)
        .map_err(|_| BillingError::SignatureInvalid)
}

/// Webhook handler: one instance per process, shared across requests.
#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    dedup: DedupGuard,
    subscriptions: SubscriptionService,
    catalog: CatalogService,
    customers: CustomerService,
    orders: OrderService,
}

impl WebhookHandler {
    pub fn new(
        stripe: StripeClient,
        dedup: DedupGuard,
        subscriptions: SubscriptionService,
        catalog: CatalogService,
        customers: CustomerService,
        orders: OrderService,
    ) -> Self {
        Self {
            stripe,
            dedup,
            subscriptions,
            catalog,
            customers,
            orders,
        }
    }

    /// The dedup guard, exposed for the admin event-history view.
    pub fn dedup(&self) -> &DedupGuard {
        &self.dedup
    }

    /// Verify the signature and parse the envelope.
    ///
    /// Fails with `SignatureInvalid` or `MalformedPayload`, both of which
    /// the HTTP layer turns into a 400 so the provider stops retrying.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        verify_signature(
            payload,
            signature,
            &self.stripe.config().webhook_secret,
            OffsetDateTime::now_utc(),
        )?;
        WebhookEvent::parse(payload)
    }

    /// Process a verified event end to end.
    ///
    /// Returns `Ok` for duplicates and for event types we do not handle;
    /// the provider only needs to know the delivery landed. Handler errors
    /// release the dedup claim before propagating, so the redelivery is
    /// not shadowed by a stale claim.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<()> {
        match self.dedup.try_claim(&event.id, &event.event_type).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyProcessed => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate delivery, already claimed or processed"
                );
                return Ok(());
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            livemode = event.livemode,
            "Processing webhook event"
        );

        match self.dispatch(&event).await {
            Ok(()) => {
                self.dedup.mark_done(&event.id).await?;
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Event handler failed; releasing claim for redelivery"
                );
                self.dedup.release(&event.id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<()> {
        match event.kind() {
            EventType::SubscriptionCreated | EventType::SubscriptionUpdated => {
                let payload: SubscriptionObject = event.object()?;
                self.subscriptions
                    .apply_provider_state(&self.catalog, &payload)
                    .await
            }
            EventType::SubscriptionDeleted => {
                let payload: SubscriptionObject = event.object()?;
                self.subscriptions.apply_deleted(&payload).await
            }
            EventType::InvoicePaymentSucceeded => {
                let invoice: InvoiceObject = event.object()?;
                match invoice.subscription.as_deref() {
                    Some(subscription_id) => {
                        self.subscriptions
                            .apply_payment_succeeded(subscription_id)
                            .await
                    }
                    None => {
                        // One-off invoices are settled through checkout
                        // completion, not here.
                        tracing::debug!(
                            invoice_id = %invoice.id,
                            "Invoice without subscription; nothing to reconcile"
                        );
                        Ok(())
                    }
                }
            }
            EventType::InvoicePaymentFailed => {
                let invoice: InvoiceObject = event.object()?;
                match invoice.subscription.as_deref() {
                    Some(subscription_id) => {
                        self.subscriptions.apply_payment_failed(subscription_id).await
                    }
                    None => {
                        tracing::debug!(
                            invoice_id = %invoice.id,
                            "Invoice without subscription; nothing to reconcile"
                        );
                        Ok(())
                    }
                }
            }
            EventType::CheckoutSessionCompleted => {
                let session: CheckoutSessionObject = event.object()?;
                self.handle_checkout_completed(&session).await
            }
            EventType::Unknown => {
                tracing::debug!(
                    event_type = %event.event_type,
                    "Unhandled event type, acknowledged"
                );
                Ok(())
            }
        }
    }

    /// Completion of a hosted checkout session.
    ///
    /// Only sessions carrying our versioned metadata are ours to settle;
    /// anything else (dashboard-created, other services) is acknowledged
    /// and skipped. Ours split on the embedded checkout kind.
    async fn handle_checkout_completed(
        &self,
        session: &CheckoutSessionObject,
    ) -> BillingResult<()> {
        if !SessionMetadata::is_ours(&session.metadata) {
            tracing::info!(
                session_id = %session.id,
                "Checkout session without our metadata; skipping"
            );
            return Ok(());
        }

        let metadata = SessionMetadata::from_map(&session.metadata)?;

        if let Some(customer_id) = session.customer.as_deref() {
            // Sanity check: the session's customer must map back to the
            // user the metadata names.
            match self.customers.user_for_customer(customer_id).await {
                Ok(owner) if owner != metadata.user_id => {
                    return Err(BillingError::Validation(format!(
                        "session {} customer belongs to user {owner}, metadata names {}",
                        session.id, metadata.user_id
                    )));
                }
                Ok(_) => {}
                Err(BillingError::CustomerNotFound(_)) => {
                    tracing::warn!(
                        session_id = %session.id,
                        customer_id = %customer_id,
                        "Session customer unknown locally; continuing on metadata"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        match metadata.kind {
            CheckoutKind::Order => self.settle_order_session(session, &metadata).await,
            CheckoutKind::Plan => self.settle_plan_session(session, &metadata).await,
        }
    }

    async fn settle_order_session(
        &self,
        session: &CheckoutSessionObject,
        metadata: &SessionMetadata,
    ) -> BillingResult<()> {
        let correlation_key = metadata.correlation_key.as_deref().ok_or_else(|| {
            BillingError::MalformedPayload(format!(
                "order session {} has no correlation key",
                session.id
            ))
        })?;
        let payment_reference = session.payment_intent.as_deref().ok_or_else(|| {
            BillingError::MalformedPayload(format!(
                "completed payment session {} has no payment intent",
                session.id
            ))
        })?;

        let order = self
            .orders
            .mark_paid(
                correlation_key,
                payment_reference,
                json!({
                    "session_id": session.id,
                    "amount_total": session.amount_total,
                }),
            )
            .await?;

        if let Some(amount_total) = session.amount_total {
            if amount_total != i64::from(order.total_cents) {
                // Paid state stands (the provider charged what it charged);
                // the mismatch is surfaced for investigation.
                tracing::error!(
                    order_id = %order.id,
                    session_id = %session.id,
                    charged_cents = amount_total,
                    order_cents = order.total_cents,
                    "Charged amount differs from local order total"
                );
            }
        }

        Ok(())
    }

    async fn settle_plan_session(
        &self,
        session: &CheckoutSessionObject,
        metadata: &SessionMetadata,
    ) -> BillingResult<()> {
        let plan_id = metadata.plan_id.ok_or_else(|| {
            BillingError::MalformedPayload(format!("plan session {} has no plan id", session.id))
        })?;
        let subscription_id = session.subscription.as_deref().ok_or_else(|| {
            BillingError::MalformedPayload(format!(
                "completed subscription session {} has no subscription",
                session.id
            ))
        })?;

        self.subscriptions
            .record_from_checkout(metadata.user_id, plan_id, subscription_id)
            .await
    }
}
