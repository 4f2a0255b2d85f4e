//! Webhook event envelope and payload types
//!
//! Inbound events are modeled as a typed envelope with a tagged event type,
//! matched exhaustively by the dispatcher. Only the fields the reconciler
//! consumes are captured; unknown fields in the provider payload are
//! ignored so new provider API versions never break parsing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A verified webhook event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    /// Provider event id (`evt_…`), the idempotency key.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix timestamp at which the provider created the event.
    pub created: i64,
    #[serde(default)]
    pub livemode: bool,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    /// Polymorphic payload; decoded per event type.
    pub object: serde_json::Value,
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload).map_err(|e| BillingError::MalformedPayload(e.to_string()))
    }

    pub fn kind(&self) -> EventType {
        EventType::from_wire(&self.event_type)
    }

    /// Decode the event payload object as a concrete type.
    pub fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))
    }
}

/// Event types the reconciler reacts to.
///
/// Canonical names are provider-neutral; the Stripe wire names are accepted
/// as aliases so the same engine handles both historical and current
/// provider API versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    CheckoutSessionCompleted,
    /// Anything else: acknowledged and logged, never an error.
    Unknown,
}

impl EventType {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "subscription.created" | "customer.subscription.created" => Self::SubscriptionCreated,
            "subscription.updated" | "customer.subscription.updated" => Self::SubscriptionUpdated,
            "subscription.deleted" | "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_succeeded" | "invoice.paid" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "checkout_session.completed" | "checkout.session.completed" => {
                Self::CheckoutSessionCompleted
            }
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated => "subscription.created",
            Self::SubscriptionUpdated => "subscription.updated",
            Self::SubscriptionDeleted => "subscription.deleted",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::CheckoutSessionCompleted => "checkout_session.completed",
            Self::Unknown => "unknown",
        }
    }
}

/// Subscription object as delivered on `subscription.*` events.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub status: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub customer: Option<String>,
    #[serde(default)]
    pub items: SubscriptionItems,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    pub price: Option<PriceRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceRef {
    pub id: String,
}

impl SubscriptionObject {
    /// Provider price id of the first subscription item, if any.
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.as_str())
    }
}

/// Invoice object as delivered on `invoice.payment_*` events.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    /// Provider subscription id this invoice bills, if subscription-backed.
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
}

/// Checkout session object as delivered on `checkout_session.completed`.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    /// "payment" for one-off orders, "subscription" for plans.
    pub mode: String,
    pub payment_intent: Option<String>,
    pub subscription: Option<String>,
    pub amount_total: Option<i64>,
    pub customer: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Which checkout flow a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutKind {
    Plan,
    Order,
}

impl CheckoutKind {
    fn as_str(&self) -> &'static str {
        match self {
            CheckoutKind::Plan => "plan",
            CheckoutKind::Order => "order",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(CheckoutKind::Plan),
            "order" => Some(CheckoutKind::Order),
            _ => None,
        }
    }
}

/// Correlation context embedded in outbound checkout sessions.
///
/// Session metadata is the only channel carrying context from
/// session-creation time to the later, context-free webhook call, so the
/// structure is explicit and versioned: a reader that sees keys from a
/// future writer fails loudly instead of silently dropping fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub kind: CheckoutKind,
    pub user_id: Uuid,
    /// Present for order sessions only; the join key for the local order.
    pub correlation_key: Option<String>,
    /// Present for plan sessions only.
    pub plan_id: Option<Uuid>,
}

/// Bump when the metadata layout changes shape.
const METADATA_VERSION: &str = "1";

const KEY_VERSION: &str = "nestling_meta_version";
const KEY_KIND: &str = "checkout_kind";
const KEY_USER_ID: &str = "user_id";
const KEY_CORRELATION: &str = "correlation_key";
const KEY_PLAN_ID: &str = "plan_id";

impl SessionMetadata {
    /// Whether a metadata map was written by this engine at all.
    ///
    /// Sessions created elsewhere (dashboard, other services) carry no
    /// version key; those are skipped rather than rejected.
    pub fn is_ours(map: &HashMap<String, String>) -> bool {
        map.contains_key(KEY_VERSION)
    }

    pub fn for_plan(user_id: Uuid, plan_id: Uuid) -> Self {
        Self {
            kind: CheckoutKind::Plan,
            user_id,
            correlation_key: None,
            plan_id: Some(plan_id),
        }
    }

    pub fn for_order(user_id: Uuid, correlation_key: String) -> Self {
        Self {
            kind: CheckoutKind::Order,
            user_id,
            correlation_key: Some(correlation_key),
            plan_id: None,
        }
    }

    /// Serialize into the provider's string-to-string metadata channel.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(KEY_VERSION.to_string(), METADATA_VERSION.to_string());
        map.insert(KEY_KIND.to_string(), self.kind.as_str().to_string());
        map.insert(KEY_USER_ID.to_string(), self.user_id.to_string());
        if let Some(key) = &self.correlation_key {
            map.insert(KEY_CORRELATION.to_string(), key.clone());
        }
        if let Some(plan_id) = &self.plan_id {
            map.insert(KEY_PLAN_ID.to_string(), plan_id.to_string());
        }
        map
    }

    pub fn from_map(map: &HashMap<String, String>) -> BillingResult<Self> {
        let version = map
            .get(KEY_VERSION)
            .ok_or_else(|| missing_key(KEY_VERSION))?;
        if version != METADATA_VERSION {
            return Err(BillingError::MalformedPayload(format!(
                "unsupported session metadata version {version}"
            )));
        }

        let kind = map
            .get(KEY_KIND)
            .and_then(|s| CheckoutKind::parse(s))
            .ok_or_else(|| missing_key(KEY_KIND))?;

        let user_id = map
            .get(KEY_USER_ID)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| missing_key(KEY_USER_ID))?;

        let correlation_key = map.get(KEY_CORRELATION).cloned();
        let plan_id = map.get(KEY_PLAN_ID).and_then(|s| Uuid::parse_str(s).ok());

        match kind {
            CheckoutKind::Order if correlation_key.is_none() => {
                Err(missing_key(KEY_CORRELATION))
            }
            _ => Ok(Self {
                kind,
                user_id,
                correlation_key,
                plan_id,
            }),
        }
    }
}

fn missing_key(key: &str) -> BillingError {
    BillingError::MalformedPayload(format!("session metadata missing or invalid key {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_parses_canonical_and_stripe_aliases() {
        assert_eq!(
            EventType::from_wire("subscription.created"),
            EventType::SubscriptionCreated
        );
        assert_eq!(
            EventType::from_wire("customer.subscription.deleted"),
            EventType::SubscriptionDeleted
        );
        assert_eq!(
            EventType::from_wire("invoice.paid"),
            EventType::InvoicePaymentSucceeded
        );
        assert_eq!(
            EventType::from_wire("checkout.session.completed"),
            EventType::CheckoutSessionCompleted
        );
        assert_eq!(
            EventType::from_wire("customer.tax_id.created"),
            EventType::Unknown
        );
    }

    #[test]
    fn envelope_parses_and_exposes_object() {
        let payload = r#"{
            "id": "evt_123",
            "type": "invoice.payment_failed",
            "created": 1700000000,
            "livemode": false,
            "data": {
                "object": {
                    "id": "in_42",
                    "subscription": "sub_42",
                    "amount_due": 999
                }
            }
        }"#;

        let event = WebhookEvent::parse(payload).unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(event.kind(), EventType::InvoicePaymentFailed);

        let invoice: InvoiceObject = event.object().unwrap();
        assert_eq!(invoice.subscription.as_deref(), Some("sub_42"));
        assert_eq!(invoice.amount_due, 999);
        assert_eq!(invoice.amount_paid, 0);
    }

    #[test]
    fn envelope_rejects_garbage() {
        assert!(matches!(
            WebhookEvent::parse("not json"),
            Err(BillingError::MalformedPayload(_))
        ));
        assert!(matches!(
            WebhookEvent::parse(r#"{"id": "evt_1"}"#),
            Err(BillingError::MalformedPayload(_))
        ));
    }

    #[test]
    fn subscription_object_exposes_first_price() {
        let json = serde_json::json!({
            "id": "sub_1",
            "status": "active",
            "current_period_start": 1700000000,
            "current_period_end": 1702592000,
            "cancel_at_period_end": false,
            "items": {"data": [{"price": {"id": "price_abc"}}]}
        });
        let sub: SubscriptionObject = serde_json::from_value(json).unwrap();
        assert_eq!(sub.price_id(), Some("price_abc"));
    }

    #[test]
    fn session_metadata_round_trips_for_order() {
        let user_id = Uuid::new_v4();
        let meta = SessionMetadata::for_order(user_id, "ck_test".to_string());
        let decoded = SessionMetadata::from_map(&meta.to_map()).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.kind, CheckoutKind::Order);
        assert_eq!(decoded.correlation_key.as_deref(), Some("ck_test"));
    }

    #[test]
    fn session_metadata_round_trips_for_plan() {
        let user_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();
        let meta = SessionMetadata::for_plan(user_id, plan_id);
        let decoded = SessionMetadata::from_map(&meta.to_map()).unwrap();
        assert_eq!(decoded.plan_id, Some(plan_id));
        assert!(decoded.correlation_key.is_none());
    }

    #[test]
    fn session_metadata_rejects_foreign_version() {
        let mut map = SessionMetadata::for_plan(Uuid::new_v4(), Uuid::new_v4()).to_map();
        map.insert(KEY_VERSION.to_string(), "2".to_string());
        assert!(SessionMetadata::from_map(&map).is_err());
    }

    #[test]
    fn session_metadata_rejects_order_without_correlation_key() {
        let mut map = SessionMetadata::for_order(Uuid::new_v4(), "ck".to_string()).to_map();
        map.remove(KEY_CORRELATION);
        assert!(SessionMetadata::from_map(&map).is_err());
    }

    #[test]
    fn session_metadata_rejects_unversioned_map() {
        // A metadata blob written by something else entirely.
        let mut map = HashMap::new();
        map.insert("user_id".to_string(), Uuid::new_v4().to_string());
        assert!(SessionMetadata::from_map(&map).is_err());
    }
}
