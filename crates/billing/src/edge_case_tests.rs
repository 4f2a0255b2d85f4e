// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Reconciliation Engine
//!
//! Tests critical boundary conditions in:
//! - Webhook signature verification (header shapes, tolerance window)
//! - Event envelope parsing (aliases, unknown types, partial payloads)
//! - Session metadata (versioning, foreign writers)
//! - Server-side order pricing (rejection rules, arithmetic bounds)

#[cfg(test)]
mod signature_tests {
    use crate::error::BillingError;
    use crate::webhooks::verify_signature;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use time::OffsetDateTime;

    const SECRET: &str = "whsec_edge_case_secret";

    fn hex_sig(payload: &str, timestamp: i64) -> String {
        let key = SECRET.strip_prefix("whsec_").unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    // =========================================================================
    // Header keys may arrive in any order and with extra schemes (v0)
    // =========================================================================
    #[test]
    fn header_key_order_does_not_matter() {
        let payload = r#"{"id":"evt_a"}"#;
        let now = 1_700_000_000;
        let sig = hex_sig(payload, now);

        let reversed = format!("v1={sig},t={now}");
        assert!(verify_signature(payload, &reversed, SECRET, at(now)).is_ok());

        let with_v0 = format!("t={now},v0=deadbeef,v1={sig}");
        assert!(verify_signature(payload, &with_v0, SECRET, at(now)).is_ok());
    }

    // =========================================================================
    // Whitespace around header parts is tolerated
    // =========================================================================
    #[test]
    fn header_with_spaces_between_parts_verifies() {
        let payload = r#"{"id":"evt_a"}"#;
        let now = 1_700_000_000;
        let sig = hex_sig(payload, now);
        let header = format!("t={now}, v1={sig}");
        assert!(verify_signature(payload, &header, SECRET, at(now)).is_ok());
    }

    // =========================================================================
    // Exactly at the tolerance boundary: 300s passes, 301s fails
    // =========================================================================
    #[test]
    fn tolerance_boundary_is_inclusive() {
        let payload = r#"{"id":"evt_a"}"#;
        let signed_at = 1_700_000_000;
        let header = format!("t={signed_at},v1={}", hex_sig(payload, signed_at));

        assert!(verify_signature(payload, &header, SECRET, at(signed_at + 300)).is_ok());
        assert!(matches!(
            verify_signature(payload, &header, SECRET, at(signed_at + 301)),
            Err(BillingError::SignatureInvalid)
        ));
    }

    // =========================================================================
    // A future-dated timestamp outside tolerance is as bad as a stale one
    // =========================================================================
    #[test]
    fn future_timestamp_outside_tolerance_rejected() {
        let payload = r#"{"id":"evt_a"}"#;
        let signed_at = 1_700_000_000;
        let header = format!("t={signed_at},v1={}", hex_sig(payload, signed_at));
        assert!(matches!(
            verify_signature(payload, &header, SECRET, at(signed_at - 301)),
            Err(BillingError::SignatureInvalid)
        ));
    }

    // =========================================================================
    // Signature computed with a tampered timestamp never matches
    // =========================================================================
    #[test]
    fn replayed_signature_with_fresh_timestamp_rejected() {
        let payload = r#"{"id":"evt_a"}"#;
        let old = 1_600_000_000;
        let fresh = 1_700_000_000;
        // Old signature, fresh timestamp claim in the header.
        let header = format!("t={fresh},v1={}", hex_sig(payload, old));
        assert!(matches!(
            verify_signature(payload, &header, SECRET, at(fresh)),
            Err(BillingError::SignatureInvalid)
        ));
    }
}

#[cfg(test)]
mod envelope_tests {
    use crate::error::BillingError;
    use crate::events::{EventType, SubscriptionObject, WebhookEvent};

    // =========================================================================
    // Unknown event types parse fine and dispatch as Unknown
    // =========================================================================
    #[test]
    fn unknown_event_type_is_acknowledged_not_rejected() {
        let payload = r#"{
            "id": "evt_x",
            "type": "customer.tax_id.created",
            "created": 1700000000,
            "data": {"object": {"id": "txi_1"}}
        }"#;
        let event = WebhookEvent::parse(payload).unwrap();
        assert_eq!(event.kind(), EventType::Unknown);
    }

    // =========================================================================
    // Extra provider fields in the payload object are ignored
    // =========================================================================
    #[test]
    fn payload_with_unmodeled_fields_still_decodes() {
        let payload = r#"{
            "id": "evt_x",
            "type": "subscription.updated",
            "created": 1700000000,
            "data": {"object": {
                "id": "sub_9",
                "status": "past_due",
                "application_fee_percent": null,
                "pause_collection": {"behavior": "void"},
                "items": {"data": [], "has_more": false, "url": "/v1/..."}
            }}
        }"#;
        let event = WebhookEvent::parse(payload).unwrap();
        let sub: SubscriptionObject = event.object().unwrap();
        assert_eq!(sub.status, "past_due");
        assert!(sub.price_id().is_none());
    }

    // =========================================================================
    // Decoding the wrong object shape is a malformed-payload failure
    // =========================================================================
    #[test]
    fn wrong_object_shape_is_malformed() {
        let payload = r#"{
            "id": "evt_x",
            "type": "subscription.updated",
            "created": 1700000000,
            "data": {"object": {"not_a_subscription": true}}
        }"#;
        let event = WebhookEvent::parse(payload).unwrap();
        let result: Result<SubscriptionObject, _> = event.object();
        assert!(matches!(result, Err(BillingError::MalformedPayload(_))));
    }

    // =========================================================================
    // livemode defaults to false when absent
    // =========================================================================
    #[test]
    fn missing_livemode_defaults_false() {
        let payload = r#"{
            "id": "evt_x",
            "type": "invoice.paid",
            "created": 1700000000,
            "data": {"object": {"id": "in_1"}}
        }"#;
        let event = WebhookEvent::parse(payload).unwrap();
        assert!(!event.livemode);
        assert_eq!(event.kind(), EventType::InvoicePaymentSucceeded);
    }
}

#[cfg(test)]
mod metadata_tests {
    use crate::events::{CheckoutKind, SessionMetadata};
    use std::collections::HashMap;
    use uuid::Uuid;

    // =========================================================================
    // Extra unknown keys within the same version are tolerated
    // =========================================================================
    #[test]
    fn extra_keys_in_same_version_are_ignored() {
        let mut map = SessionMetadata::for_plan(Uuid::new_v4(), Uuid::new_v4()).to_map();
        map.insert("some_future_hint".to_string(), "yes".to_string());
        let decoded = SessionMetadata::from_map(&map).unwrap();
        assert_eq!(decoded.kind, CheckoutKind::Plan);
    }

    // =========================================================================
    // A session created by another system carries no version key
    // =========================================================================
    #[test]
    fn foreign_session_is_detected_before_parsing() {
        let mut foreign = HashMap::new();
        foreign.insert("campaign".to_string(), "spring_sale".to_string());
        assert!(!SessionMetadata::is_ours(&foreign));

        let ours = SessionMetadata::for_order(Uuid::new_v4(), "ord_1".to_string()).to_map();
        assert!(SessionMetadata::is_ours(&ours));
    }

    // =========================================================================
    // Corrupted user id fails closed
    // =========================================================================
    #[test]
    fn corrupted_user_id_is_rejected() {
        let mut map = SessionMetadata::for_plan(Uuid::new_v4(), Uuid::new_v4()).to_map();
        map.insert("user_id".to_string(), "not-a-uuid".to_string());
        assert!(SessionMetadata::from_map(&map).is_err());
    }

    // =========================================================================
    // Unrecognized checkout kind fails closed
    // =========================================================================
    #[test]
    fn unknown_checkout_kind_is_rejected() {
        let mut map = SessionMetadata::for_plan(Uuid::new_v4(), Uuid::new_v4()).to_map();
        map.insert("checkout_kind".to_string(), "gift_card".to_string());
        assert!(SessionMetadata::from_map(&map).is_err());
    }
}

#[cfg(test)]
mod pricing_tests {
    use crate::catalog::{order_total_cents, price_items, Product, RequestedItem};
    use crate::error::BillingError;
    use uuid::Uuid;

    fn product(name: &str, cents: i32, active: bool) -> Product {
        Product {
            id: Uuid::new_v4(),
            name: name.to_string(),
            unit_price_cents: cents,
            active,
        }
    }

    // =========================================================================
    // The same product twice in one order is priced per line
    // =========================================================================
    #[test]
    fn duplicate_product_lines_are_each_priced() {
        let swaddle = product("Swaddle Set", 3400, true);
        let items = vec![
            RequestedItem {
                product_id: swaddle.id,
                quantity: 1,
            },
            RequestedItem {
                product_id: swaddle.id,
                quantity: 2,
            },
        ];
        let priced = price_items(std::slice::from_ref(&swaddle), &items).unwrap();
        assert_eq!(priced.len(), 2);
        assert_eq!(order_total_cents(&priced), 3 * 3400);
    }

    // =========================================================================
    // Quantities are bounded by what the order columns can store
    // =========================================================================
    #[test]
    fn quantity_past_storage_bound_is_rejected() {
        let poster = product("Growth Chart Poster", 1999, true);
        let items = vec![RequestedItem {
            product_id: poster.id,
            quantity: u32::MAX,
        }];
        let result = price_items(std::slice::from_ref(&poster), &items);
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }

    #[test]
    fn largest_storable_order_is_accepted() {
        let poster = product("Growth Chart Poster", 1, true);
        let items = vec![RequestedItem {
            product_id: poster.id,
            quantity: i32::MAX as u32,
        }];
        let priced = price_items(std::slice::from_ref(&poster), &items).unwrap();
        assert_eq!(order_total_cents(&priced), i64::from(i32::MAX));
    }

    // =========================================================================
    // One bad line poisons the whole order
    // =========================================================================
    #[test]
    fn one_inactive_product_rejects_entire_order() {
        let cards = product("Milestone Cards", 2500, true);
        let retired = product("Retired Mobile", 5100, false);
        let items = vec![
            RequestedItem {
                product_id: cards.id,
                quantity: 1,
            },
            RequestedItem {
                product_id: retired.id,
                quantity: 1,
            },
        ];
        let result = price_items(&[cards, retired], &items);
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }
}
