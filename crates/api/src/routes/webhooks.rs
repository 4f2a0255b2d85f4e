//! Stripe webhook ingress
//!
//! Takes the raw body (signature verification needs the exact bytes) and
//! answers with the status the provider's retry machinery keys on: 200 when
//! the delivery landed (including duplicates and unhandled types), 400 when
//! the delivery itself is bad and retrying cannot help, 500 when handling
//! failed and a redelivery should be attempted.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::state::AppState;

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let signature = match headers.get("stripe-signature").and_then(|v| v.to_str().ok()) {
        Some(sig) => sig,
        None => {
            tracing::warn!("Webhook delivery without Stripe-Signature header");
            return StatusCode::BAD_REQUEST;
        }
    };

    let event = match state.billing.webhooks.verify_event(&body, signature) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Webhook delivery rejected");
            return StatusCode::BAD_REQUEST;
        }
    };

    match state.billing.webhooks.handle_event(event).await {
        Ok(()) => StatusCode::OK,
        Err(e) if e.is_rejection() => {
            tracing::warn!(error = %e, "Webhook payload rejected during handling");
            StatusCode::BAD_REQUEST
        }
        Err(e) => {
            tracing::error!(error = %e, "Webhook handling failed, provider will redeliver");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
