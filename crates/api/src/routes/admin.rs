//! Admin routes: catalog management, financial actions, health sweeps
//!
//! Deployment fronts these with the platform's admin gateway; the handlers
//! themselves carry no session logic.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nestling_billing::{
    InvariantCheckSummary, Plan, ProcessedEventRecord, RefundOutcome,
};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    pub name: String,
    pub amount_cents: i64,
    /// "month" or "year"
    pub interval: String,
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(req): Json<CreatePlanRequest>,
) -> ApiResult<Json<Plan>> {
    let plan = state
        .billing
        .catalog
        .create_plan(&req.name, req.amount_cents, &req.interval)
        .await?;
    Ok(Json(plan))
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    /// Omit for a full refund of the remaining balance.
    pub amount_cents: Option<i64>,
}

pub async fn refund_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<Json<RefundOutcome>> {
    let outcome = state
        .billing
        .refund
        .refund_order(&state.billing.orders, order_id, req.amount_cents)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub at_period_end: bool,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub subscription_id: Uuid,
    pub at_period_end: bool,
    /// Local state updates when the provider's webhook arrives.
    pub message: String,
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Json<CancelResponse>> {
    state
        .billing
        .subscriptions
        .cancel_subscription(subscription_id, req.at_period_end)
        .await?;

    Ok(Json(CancelResponse {
        subscription_id,
        at_period_end: req.at_period_end,
        message: "cancellation requested; state updates on provider confirmation".to_string(),
    }))
}

pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.billing.invariants.run_all_checks().await?;
    if !summary.healthy {
        tracing::warn!(
            violations = summary.violations.len(),
            "Billing invariant sweep found violations"
        );
    }
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

pub async fn recent_webhook_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<ProcessedEventRecord>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let events = state.billing.webhooks.dedup().recent(limit).await?;
    Ok(Json(events))
}
