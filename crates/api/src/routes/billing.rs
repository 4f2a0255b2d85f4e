//! Customer-facing billing routes

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nestling_billing::{CheckoutSessionInfo, Order, OrderCheckoutRequest, OrderItem, ReturnUrls};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PlanCheckoutRequest {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    #[serde(flatten)]
    pub return_urls: ReturnUrls,
}

pub async fn plan_checkout(
    State(state): State<AppState>,
    Json(req): Json<PlanCheckoutRequest>,
) -> ApiResult<Json<CheckoutSessionInfo>> {
    let session = state
        .billing
        .checkout
        .create_plan_checkout(req.user_id, req.plan_id, &req.return_urls)
        .await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct OrderCheckoutBody {
    pub user_id: Uuid,
    #[serde(flatten)]
    pub request: OrderCheckoutRequest,
}

pub async fn order_checkout(
    State(state): State<AppState>,
    Json(body): Json<OrderCheckoutBody>,
) -> ApiResult<Json<CheckoutSessionInfo>> {
    let session = state
        .billing
        .checkout
        .create_order_checkout(body.user_id, body.request)
        .await?;
    Ok(Json(session))
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<OrderResponse>> {
    let order = state
        .billing
        .orders
        .find_by_id(order_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("order {order_id} not found")))?;
    let items = state.billing.orders.items_for_order(order_id).await?;

    Ok(Json(OrderResponse { order, items }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_checkout_body_carries_return_urls() {
        let body = serde_json::json!({
            "user_id": Uuid::new_v4(),
            "plan_id": Uuid::new_v4(),
            "success_url": "https://nestlingapp.com/billing?session_id={CHECKOUT_SESSION_ID}",
            "cancel_url": "https://nestlingapp.com/billing/plans",
        });
        let req: PlanCheckoutRequest = serde_json::from_value(body).unwrap();
        assert_eq!(
            req.return_urls.cancel_url,
            "https://nestlingapp.com/billing/plans"
        );
    }

    #[test]
    fn plan_checkout_body_without_return_urls_is_rejected() {
        let body = serde_json::json!({
            "user_id": Uuid::new_v4(),
            "plan_id": Uuid::new_v4(),
        });
        assert!(serde_json::from_value::<PlanCheckoutRequest>(body).is_err());
    }
}
