//! HTTP error mapping
//!
//! The webhook contract drives the status split: rejections (bad signature,
//! malformed payload) are 400 so the provider stops retrying that delivery;
//! reconciliation failures are 500 so it redelivers after we fix the cause.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use nestling_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, message = %self.message, "Request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        let status = match &err {
            e if e.is_rejection() => StatusCode::BAD_REQUEST,
            BillingError::Validation(_) | BillingError::InvalidOrderState(_, _, _) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            BillingError::OrderNotFound(_)
            | BillingError::PlanNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::CustomerNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self::internal(format!("database error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn rejections_map_to_400() {
        let err: ApiError = BillingError::SignatureInvalid.into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err: ApiError = BillingError::MalformedPayload("bad".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_rows_map_to_404() {
        let err: ApiError = BillingError::OrderNotFound("ck".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn state_conflicts_map_to_422() {
        let err: ApiError =
            BillingError::InvalidOrderState(Uuid::new_v4(), "pending".into(), "paid".into())
                .into();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn reconciliation_failures_map_to_500() {
        let err: ApiError = BillingError::Internal("boom".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
