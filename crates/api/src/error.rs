//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use meterline_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Retryable: the caller should try again shortly
    #[error("{0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        if err.is_validation() {
            return ApiError::Validation(err.to_string());
        }
        match err {
            BillingError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            BillingError::MetricRetired(_) | BillingError::LineageAmbiguity { .. } => {
                ApiError::Conflict(err.to_string())
            }
            BillingError::CacheConflict(_)
            | BillingError::TransientStorage(_)
            | BillingError::InvalidationIncomplete { .. } => ApiError::Unavailable(err.to_string()),
            BillingError::Database(msg) => ApiError::Database(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Storage details stay in the logs
        let message = match &self {
            ApiError::Database(detail) | ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
