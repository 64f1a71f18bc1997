use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use skimmer_core::error::AppError;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status_and_type(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            AppError::ValidationError(_) | AppError::InvalidUrl(_) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            AppError::SerializationError(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::DatabaseError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            AppError::StoreError(_) | AppError::QueueError(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        if status.is_server_error() {
            tracing::error!(error = ?self.0, "Request failed");
        }
        error_response(status, error_type, self.0.to_string())
    }
}

/// JSON error body with the given status.
pub fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message: message.into(),
    };
    (status, axum::Json(body)).into_response()
}
