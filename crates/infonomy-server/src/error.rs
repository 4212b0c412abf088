//! Maps `MarketError` onto HTTP status codes per §7.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use infonomy_core::error::{MarketError, StoreError};
use serde::Serialize;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Newtype so `infonomy-server` handlers can return `Result<T, ApiError>`
/// directly from axum without an orphan-rule conflict on `MarketError`.
pub struct ApiError(pub MarketError);

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        ApiError(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(MarketError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            MarketError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            MarketError::Authorization => (StatusCode::FORBIDDEN, self.0.to_string()),
            MarketError::NotFound => (StatusCode::NOT_FOUND, self.0.to_string()),
            MarketError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            MarketError::InsufficientFunds => (StatusCode::BAD_REQUEST, self.0.to_string()),
            MarketError::Transient(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            MarketError::Agent(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}
