//! Structured error responses for the control API.

use std::fmt;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fault_relay_core::Error;
use serde::Serialize;

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    /// Error raised by the proxy layer.
    Core(Error),
    /// Malformed request body or query.
    BadRequest(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Core(err) => write!(f, "{}", err),
            ApiError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Core(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Core(err) => match err {
                Error::ProxyNotFound(_) | Error::ToxicNotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found")
                }
                Error::ProxyExists(_) | Error::ToxicExists(_) => {
                    (StatusCode::CONFLICT, "conflict")
                }
                Error::InvalidToxic(_)
                | Error::InvalidProxy(_)
                | Error::AddressResolution(_)
                | Error::Config(_) => (StatusCode::BAD_REQUEST, "bad_request"),
                Error::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status();
        if status.is_server_error() {
            tracing::error!("Control API error: {}", self);
        } else {
            tracing::debug!("Control API rejected request: {}", self);
        }

        let body = ErrorResponse {
            success: false,
            error,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
