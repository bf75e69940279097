//! Request-level error taxonomy.
//!
//! Handlers and middleware surface [`ApiError`]; its `IntoResponse` impl is
//! the single place errors become structured JSON responses. Clients always
//! get an `error` field; internal diagnostic detail travels in a response
//! extension and is attached by the error boundary only outside production.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Internal diagnostic detail for a 500, carried as a response extension so
/// the error boundary can decide whether to expose it.
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input: wrong content type, bad fields. 400.
    #[error("{0}")]
    Validation(String),

    /// Request body over the configured maximum. 413.
    #[error("request body exceeds {limit_bytes} bytes")]
    PayloadTooLarge { limit_bytes: usize },

    /// Missing or invalid credentials. 401.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not permitted. 403.
    #[error("{0}")]
    Forbidden(String),

    /// Target entity does not exist. 404.
    #[error("{0}")]
    NotFound(String),

    /// Anything unclassified. 500, with detail withheld from clients.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "Bad Request",
            ApiError::PayloadTooLarge { .. } => "Payload Too Large",
            ApiError::Unauthorized(_) => "Unauthorized",
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::NotFound(_) => "Not Found",
            ApiError::Internal(_) => "Internal Server Error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let label = self.label();
        // Unclassified errors never leak their cause in the body.
        let message = match &self {
            ApiError::Internal(_) => "An unexpected error occurred".to_string(),
            other => other.to_string(),
        };

        let mut response =
            (status, Json(json!({ "error": label, "message": message }))).into_response();

        if let ApiError::Internal(source) = &self {
            tracing::error!(error = %source, "unhandled internal error");
            response
                .extensions_mut()
                .insert(ErrorDetail(format!("{source:#}")));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::PayloadTooLarge { limit_bytes: 1 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::Unauthorized("no".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Forbidden("no".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::NotFound("task".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_detail_kept_out_of_body() {
        let response = ApiError::Internal(anyhow::anyhow!("secret cause")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let detail = response.extensions().get::<ErrorDetail>().unwrap();
        assert!(detail.0.contains("secret cause"));
    }
}
