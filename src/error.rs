//! Error types for the relay.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Upstream bodies longer than this are cut before they reach the logs.
const MAX_LOGGED_BODY: usize = 512;

/// Result type for a single Vault Transform call.
pub type TransformResult<T> = Result<T, TransformError>;

/// Failure of a single encode/decode call against Vault.
///
/// These never abort a batch: the batch adapter turns each one into a
/// `null` reply at the item's position.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Vault returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error communicating with Vault: {0}")]
    Network(#[source] reqwest::Error),

    #[error("malformed Vault response: {0}")]
    MalformedResponse(String),

    #[error("Vault response is missing `data.{0}`")]
    MissingField(&'static str),
}

impl TransformError {
    /// Builds a `Status` error, truncating the body on a char boundary.
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        let mut body = body.into();
        if body.len() > MAX_LOGGED_BODY {
            let mut cut = MAX_LOGGED_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
            body.push_str("...");
        }
        TransformError::Status { status, body }
    }

    /// HTTP status reported by Vault, if the call got that far.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            TransformError::Status { status, .. } => Some(*status),
            TransformError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Fatal startup errors. The process does not serve any route when one of
/// these is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("VAULT_TOKEN environment variable is required")]
    MissingToken,

    #[error("invalid Vault address {0:?}")]
    InvalidVaultAddr(String),

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("failed to build Vault HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Errors that decide the status code of a whole `/encrypt` or `/decrypt`
/// request. Item-level Vault failures are not represented here.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message sent to the caller. Detail stays in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "Invalid request format",
            ApiError::Internal(_) => "Internal server error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Validation(detail) => tracing::debug!("Rejected request: {}", detail),
            ApiError::Internal(detail) => tracing::error!("Request failed: {}", detail),
        }
        let body = Json(json!({ "error": self.public_message() }));
        (self.status_code(), body).into_response()
    }
}
