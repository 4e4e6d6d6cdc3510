//! HTTP routes exposed to BigQuery.

use std::{any::Any, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State, rejection::BytesRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{Instrument, error, info_span};

use crate::batch::{BatchReply, BatchRequest, run_batch};
use crate::config::DEFAULT_MAX_BODY_BYTES;
use crate::error::ApiError;
use crate::transform::{TransformBackend, TransformOp};

/// Shared, read-only state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn TransformBackend>,
    pub concurrency: usize,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(backend: Arc<dyn TransformBackend>, concurrency: usize) -> Self {
        Self {
            backend,
            concurrency: concurrency.max(1),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

async fn encrypt_handler(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<BatchReply>, ApiError> {
    handle_batch(&state, TransformOp::Encode, &read_body(body)?).await
}

async fn decrypt_handler(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<BatchReply>, ApiError> {
    handle_batch(&state, TransformOp::Decode, &read_body(body)?).await
}

/// Oversized or unreadable bodies get the same JSON 400 as malformed ones.
fn read_body(body: Result<Bytes, BytesRejection>) -> Result<Bytes, ApiError> {
    body.map_err(|rejection| ApiError::Validation(rejection.body_text()))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn handle_batch(
    state: &AppState,
    op: TransformOp,
    body: &[u8],
) -> Result<Json<BatchReply>, ApiError> {
    let request = BatchRequest::from_slice(body)?;
    let span = info_span!(
        "batch",
        %op,
        request_id = request.request_id.as_deref().unwrap_or("-"),
        caller = request.caller.as_deref().unwrap_or("-"),
        calls = request.calls.len(),
    );

    let expected = request.calls.len();
    let replies = run_batch(state.backend.as_ref(), op, request.inputs(), state.concurrency)
        .instrument(span)
        .await;
    if replies.len() != expected {
        return Err(ApiError::Internal(format!(
            "{} replies for {} calls",
            replies.len(),
            expected
        )));
    }
    Ok(Json(BatchReply { replies }))
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Handler panicked: {}", detail);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}

/// Build the relay router around the given transform backend.
pub fn build_router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);
    Router::new()
        .route("/encrypt", post(encrypt_handler))
        .route("/decrypt", post(decrypt_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(body_limit)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}
