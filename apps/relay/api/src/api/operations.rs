//! Dispatch endpoints
//!
//! `POST /api/operations/{operation}` publishes the JSON body as the payload and,
//! unless `?wait=false`, blocks until the worker answers or the deadline passes.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::instrument;

use crate::error::ApiError;
use crate::state::AppState;

pub const CORRELATION_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(list_operations))
        .route("/{operation}", post(dispatch))
        .with_state(state)
}

async fn list_operations(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "operations": state.relay.dispatcher.routes().operations() }))
}

#[derive(Debug, Default, Deserialize)]
struct DispatchParams {
    wait: Option<bool>,
    /// Capped at the configured maximum wait
    timeout_ms: Option<u64>,
}

#[instrument(skip(state, body))]
async fn dispatch(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    Query(params): Query<DispatchParams>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let payload = parse_payload(&body)?;
    let correlation_id = state.relay.dispatcher.publish(&operation, payload).await?;

    if params.wait == Some(false) {
        let body = Json(json!({ "correlationId": correlation_id, "status": "processing" }));
        return Ok((StatusCode::ACCEPTED, [(CORRELATION_HEADER, correlation_id)], body).into_response());
    }

    let wait = state.relay.waiter.config();
    let max_wait = params
        .timeout_ms
        .map(Duration::from_millis)
        .map_or(wait.max_wait, |requested| requested.min(wait.max_wait));

    let data = state
        .relay
        .waiter
        .wait_for(&correlation_id, max_wait, wait.poll_interval)
        .await?;

    Ok((StatusCode::OK, [(CORRELATION_HEADER, correlation_id)], Json(data)).into_response())
}

/// Empty body means no payload
fn parse_payload(body: &[u8]) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON payload: {}", e)))
}
