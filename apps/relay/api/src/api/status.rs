//! Request status lookups for callers that dispatched with `?wait=false`.

use async_relay::ResultRecord;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use crate::error::ApiError;
use crate::state::AppState;

/// Longest expiry a caller may request
pub const MAX_EXTEND_SECS: u64 = 7 * 24 * 60 * 60;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/{id}", get(get_status).delete(remove))
        .route("/{id}/exists", get(exists))
        .route("/{id}/extend", post(extend))
        .with_state(state)
}

/// Current record, without consuming it
async fn get_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ResultRecord>, ApiError> {
    state
        .relay
        .waiter
        .status(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no result for request {}", id)))
}

/// Consume a record the caller no longer needs
async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let removed = state.relay.results.delete(&id).await?;
    Ok(Json(json!({ "correlationId": id, "removed": removed })))
}

async fn exists(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let exists = state.relay.results.exists(&id).await?;
    Ok(Json(json!({ "correlationId": id, "exists": exists })))
}

#[derive(Debug, Deserialize)]
struct ExtendParams {
    ttl_secs: Option<u64>,
}

/// Push the record's expiry out; defaults to the configured result TTL
async fn extend(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ExtendParams>,
) -> Result<Json<Value>, ApiError> {
    let ttl = params
        .ttl_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.relay.results.ttl());

    if ttl.is_zero() {
        return Err(ApiError::BadRequest("ttl_secs must be positive".to_string()));
    }
    if ttl.as_secs() > MAX_EXTEND_SECS {
        return Err(ApiError::BadRequest(format!("ttl_secs must be at most {}", MAX_EXTEND_SECS)));
    }

    if !state.relay.results.extend(&id, ttl).await? {
        return Err(ApiError::NotFound(format!("no result for request {}", id)));
    }
    Ok(Json(json!({ "correlationId": id, "ttlSecs": ttl.as_secs() })))
}
