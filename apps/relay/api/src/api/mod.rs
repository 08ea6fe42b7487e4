use axum::Router;

pub mod operations;
pub mod status;

use crate::state::AppState;

/// API routes without the `/api` prefix
pub fn routes(state: &AppState) -> Router {
    Router::new()
        .nest("/request-status", status::router(state.clone()))
        .nest("/operations", operations::router(state.clone()))
}
