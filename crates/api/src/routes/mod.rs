pub mod generation;
pub mod health;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /start-generation                      start a run (POST)
/// /generation-status/{id}                status snapshot (GET)
/// /retry-generation                      retry or resume a run (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().merge(generation::router())
}
