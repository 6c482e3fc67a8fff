//! Route definitions for video generation runs.
//!
//! ```text
//! POST   /start-generation               start_generation
//! GET    /generation-status/{id}         get_generation_status
//! POST   /retry-generation               retry_generation
//! ```

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::generation;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start-generation", post(generation::start_generation))
        .route(
            "/generation-status/{id}",
            get(generation::get_generation_status),
        )
        .route("/retry-generation", post(generation::retry_generation))
}
