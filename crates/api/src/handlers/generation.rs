//! Handlers for video generation runs.
//!
//! Routes:
//! - `POST /start-generation`          start a run
//! - `GET  /generation-status/{id}`    poll a run
//! - `POST /retry-generation`          retry or resume a run
//!
//! Start and retry return as soon as the run is dispatched; clients follow
//! progress through the status endpoint.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use vidgen_core::providers::QualityTier;
use vidgen_core::steps::StepName;
use vidgen_core::types::DbId;
use vidgen_pipeline::StartRequest;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartGenerationRequest {
    pub script_id: DbId,
    pub chapter_id: DbId,
    /// `free`, `standard` or `premium` (default: `standard`).
    pub quality_tier: Option<String>,
    pub user_id: Option<DbId>,
    /// Defaults to `true`; ignored when the tier does not allow lip-sync.
    pub lip_sync: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct StartGenerationResponse {
    pub generation_id: DbId,
}

#[derive(Debug, Deserialize)]
pub struct RetryGenerationRequest {
    pub generation_id: DbId,
    /// Step to restart from; defaults to the step the run failed at.
    pub from_step: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RetryGenerationResponse {
    pub accepted: bool,
    pub from_step: StepName,
}

/// POST /api/v1/start-generation
pub async fn start_generation(
    State(state): State<AppState>,
    Json(input): Json<StartGenerationRequest>,
) -> AppResult<impl IntoResponse> {
    require_id("script_id", input.script_id)?;
    require_id("chapter_id", input.chapter_id)?;
    let quality_tier = match input.quality_tier.as_deref() {
        Some(tier) => QualityTier::parse(tier)?,
        None => QualityTier::Standard,
    };

    let generation_id = state
        .coordinator
        .start(StartRequest {
            script_id: input.script_id,
            chapter_id: input.chapter_id,
            quality_tier,
            user_id: input.user_id,
            lip_sync: input.lip_sync.unwrap_or(true),
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: StartGenerationResponse { generation_id },
        }),
    ))
}

/// GET /api/v1/generation-status/{id}
pub async fn get_generation_status(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let snapshot = state.gateway.get_status(id).await?;
    Ok(Json(DataResponse { data: snapshot }))
}

/// POST /api/v1/retry-generation
///
/// 409 while the run still has a step in flight.
pub async fn retry_generation(
    State(state): State<AppState>,
    Json(input): Json<RetryGenerationRequest>,
) -> AppResult<impl IntoResponse> {
    require_id("generation_id", input.generation_id)?;
    let from_step = input
        .from_step
        .as_deref()
        .map(StepName::parse)
        .transpose()?;

    let from_step = state
        .coordinator
        .retry(input.generation_id, from_step)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: RetryGenerationResponse {
                accepted: true,
                from_step,
            },
        }),
    ))
}

fn require_id(field: &str, id: DbId) -> AppResult<()> {
    if id <= 0 {
        return Err(AppError::BadRequest(format!("{field} must be a positive id")));
    }
    Ok(())
}
