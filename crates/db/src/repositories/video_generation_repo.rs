//! Repository for the `video_generations` table.
//!
//! Writes after creation go through [`VideoGenerationRepo::update_versioned`],
//! a compare-and-swap on the `version` column. Callers re-read and re-apply
//! their change when it returns `None`.

use sqlx::types::Json;
use sqlx::PgPool;
use vidgen_core::steps::{initial_steps, GenerationStatus};
use vidgen_core::types::{DbId, Timestamp};

use crate::models::video_generation::{NewVideoGeneration, VideoGeneration};

/// Column list for `video_generations` queries.
const COLUMNS: &str = "\
    id, script_id, chapter_id, user_id, quality_tier, status, lip_sync_enabled, \
    video_url, error_message, can_resume, lipsync_failed, retry_count, \
    steps, units, version, created_at, updated_at";

/// Maximum rows returned by the in-flight scan in one call.
const IN_FLIGHT_SCAN_LIMIT: i64 = 500;

/// Provides persistence for pipeline runs.
pub struct VideoGenerationRepo;

impl VideoGenerationRepo {
    /// Insert a new pending run with its initial step list.
    pub async fn create(
        pool: &PgPool,
        input: &NewVideoGeneration,
    ) -> Result<VideoGeneration, sqlx::Error> {
        let query = format!(
            "INSERT INTO video_generations \
                 (script_id, chapter_id, user_id, quality_tier, status, lip_sync_enabled, steps) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, VideoGeneration>(&query)
            .bind(input.script_id)
            .bind(input.chapter_id)
            .bind(input.user_id)
            .bind(input.quality_tier.as_str())
            .bind(GenerationStatus::Pending.as_str())
            .bind(input.lip_sync_enabled)
            .bind(Json(initial_steps(input.lip_sync_enabled)))
            .fetch_one(pool)
            .await
    }

    /// Find a run by its ID.
    pub async fn find_by_id(
        pool: &PgPool,
        id: DbId,
    ) -> Result<Option<VideoGeneration>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM video_generations WHERE id = $1");
        sqlx::query_as::<_, VideoGeneration>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Persist every mutable field if the stored version still matches
    /// `generation.version`.
    ///
    /// Returns the updated row (with the bumped version), or `None` if another
    /// writer got there first.
    pub async fn update_versioned(
        pool: &PgPool,
        generation: &VideoGeneration,
    ) -> Result<Option<VideoGeneration>, sqlx::Error> {
        let query = format!(
            "UPDATE video_generations \
             SET status = $3, video_url = $4, error_message = $5, \
                 can_resume = $6, lipsync_failed = $7, retry_count = $8, \
                 steps = $9, units = $10, \
                 version = version + 1, updated_at = NOW() \
             WHERE id = $1 AND version = $2 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, VideoGeneration>(&query)
            .bind(generation.id)
            .bind(generation.version)
            .bind(generation.status.as_str())
            .bind(&generation.video_url)
            .bind(&generation.error_message)
            .bind(generation.can_resume)
            .bind(generation.lipsync_failed)
            .bind(generation.retry_count)
            .bind(Json(&generation.steps))
            .bind(Json(&generation.units))
            .fetch_optional(pool)
            .await
    }

    /// Runs that are not terminal and have not been written since `cutoff`.
    pub async fn list_in_flight_before(
        pool: &PgPool,
        cutoff: Timestamp,
    ) -> Result<Vec<VideoGeneration>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM video_generations \
             WHERE status NOT IN ($1, $2) AND updated_at < $3 \
             ORDER BY updated_at ASC \
             LIMIT $4"
        );
        sqlx::query_as::<_, VideoGeneration>(&query)
            .bind(GenerationStatus::Completed.as_str())
            .bind(GenerationStatus::Failed.as_str())
            .bind(cutoff)
            .bind(IN_FLIGHT_SCAN_LIMIT)
            .fetch_all(pool)
            .await
    }
}
