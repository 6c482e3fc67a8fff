//! Video generation run models (one row per pipeline run).

use serde::Serialize;
use sqlx::FromRow;
use vidgen_core::providers::QualityTier;
use vidgen_core::steps::{derive_status, GenerationStatus, PipelineStep, StepName, StepStatus};
use vidgen_core::types::{DbId, Timestamp};
use vidgen_core::units::{GenerationUnit, UnitKey};

/// A row from the `video_generations` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct VideoGeneration {
    pub id: DbId,
    pub script_id: DbId,
    pub chapter_id: DbId,
    pub user_id: Option<DbId>,
    #[sqlx(try_from = "String")]
    pub quality_tier: QualityTier,
    #[sqlx(try_from = "String")]
    pub status: GenerationStatus,
    pub lip_sync_enabled: bool,
    /// Final deliverable; set only once the run completes.
    pub video_url: Option<String>,
    pub error_message: Option<String>,
    pub can_resume: bool,
    pub lipsync_failed: bool,
    /// Coordinator-level stage restarts. Provider fallbacks do not count.
    pub retry_count: i32,
    #[sqlx(json)]
    pub steps: Vec<PipelineStep>,
    #[sqlx(json)]
    pub units: Vec<GenerationUnit>,
    /// Optimistic concurrency token, bumped by every successful write.
    pub version: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for inserting a new run.
#[derive(Debug, Clone)]
pub struct NewVideoGeneration {
    pub script_id: DbId,
    pub chapter_id: DbId,
    pub user_id: Option<DbId>,
    pub quality_tier: QualityTier,
    pub lip_sync_enabled: bool,
}

impl VideoGeneration {
    pub fn step(&self, name: StepName) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: StepName) -> Option<&mut PipelineStep> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    pub fn units_for(&self, step: StepName) -> impl Iterator<Item = &GenerationUnit> {
        self.units.iter().filter(move |u| u.key.step == step)
    }

    pub fn unit_mut(&mut self, key: &UnitKey) -> Option<&mut GenerationUnit> {
        self.units.iter_mut().find(|u| u.key == *key)
    }

    /// Output of a completed unit, if any.
    pub fn output_of(&self, key: &UnitKey) -> Option<&str> {
        self.units
            .iter()
            .find(|u| u.key == *key && u.is_completed())
            .and_then(|u| u.output_ref.as_deref())
    }

    /// The non-optional step the run failed at, if it has failed.
    pub fn failed_at_step(&self) -> Option<StepName> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Failed && s.name != StepName::LipSync)
            .map(|s| s.name)
    }

    /// Recompute the overall status from the step statuses.
    pub fn refresh_status(&mut self) {
        self.status = derive_status(&self.steps, self.video_url.is_some());
    }
}
