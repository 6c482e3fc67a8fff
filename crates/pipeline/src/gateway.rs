//! Polling Gateway: read-only status snapshots for clients.

use std::sync::Arc;

use vidgen_core::progress::{compute_overall_progress, recommended_poll_interval_ms};
use vidgen_core::snapshot::{StatusSnapshot, StepSnapshot};
use vidgen_core::types::DbId;
use vidgen_db::models::video_generation::VideoGeneration;

use crate::error::PipelineError;
use crate::store::{load, StatusStore};

#[derive(Clone)]
pub struct StatusGateway {
    store: Arc<dyn StatusStore>,
}

impl StatusGateway {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    /// Current snapshot of a run. Never changes any state.
    pub async fn get_status(&self, id: DbId) -> Result<StatusSnapshot, PipelineError> {
        let generation = load(self.store.as_ref(), id).await?;
        Ok(snapshot(&generation))
    }
}

/// Build the client-facing view of a run.
pub fn snapshot(generation: &VideoGeneration) -> StatusSnapshot {
    let progress = compute_overall_progress(generation.status, &generation.steps);
    let failed_at_step = generation.failed_at_step();
    let error_hint = failed_at_step
        .and_then(|step| generation.step(step))
        .and_then(|step| step.error_kind)
        .and_then(|kind| kind.hint())
        .map(str::to_string);
    let poll_interval_ms = recommended_poll_interval_ms(generation.status, progress.current_step);

    StatusSnapshot {
        generation_id: generation.id,
        status: generation.status,
        steps: generation
            .steps
            .iter()
            .map(|s| StepSnapshot {
                name: s.name,
                status: s.status,
                progress: s.progress,
                started_at: s.started_at,
                completed_at: s.completed_at,
                retry_count: s.retry_count,
                error_message: s.error_message.clone(),
                error_kind: s.error_kind,
            })
            .collect(),
        progress,
        can_resume: generation.can_resume,
        retry_count: u32::try_from(generation.retry_count).unwrap_or(0),
        video_url: generation.video_url.clone(),
        lipsync_failed: generation.lipsync_failed,
        failed_at_step,
        error_message: generation.error_message.clone(),
        error_hint,
        poll_interval_ms,
        created_at: generation.created_at,
        updated_at: generation.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use vidgen_core::failure::ErrorKind;
    use vidgen_core::providers::QualityTier;
    use vidgen_core::steps::{initial_steps, GenerationStatus, StepName, StepStatus};

    use super::*;

    fn generation() -> VideoGeneration {
        VideoGeneration {
            id: 3,
            script_id: 1,
            chapter_id: 1,
            user_id: None,
            quality_tier: QualityTier::Standard,
            status: GenerationStatus::Pending,
            lip_sync_enabled: true,
            video_url: None,
            error_message: None,
            can_resume: false,
            lipsync_failed: false,
            retry_count: 2,
            steps: initial_steps(true),
            units: Vec::new(),
            version: 4,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn failed_run_carries_hint_and_stops_polling() {
        let mut g = generation();
        g.steps[0].status = StepStatus::Completed;
        g.steps[1].status = StepStatus::Failed;
        g.steps[1].error_kind = Some(ErrorKind::RateLimited);
        g.can_resume = true;
        g.refresh_status();

        let snap = snapshot(&g);
        assert_eq!(snap.status, GenerationStatus::Failed);
        assert_eq!(snap.failed_at_step, Some(StepName::ImageGeneration));
        assert_eq!(
            snap.error_hint.as_deref(),
            ErrorKind::RateLimited.hint()
        );
        assert_eq!(snap.poll_interval_ms, 0);
        assert_eq!(snap.retry_count, 2);
        assert!(snap.can_resume);
    }

    #[test]
    fn running_run_recommends_polling() {
        let mut g = generation();
        g.steps[0].status = StepStatus::Processing;
        g.steps[0].progress = 50;
        g.refresh_status();

        let snap = snapshot(&g);
        assert_eq!(snap.status, GenerationStatus::GeneratingAudio);
        assert_eq!(snap.progress.current_step, Some(StepName::AudioGeneration));
        assert!(snap.poll_interval_ms > 0);
        assert!(snap.error_hint.is_none());
        assert_eq!(snap.steps.len(), 5);
    }

    #[test]
    fn failed_lip_sync_is_not_a_failed_step() {
        let mut g = generation();
        for step in &mut g.steps {
            step.status = StepStatus::Completed;
        }
        g.steps[4].status = StepStatus::Failed;
        g.steps[4].error_kind = Some(ErrorKind::Timeout);
        g.video_url = Some("merged.mp4".into());
        g.lipsync_failed = true;
        g.refresh_status();

        let snap = snapshot(&g);
        assert_eq!(snap.status, GenerationStatus::Completed);
        assert_eq!(snap.failed_at_step, None);
        assert!(snap.error_hint.is_none());
        assert_eq!(snap.progress.percentage, 100);
    }
}
