//! Blended run progress and client polling cadence.
//!
//! Each step owns a band of the overall percentage. Within its band a step
//! contributes its own success rate; a completed step fills its band.
//! Runs without lip-sync are renormalised so they still end at 100.

use serde::{Deserialize, Serialize};

use crate::steps::{GenerationStatus, PipelineStep, StepName, StepStatus};

/// Poll interval while waiting for the first stage or between stages.
pub const POLL_INTERVAL_IDLE_MS: u64 = 2_000;
/// Poll interval during audio synthesis (network-bound).
pub const POLL_INTERVAL_AUDIO_MS: u64 = 3_000;
/// Poll interval during image synthesis (compute-heavy).
pub const POLL_INTERVAL_IMAGE_MS: u64 = 5_000;
/// Poll interval during video synthesis (compute-heavy, slowest).
pub const POLL_INTERVAL_VIDEO_MS: u64 = 10_000;
/// Poll interval during merge (short, I/O-bound).
pub const POLL_INTERVAL_MERGE_MS: u64 = 2_000;
/// Poll interval during lip-sync.
pub const POLL_INTERVAL_LIP_SYNC_MS: u64 = 5_000;

/// Percentage band `[start, end)` a step occupies in the overall progress.
pub fn progress_band(step: StepName) -> (f64, f64) {
    match step {
        StepName::AudioGeneration => (0.0, 25.0),
        StepName::ImageGeneration => (25.0, 50.0),
        StepName::VideoGeneration => (50.0, 75.0),
        StepName::AudioVideoMerge => (75.0, 85.0),
        StepName::LipSync => (85.0, 100.0),
    }
}

/// Blended progress summary returned to polling clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineProgress {
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub total_steps: usize,
    /// Overall completion, 0-100.
    pub percentage: u8,
    pub current_step: Option<StepName>,
    pub next_step: Option<StepName>,
}

/// Compute the blended overall progress for a run.
pub fn compute_overall_progress(
    status: GenerationStatus,
    steps: &[PipelineStep],
) -> PipelineProgress {
    let mut earned = 0.0;
    let mut available = 0.0;

    for step in steps {
        let (start, end) = progress_band(step.name);
        let width = end - start;
        available += width;
        earned += match step.status {
            StepStatus::Completed => width,
            StepStatus::Pending => 0.0,
            _ => width * f64::from(step.progress.min(100)) / 100.0,
        };
    }

    let percentage = if status == GenerationStatus::Completed {
        100
    } else if available > 0.0 {
        (earned * 100.0 / available).floor().clamp(0.0, 100.0) as u8
    } else {
        0
    };

    let current_step = current_step(steps);
    let next_step = match current_step {
        Some(current) => steps
            .iter()
            .map(|s| s.name)
            .find(|name| name.index() > current.index()),
        None => steps
            .iter()
            .find(|s| s.status == StepStatus::Pending)
            .map(|s| s.name),
    };

    PipelineProgress {
        completed_steps: steps.iter().filter(|s| s.status == StepStatus::Completed).count(),
        failed_steps: steps.iter().filter(|s| s.status == StepStatus::Failed).count(),
        total_steps: steps.len(),
        percentage,
        current_step,
        next_step,
    }
}

/// The step a client should consider "current": the running step, or the
/// step the run failed at.
fn current_step(steps: &[PipelineStep]) -> Option<StepName> {
    steps
        .iter()
        .find(|s| s.status.is_active())
        .or_else(|| {
            steps
                .iter()
                .find(|s| s.status == StepStatus::Failed && s.name != StepName::LipSync)
        })
        .map(|s| s.name)
}

/// Recommended client poll interval in milliseconds. Zero means stop.
pub fn recommended_poll_interval_ms(
    status: GenerationStatus,
    current_step: Option<StepName>,
) -> u64 {
    if status.is_terminal() {
        return 0;
    }
    match current_step {
        Some(StepName::AudioGeneration) => POLL_INTERVAL_AUDIO_MS,
        Some(StepName::ImageGeneration) => POLL_INTERVAL_IMAGE_MS,
        Some(StepName::VideoGeneration) => POLL_INTERVAL_VIDEO_MS,
        Some(StepName::AudioVideoMerge) => POLL_INTERVAL_MERGE_MS,
        Some(StepName::LipSync) => POLL_INTERVAL_LIP_SYNC_MS,
        None => POLL_INTERVAL_IDLE_MS,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
