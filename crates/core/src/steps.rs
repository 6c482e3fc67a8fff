//! Pipeline steps and the run-level state machine.
//!
//! A run is a fixed, ordered sequence of steps (lip-sync is optional). The
//! overall [`GenerationStatus`] is never stored independently of the steps:
//! it is recomputed from them with [`derive_status`] on every write.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::failure::ErrorKind;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Step names
// ---------------------------------------------------------------------------

define_str_enum! {
    /// One of the five ordered pipeline stages.
    StepName {
        AudioGeneration = "audio_generation",
        ImageGeneration = "image_generation",
        VideoGeneration = "video_generation",
        AudioVideoMerge = "audio_video_merge",
        LipSync = "lip_sync",
    }
}

impl StepName {
    /// Zero-based position in the fixed stage order.
    pub fn index(self) -> usize {
        match self {
            StepName::AudioGeneration => 0,
            StepName::ImageGeneration => 1,
            StepName::VideoGeneration => 2,
            StepName::AudioVideoMerge => 3,
            StepName::LipSync => 4,
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<StepName> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Human-readable stage label used in user-facing messages.
    pub fn label(self) -> &'static str {
        match self {
            StepName::AudioGeneration => "Audio generation",
            StepName::ImageGeneration => "Image generation",
            StepName::VideoGeneration => "Video generation",
            StepName::AudioVideoMerge => "Audio/video merge",
            StepName::LipSync => "Lip-sync",
        }
    }

    /// Whether the stage fans out into one unit per scene or character.
    ///
    /// Merge and lip-sync always run a single whole-run unit.
    pub fn fans_out(self) -> bool {
        !matches!(self, StepName::AudioVideoMerge | StepName::LipSync)
    }
}

// ---------------------------------------------------------------------------
// Step status
// ---------------------------------------------------------------------------

define_str_enum! {
    /// Per-step lifecycle status.
    StepStatus {
        Pending = "pending",
        Processing = "processing",
        Completed = "completed",
        Failed = "failed",
        Retrying = "retrying",
    }
}

impl StepStatus {
    /// A stage worker is currently running for this step.
    pub fn is_active(self) -> bool {
        matches!(self, StepStatus::Processing | StepStatus::Retrying)
    }
}

// ---------------------------------------------------------------------------
// PipelineStep
// ---------------------------------------------------------------------------

/// Per-stage progress record embedded in a video generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub name: StepName,
    pub status: StepStatus,
    /// Completed units as a percentage of the stage's units (0-100).
    pub progress: u8,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Number of coordinator restarts of this step. Also acts as the epoch
    /// that stage workers must match before writing unit results.
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl PipelineStep {
    pub fn new(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            progress: 0,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error_message: None,
            error_kind: None,
        }
    }

    /// Return the step to its initial pending state, keeping the retry count.
    pub fn reset(&mut self) {
        let retry_count = self.retry_count;
        *self = Self::new(self.name);
        self.retry_count = retry_count;
    }
}

/// Build the initial step list for a new run.
pub fn initial_steps(lip_sync: bool) -> Vec<PipelineStep> {
    StepName::ALL
        .iter()
        .copied()
        .filter(|name| lip_sync || *name != StepName::LipSync)
        .map(PipelineStep::new)
        .collect()
}

/// Check the ordering invariant: a step may leave `pending` only when the
/// step before it is `completed`.
pub fn validate_step_sequence(steps: &[PipelineStep]) -> Result<(), CoreError> {
    for pair in steps.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.status != StepStatus::Pending && prev.status != StepStatus::Completed {
            return Err(CoreError::Validation(format!(
                "Step '{}' is {} while preceding step '{}' is {}",
                next.name, next.status, prev.name, prev.status
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

define_str_enum! {
    /// Overall status of a video generation run, in pipeline order.
    GenerationStatus {
        Pending = "pending",
        GeneratingAudio = "generating_audio",
        AudioCompleted = "audio_completed",
        GeneratingImages = "generating_images",
        ImagesCompleted = "images_completed",
        GeneratingVideo = "generating_video",
        VideoCompleted = "video_completed",
        MergingAudio = "merging_audio",
        ApplyingLipsync = "applying_lipsync",
        LipsyncCompleted = "lipsync_completed",
        LipsyncFailed = "lipsync_failed",
        Completed = "completed",
        Failed = "failed",
    }
}

impl GenerationStatus {
    /// Completed and failed runs receive no further automatic transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, GenerationStatus::Completed | GenerationStatus::Failed)
    }
}

/// The status reported while a stage worker runs `step`.
fn in_progress_status(step: StepName) -> GenerationStatus {
    match step {
        StepName::AudioGeneration => GenerationStatus::GeneratingAudio,
        StepName::ImageGeneration => GenerationStatus::GeneratingImages,
        StepName::VideoGeneration => GenerationStatus::GeneratingVideo,
        StepName::AudioVideoMerge => GenerationStatus::MergingAudio,
        StepName::LipSync => GenerationStatus::ApplyingLipsync,
    }
}

/// The status reported between `step` completing and its successor starting.
fn after_status(step: StepName) -> GenerationStatus {
    match step {
        StepName::AudioGeneration => GenerationStatus::AudioCompleted,
        StepName::ImageGeneration => GenerationStatus::ImagesCompleted,
        StepName::VideoGeneration => GenerationStatus::VideoCompleted,
        StepName::AudioVideoMerge => GenerationStatus::ApplyingLipsync,
        StepName::LipSync => GenerationStatus::LipsyncCompleted,
    }
}

/// Derive the overall run status from the step statuses.
///
/// `delivered` is true once the final video URL has been published; it
/// separates the `lipsync_completed`/`lipsync_failed` checkpoints from
/// `completed`. A failed lip-sync step never fails the run.
pub fn derive_status(steps: &[PipelineStep], delivered: bool) -> GenerationStatus {
    let mut last_completed: Option<StepName> = None;

    for step in steps {
        match step.status {
            StepStatus::Completed => last_completed = Some(step.name),
            StepStatus::Failed if step.name == StepName::LipSync => {
                return if delivered {
                    GenerationStatus::Completed
                } else {
                    GenerationStatus::LipsyncFailed
                };
            }
            StepStatus::Failed => return GenerationStatus::Failed,
            StepStatus::Processing | StepStatus::Retrying => return in_progress_status(step.name),
            StepStatus::Pending => {
                return last_completed
                    .map(after_status)
                    .unwrap_or(GenerationStatus::Pending);
            }
        }
    }

    match last_completed {
        None => GenerationStatus::Pending,
        Some(_) if delivered => GenerationStatus::Completed,
        Some(StepName::AudioVideoMerge) => GenerationStatus::MergingAudio,
        Some(step) => after_status(step),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
