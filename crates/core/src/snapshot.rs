//! Client-facing status snapshot returned by the polling gateway.

use serde::{Deserialize, Serialize};

use crate::failure::ErrorKind;
use crate::progress::PipelineProgress;
use crate::steps::{GenerationStatus, StepName, StepStatus};
use crate::types::{DbId, Timestamp};

/// One entry of the ordered step array in a [`StatusSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub name: StepName,
    pub status: StepStatus,
    pub progress: u8,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

/// Point-in-time view of a video generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub generation_id: DbId,
    pub status: GenerationStatus,
    pub steps: Vec<StepSnapshot>,
    pub progress: PipelineProgress,
    pub can_resume: bool,
    pub retry_count: u32,
    pub video_url: Option<String>,
    pub lipsync_failed: bool,
    pub failed_at_step: Option<StepName>,
    pub error_message: Option<String>,
    /// Actionable next step derived from the failure kind.
    pub error_hint: Option<String>,
    /// Recommended delay before the next poll; `0` means stop polling.
    pub poll_interval_ms: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl StatusSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
