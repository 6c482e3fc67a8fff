//! Generation units: the atomic work items inside a stage.

use serde::{Deserialize, Serialize};

use crate::failure::{ErrorKind, UnitFailure};
use crate::steps::StepName;

/// Default minimum success rate for a stage to count as completed.
///
/// With `0.0` a stage completes as soon as at least one unit succeeded.
pub const DEFAULT_MIN_SUCCESS_RATE: f64 = 0.0;

// ---------------------------------------------------------------------------
// Unit identity
// ---------------------------------------------------------------------------

/// What a unit generates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSubject {
    Scene(u32),
    Character(u32),
    /// The whole run (merge and lip-sync).
    Whole,
}

/// Stable identity of a unit within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub step: StepName,
    pub subject: UnitSubject,
}

impl UnitKey {
    pub fn new(step: StepName, subject: UnitSubject) -> Self {
        Self { step, subject }
    }
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.subject {
            UnitSubject::Scene(i) => write!(f, "{}/scene-{i}", self.step),
            UnitSubject::Character(i) => write!(f, "{}/character-{i}", self.step),
            UnitSubject::Whole => write!(f, "{}/whole", self.step),
        }
    }
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

define_str_enum! {
    /// Lifecycle of a single generation unit.
    UnitStatus {
        Pending = "pending",
        Processing = "processing",
        Completed = "completed",
        Failed = "failed",
    }
}

/// One unit of generation work and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationUnit {
    pub key: UnitKey,
    pub status: UnitStatus,
    /// Provider that produced the output (or the last failure).
    pub provider: Option<String>,
    pub output_ref: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    /// Provider calls made for this unit in its latest run.
    pub attempts: u32,
}

impl GenerationUnit {
    pub fn new(key: UnitKey) -> Self {
        Self {
            key,
            status: UnitStatus::Pending,
            provider: None,
            output_ref: None,
            error_kind: None,
            error_detail: None,
            attempts: 0,
        }
    }

    pub fn complete(&mut self, provider: String, output_ref: String, attempts: u32) {
        self.status = UnitStatus::Completed;
        self.provider = Some(provider);
        self.output_ref = Some(output_ref);
        self.error_kind = None;
        self.error_detail = None;
        self.attempts = attempts;
    }

    pub fn fail(&mut self, failure: &UnitFailure, attempts: u32) {
        self.status = UnitStatus::Failed;
        self.provider = failure.provider.clone();
        self.output_ref = None;
        self.error_kind = Some(failure.kind);
        self.error_detail = Some(failure.detail.clone());
        self.attempts = attempts;
    }

    /// Put a failed or interrupted unit back in the queue for a resume.
    pub fn requeue(&mut self) {
        *self = Self::new(self.key);
    }

    pub fn is_completed(&self) -> bool {
        self.status == UnitStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Stage tallies
// ---------------------------------------------------------------------------

/// Aggregate counts over the units of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StageTally {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StageTally {
    pub fn from_units<'a, I>(units: I) -> Self
    where
        I: IntoIterator<Item = &'a GenerationUnit>,
    {
        let mut tally = Self::default();
        for unit in units {
            tally.total += 1;
            match unit.status {
                UnitStatus::Completed => tally.completed += 1,
                UnitStatus::Failed => tally.failed += 1,
                _ => {}
            }
        }
        tally
    }

    /// Fraction of units that completed; `0.0` for an empty stage.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    /// Success rate as a whole percentage for the step's progress field.
    pub fn progress_percent(&self) -> u8 {
        (self.success_rate() * 100.0).round().clamp(0.0, 100.0) as u8
    }

    /// Whether the stage counts as completed under `min_success_rate`.
    ///
    /// At least one unit must always succeed, whatever the threshold.
    pub fn passes(&self, min_success_rate: f64) -> bool {
        self.completed > 0 && self.success_rate() >= min_success_rate
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(status: UnitStatus) -> GenerationUnit {
        GenerationUnit {
            status,
            ..GenerationUnit::new(UnitKey::new(StepName::ImageGeneration, UnitSubject::Scene(0)))
        }
    }

    #[test]
    fn tally_counts_statuses() {
        let units = [
            unit(UnitStatus::Completed),
            unit(UnitStatus::Completed),
            unit(UnitStatus::Failed),
        ];
        let tally = StageTally::from_units(&units);
        assert_eq!(tally.total, 3);
        assert_eq!(tally.completed, 2);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.progress_percent(), 67);
    }

    #[test]
    fn any_success_passes_default_threshold() {
        let units = [unit(UnitStatus::Completed), unit(UnitStatus::Failed), unit(UnitStatus::Failed)];
        assert!(StageTally::from_units(&units).passes(DEFAULT_MIN_SUCCESS_RATE));
    }

    #[test]
    fn zero_successes_never_pass() {
        let units = [unit(UnitStatus::Failed)];
        assert!(!StageTally::from_units(&units).passes(0.0));
        assert!(!StageTally::default().passes(0.0));
    }

    #[test]
    fn custom_threshold_is_enforced() {
        let units = [unit(UnitStatus::Completed), unit(UnitStatus::Failed), unit(UnitStatus::Failed)];
        let tally = StageTally::from_units(&units);
        assert!(!tally.passes(0.5));
        assert!(tally.passes(0.3));
    }

    #[test]
    fn requeue_clears_outcome() {
        let mut u = unit(UnitStatus::Pending);
        u.fail(&UnitFailure::new(ErrorKind::Timeout, "deadline").with_provider("sdxl"), 3);
        assert_eq!(u.error_kind, Some(ErrorKind::Timeout));
        u.requeue();
        assert_eq!(u.status, UnitStatus::Pending);
        assert!(u.error_kind.is_none());
        assert_eq!(u.attempts, 0);
    }

    #[test]
    fn unit_key_display() {
        let key = UnitKey::new(StepName::VideoGeneration, UnitSubject::Scene(2));
        assert_eq!(key.to_string(), "video_generation/scene-2");
    }

    #[test]
    fn subject_serializes_externally_tagged() {
        let json = serde_json::to_value(UnitSubject::Character(1)).unwrap();
        assert_eq!(json, serde_json::json!({ "character": 1 }));
        let json = serde_json::to_value(UnitSubject::Whole).unwrap();
        assert_eq!(json, serde_json::json!("whole"));
    }
}
