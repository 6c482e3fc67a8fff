//! Stage Worker: drives one stage's units through the executor.
//!
//! Units run concurrently up to a bound. Each result is written back to the
//! status store as soon as it resolves, guarded by the step's epoch so a
//! worker that was superseded (retry, recovery) can never overwrite newer
//! state. The whole stage is bounded by its maximum duration: units still
//! unresolved at the deadline fail with a timeout and so does the stage.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use vidgen_core::failure::{dominant_class, ErrorClass, ErrorKind, UnitFailure};
use vidgen_core::providers::QualityTier;
use vidgen_core::steps::StepName;
use vidgen_core::types::DbId;
use vidgen_core::units::{StageTally, UnitKey, UnitStatus};
use vidgen_db::models::video_generation::VideoGeneration;

use crate::error::PipelineError;
use crate::executor::{UnitExecutor, UnitOutcome};
use crate::store::{load, modify, StatusStore};

/// One unit to run, with its payload or the reason it could not be built.
#[derive(Debug, Clone)]
pub struct UnitJob {
    pub key: UnitKey,
    pub payload: Result<Value, UnitFailure>,
}

/// Everything a worker needs to run one stage of one run.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub generation_id: DbId,
    pub step: StepName,
    /// Step retry count at dispatch; writes are dropped once it changes.
    pub epoch: u32,
    pub tier: QualityTier,
    pub max_duration: Duration,
    pub jobs: Vec<UnitJob>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed,
    Failed {
        /// Representative failure of the dominant class.
        failure: UnitFailure,
        class: ErrorClass,
    },
}

/// Aggregated result of a stage, handed to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub step: StepName,
    pub epoch: u32,
    pub tally: StageTally,
    pub outcome: StageOutcome,
}

/// Whether a worker dispatched at `epoch` may still write to `step`.
pub fn epoch_is_current(generation: &VideoGeneration, step: StepName, epoch: u32) -> bool {
    generation
        .step(step)
        .is_some_and(|s| s.retry_count == epoch && s.status.is_active())
}

/// Runs the units of one stage and aggregates them into a [`StageReport`].
///
/// A stage that hits its deadline is reported failed with a timeout even when
/// some units already succeeded. Those keep their output, so a resume only
/// reruns the units that timed out. A unit whose result cannot be written is
/// failed with the rest of the stage's unresolved units instead of aborting
/// the stage.
pub struct StageWorker {
    store: Arc<dyn StatusStore>,
    executor: Arc<UnitExecutor>,
    concurrency: usize,
    min_success_rate: f64,
}

impl StageWorker {
    pub fn new(
        store: Arc<dyn StatusStore>,
        executor: Arc<UnitExecutor>,
        concurrency: usize,
        min_success_rate: f64,
    ) -> Self {
        Self {
            store,
            executor,
            concurrency: concurrency.max(1),
            min_success_rate,
        }
    }

    /// Run every job of `run` and aggregate the stage outcome.
    ///
    /// Returns `None` if the worker was superseded while running.
    pub async fn run(&self, run: StageRun) -> Result<Option<StageReport>, PipelineError> {
        let StageRun {
            generation_id,
            step,
            epoch,
            tier,
            max_duration,
            jobs,
        } = run;

        tracing::info!(
            generation_id,
            %step,
            epoch,
            units = jobs.len(),
            "Stage worker started",
        );

        let keys: Vec<UnitKey> = jobs.iter().map(|j| j.key).collect();
        let ctx = UnitContext {
            store: Arc::clone(&self.store),
            executor: Arc::clone(&self.executor),
            generation_id,
            epoch,
            tier,
        };
        let work = stream::iter(jobs)
            .map(move |job| run_unit(ctx.clone(), job))
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>();

        let mut recorded: Vec<UnitFailure> = Vec::new();
        let deadline_failure = match tokio::time::timeout(max_duration, work).await {
            Ok(results) => {
                let mut unrecorded = 0usize;
                for result in results {
                    match result {
                        Ok(Recorded::Stale) => return Ok(None),
                        Ok(Recorded::Failed(failure)) => recorded.push(failure),
                        Ok(Recorded::Completed) => {}
                        Err(e) => {
                            tracing::error!(
                                generation_id,
                                %step,
                                error = %e,
                                "Failed to record unit result",
                            );
                            unrecorded += 1;
                        }
                    }
                }
                if unrecorded > 0 {
                    let failure = UnitFailure::new(
                        ErrorKind::Unknown,
                        format!("{unrecorded} unit result(s) could not be recorded"),
                    );
                    if !self.fail_unresolved(generation_id, step, epoch, &keys, &failure).await? {
                        return Ok(None);
                    }
                    recorded.push(failure);
                }
                None
            }
            Err(_) => {
                tracing::warn!(
                    generation_id,
                    %step,
                    max_duration_secs = max_duration.as_secs_f64(),
                    "Stage exceeded its maximum duration",
                );
                let failure = UnitFailure::new(
                    ErrorKind::Timeout,
                    format!("stage exceeded {}s", max_duration.as_secs_f64()),
                );
                if !self.fail_unresolved(generation_id, step, epoch, &keys, &failure).await? {
                    return Ok(None);
                }
                Some(failure)
            }
        };

        let generation = load(self.store.as_ref(), generation_id).await?;
        if !epoch_is_current(&generation, step, epoch) {
            return Ok(None);
        }
        Ok(Some(self.report(
            &generation,
            step,
            epoch,
            &recorded,
            deadline_failure,
        )))
    }

    /// Fail every unit of this run that is still pending or processing.
    async fn fail_unresolved(
        &self,
        generation_id: DbId,
        step: StepName,
        epoch: u32,
        keys: &[UnitKey],
        failure: &UnitFailure,
    ) -> Result<bool, PipelineError> {
        let applied = modify(self.store.as_ref(), generation_id, |generation| {
            if !epoch_is_current(generation, step, epoch) {
                return Ok(None);
            }
            for unit in generation.units.iter_mut().filter(|u| keys.contains(&u.key)) {
                if matches!(unit.status, UnitStatus::Pending | UnitStatus::Processing) {
                    let attempts = unit.attempts;
                    unit.fail(failure, attempts);
                }
            }
            Ok(Some(()))
        })
        .await?;
        Ok(applied.is_some())
    }

    fn report(
        &self,
        generation: &VideoGeneration,
        step: StepName,
        epoch: u32,
        recorded: &[UnitFailure],
        deadline_failure: Option<UnitFailure>,
    ) -> StageReport {
        let tally = StageTally::from_units(generation.units_for(step));

        let outcome = if let Some(failure) = deadline_failure {
            let class = failure.kind.class();
            StageOutcome::Failed { failure, class }
        } else if tally.passes(self.min_success_rate) {
            StageOutcome::Completed
        } else {
            let stored: Vec<UnitFailure> = generation
                .units_for(step)
                .filter(|u| u.status == UnitStatus::Failed)
                .filter_map(|u| {
                    let kind = u.error_kind?;
                    let mut failure =
                        UnitFailure::new(kind, u.error_detail.clone().unwrap_or_default());
                    failure.provider = u.provider.clone();
                    Some(failure)
                })
                .collect();
            // A stage with nothing to generate cannot succeed on a resume either.
            let fallback_class = if tally.total == 0 {
                ErrorClass::Fatal
            } else {
                ErrorClass::Transient
            };
            let class = dominant_class(stored.iter().map(|f| f.kind))
                .or_else(|| dominant_class(recorded.iter().map(|f| f.kind)))
                .unwrap_or(fallback_class);

            // Most recent failure of the dominant class, then any stored one.
            let failure = recorded
                .iter()
                .rev()
                .find(|f| f.kind.class() == class)
                .or_else(|| stored.iter().find(|f| f.kind.class() == class))
                .or_else(|| stored.first())
                .cloned()
                .unwrap_or_else(|| match fallback_class {
                    ErrorClass::Fatal => {
                        UnitFailure::new(ErrorKind::InvalidInput, "stage has no units to generate")
                    }
                    ErrorClass::Transient => UnitFailure::new(ErrorKind::Unknown, "no unit succeeded"),
                });

            StageOutcome::Failed { failure, class }
        };

        tracing::info!(
            generation_id = generation.id,
            %step,
            total = tally.total,
            completed = tally.completed,
            failed = tally.failed,
            success_rate = tally.success_rate(),
            "Stage worker finished",
        );

        StageReport {
            step,
            epoch,
            tally,
            outcome,
        }
    }
}

/// Owned handles a unit future needs, so unit futures borrow nothing.
#[derive(Clone)]
struct UnitContext {
    store: Arc<dyn StatusStore>,
    executor: Arc<UnitExecutor>,
    generation_id: DbId,
    epoch: u32,
    tier: QualityTier,
}

/// Run one unit and write its result back.
async fn run_unit(ctx: UnitContext, job: UnitJob) -> Result<Recorded, PipelineError> {
    let UnitContext {
        store,
        executor,
        generation_id,
        epoch,
        tier,
    } = ctx;

    let outcome = match job.payload {
        Ok(payload) => executor.execute(&job.key, tier, &payload).await,
        Err(failure) => UnitOutcome::Failed {
            failure,
            attempts: 0,
        },
    };

    let key = job.key;
    let applied = modify(store.as_ref(), generation_id, |generation| {
        if !epoch_is_current(generation, key.step, epoch) {
            return Ok(None);
        }
        let Some(unit) = generation.unit_mut(&key) else {
            return Ok(None);
        };
        match &outcome {
            UnitOutcome::Succeeded {
                provider,
                output_ref,
                attempts,
            } => unit.complete(provider.clone(), output_ref.clone(), *attempts),
            UnitOutcome::Failed { failure, attempts } => unit.fail(failure, *attempts),
        }
        let progress = StageTally::from_units(generation.units_for(key.step)).progress_percent();
        if let Some(step) = generation.step_mut(key.step) {
            step.progress = progress;
        }
        Ok(Some(()))
    })
    .await?;

    if applied.is_none() {
        tracing::debug!(generation_id, unit = %key, "Dropping result of superseded unit");
        return Ok(Recorded::Stale);
    }
    Ok(match outcome {
        UnitOutcome::Succeeded { .. } => Recorded::Completed,
        UnitOutcome::Failed { failure, .. } => Recorded::Failed(failure),
    })
}

/// What happened to one unit's result write.
enum Recorded {
    Completed,
    Failed(UnitFailure),
    Stale,
}
