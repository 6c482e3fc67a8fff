//! Pipeline Coordinator: the run-level state machine.
//!
//! The coordinator is the only component that moves steps between
//! `pending`, `processing`/`retrying`, `completed` and `failed`; the overall
//! status follows from the steps on every write. Stages run one at a time
//! per run, each in its own spawned task, and report back through
//! [`PipelineCoordinator::advance`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use vidgen_core::error::CoreError;
use vidgen_core::failure::{stage_error_message, ErrorClass, ErrorKind, UnitFailure};
use vidgen_core::providers::QualityTier;
use vidgen_core::steps::{validate_step_sequence, StepName, StepStatus};
use vidgen_core::types::{DbId, Timestamp};
use vidgen_core::units::{GenerationUnit, StageTally, UnitKey, UnitSubject};
use vidgen_db::models::script::ScriptOutline;
use vidgen_db::models::video_generation::{NewVideoGeneration, VideoGeneration};
use vidgen_events::bus::{
    EVENT_COMPLETED, EVENT_FAILED, EVENT_RETRIED, EVENT_STAGE_COMPLETED, EVENT_STAGE_FAILED,
    EVENT_STAGE_STARTED, EVENT_STARTED,
};
use vidgen_events::{EventBus, GenerationEvent};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::executor::UnitExecutor;
use crate::plan::{build_payload, plan_units};
use crate::provider::{ProviderInvoker, ProviderSelector};
use crate::script::ScriptSource;
use crate::stage::{epoch_is_current, StageOutcome, StageReport, StageRun, StageWorker, UnitJob};
use crate::store::{load, modify, StatusStore};

/// Input of [`PipelineCoordinator::start`].
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub script_id: DbId,
    pub chapter_id: DbId,
    pub quality_tier: QualityTier,
    pub user_id: Option<DbId>,
    /// Requested lip-sync; ignored when the tier does not allow it.
    pub lip_sync: bool,
}

/// How a step is (re)started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Plan the step's units from scratch.
    Fresh,
    /// Keep completed units and re-attempt only failed or pending ones.
    Resume,
}

pub struct PipelineCoordinator {
    store: Arc<dyn StatusStore>,
    scripts: Arc<dyn ScriptSource>,
    worker: StageWorker,
    events: Arc<EventBus>,
    config: PipelineConfig,
}

impl PipelineCoordinator {
    pub fn new(
        store: Arc<dyn StatusStore>,
        scripts: Arc<dyn ScriptSource>,
        invoker: Arc<dyn ProviderInvoker>,
        selector: ProviderSelector,
        events: Arc<EventBus>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let executor = Arc::new(UnitExecutor::new(invoker, selector, &config));
        let worker = StageWorker::new(
            Arc::clone(&store),
            executor,
            config.unit_concurrency,
            config.min_success_rate,
        );
        Arc::new(Self {
            store,
            scripts,
            worker,
            events,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Public transitions
    // -----------------------------------------------------------------------

    /// Create a run and dispatch its audio stage. Returns without waiting
    /// for any generation; callers poll for progress.
    pub async fn start(self: &Arc<Self>, request: StartRequest) -> Result<DbId, PipelineError> {
        let outline = self
            .scripts
            .load_outline(request.script_id, request.chapter_id)
            .await?;
        if outline.is_none() {
            return Err(CoreError::Validation(format!(
                "Chapter {} of script {} has no scenes to generate",
                request.chapter_id, request.script_id
            ))
            .into());
        }

        let lip_sync = request.lip_sync && request.quality_tier.policy().lip_sync_allowed;
        if request.lip_sync && !lip_sync {
            tracing::info!(
                tier = %request.quality_tier,
                "Lip-sync not available for tier, generating without it",
            );
        }

        let created = self
            .store
            .create(&NewVideoGeneration {
                script_id: request.script_id,
                chapter_id: request.chapter_id,
                user_id: request.user_id,
                quality_tier: request.quality_tier,
                lip_sync_enabled: lip_sync,
            })
            .await?;
        let id = created.id;

        tracing::info!(
            generation_id = id,
            script_id = request.script_id,
            chapter_id = request.chapter_id,
            tier = %request.quality_tier,
            lip_sync,
            "Video generation started",
        );
        self.events.publish(
            GenerationEvent::new(EVENT_STARTED, id)
                .with_user(created.user_id)
                .with_payload(json!({
                    "script_id": request.script_id,
                    "chapter_id": request.chapter_id,
                    "quality_tier": request.quality_tier,
                    "lip_sync": lip_sync,
                })),
        );

        self.dispatch_next(id, StepName::AudioGeneration).await?;
        Ok(id)
    }

    /// Restart a run from `from_step` (default: the step it failed at).
    ///
    /// A failed target step is resumed: only its failed and pending units
    /// run again. Any other target is regenerated from scratch together with
    /// every step after it. Returns the step that was dispatched.
    pub async fn retry(
        self: &Arc<Self>,
        id: DbId,
        from_step: Option<StepName>,
    ) -> Result<StepName, PipelineError> {
        let generation = load(self.store.as_ref(), id).await?;
        let outline = self.outline_for(&generation).await?;

        let (target, mode, epoch, user_id) = modify(self.store.as_ref(), id, |g| {
            let (target, mode) = plan_retry(g, from_step)?;
            let planned = plan_units(target, &outline);

            g.retry_count += 1;
            g.video_url = None;
            g.lipsync_failed = false;
            g.error_message = None;
            g.can_resume = false;

            if mode == DispatchMode::Fresh {
                for step in g.steps.iter_mut().filter(|s| s.name.index() > target.index()) {
                    step.reset();
                }
                g.units.retain(|u| u.key.step.index() <= target.index());
            }
            if let Some(step) = g.step_mut(target) {
                step.retry_count += 1;
            }

            let epoch = begin_step(g, target, mode, &planned)?;
            Ok(Some((target, mode, epoch, g.user_id)))
        })
        .await?
        .ok_or_else(|| CoreError::Internal(format!("Retry of generation {id} was not applied")))?;

        tracing::info!(generation_id = id, step = %target, ?mode, epoch, "Video generation retried");
        self.events.publish(
            GenerationEvent::new(EVENT_RETRIED, id)
                .with_step(target)
                .with_user(user_id)
                .with_payload(json!({ "resume": mode == DispatchMode::Resume })),
        );

        self.spawn_stage(id, target, epoch);
        Ok(target)
    }

    /// Fail or re-dispatch runs abandoned by a crashed or lost stage task.
    ///
    /// A run is abandoned when its active step has not been written for
    /// longer than that step's maximum duration. Returns the number of runs
    /// acted on.
    pub async fn recover_stale(self: &Arc<Self>, now: Timestamp) -> Result<usize, PipelineError> {
        let cutoff = now - to_chrono(self.config.shortest_stage_duration());
        let candidates = self.store.list_in_flight_before(cutoff).await?;

        let mut recovered = 0;
        for generation in candidates {
            let active = generation
                .steps
                .iter()
                .find(|s| s.status.is_active())
                .map(|s| s.name);

            let result = match active {
                Some(step) => {
                    let deadline =
                        generation.updated_at + to_chrono(self.config.stage_max_duration(step));
                    if deadline >= now {
                        continue;
                    }
                    self.fail_abandoned(&generation, step).await
                }
                None => self.resume_idle(&generation).await,
            };

            match result {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(generation_id = generation.id, error = %e, "Recovery failed");
                }
            }
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Stage lifecycle
    // -----------------------------------------------------------------------

    /// Start `step` if it is still pending, then spawn its worker.
    async fn dispatch_next(self: &Arc<Self>, id: DbId, step: StepName) -> Result<(), PipelineError> {
        let generation = load(self.store.as_ref(), id).await?;
        let outline = self.outline_for(&generation).await?;
        let planned = plan_units(step, &outline);

        let epoch = modify(self.store.as_ref(), id, |g| {
            if g.step(step).map(|s| s.status) != Some(StepStatus::Pending) {
                return Ok(None);
            }
            begin_step(g, step, DispatchMode::Fresh, &planned).map(Some)
        })
        .await?;

        if let Some(epoch) = epoch {
            self.spawn_stage(id, step, epoch);
        }
        Ok(())
    }

    fn spawn_stage(self: &Arc<Self>, id: DbId, step: StepName, epoch: u32) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_stage(id, step, epoch).await {
                tracing::error!(
                    generation_id = id,
                    %step,
                    error = %e,
                    "Stage task failed, leaving run for recovery",
                );
            }
        });
    }

    async fn run_stage(
        self: Arc<Self>,
        id: DbId,
        step: StepName,
        epoch: u32,
    ) -> Result<(), PipelineError> {
        let generation = load(self.store.as_ref(), id).await?;
        if !epoch_is_current(&generation, step, epoch) {
            return Ok(());
        }
        let outline = self.outline_for(&generation).await?;

        let jobs: Vec<UnitJob> = generation
            .units_for(step)
            .filter(|u| !u.is_completed())
            .map(|u| UnitJob {
                key: u.key,
                payload: build_payload(&u.key, &generation, &outline),
            })
            .collect();

        self.events.publish(
            GenerationEvent::new(EVENT_STAGE_STARTED, id)
                .with_step(step)
                .with_user(generation.user_id)
                .with_payload(json!({ "units": jobs.len(), "epoch": epoch })),
        );

        let run = StageRun {
            generation_id: id,
            step,
            epoch,
            tier: generation.quality_tier,
            max_duration: self.config.stage_max_duration(step),
            jobs,
        };
        match self.worker.run(run).await? {
            Some(report) => self.advance(id, report).await,
            None => {
                tracing::debug!(generation_id = id, %step, epoch, "Stage worker superseded");
                Ok(())
            }
        }
    }

    /// Apply a finished stage's report: advance, deliver, or fail the run.
    pub async fn advance(self: &Arc<Self>, id: DbId, report: StageReport) -> Result<(), PipelineError> {
        let StageReport {
            step,
            epoch,
            tally,
            outcome,
        } = report;

        match outcome {
            StageOutcome::Completed => {
                let applied = modify(self.store.as_ref(), id, |g| {
                    if !epoch_is_current(g, step, epoch) {
                        return Ok(None);
                    }
                    let next = g
                        .steps
                        .iter()
                        .map(|s| s.name)
                        .find(|name| name.index() > step.index());
                    let state = step_mut(g, step)?;
                    state.status = StepStatus::Completed;
                    state.progress = tally.progress_percent();
                    state.completed_at = Some(Utc::now());
                    state.error_message = None;
                    state.error_kind = None;
                    Ok(Some((next, g.user_id)))
                })
                .await?;
                let Some((next, user_id)) = applied else {
                    return Ok(());
                };

                tracing::info!(
                    generation_id = id,
                    %step,
                    completed = tally.completed,
                    total = tally.total,
                    "Stage completed",
                );
                self.events.publish(
                    GenerationEvent::new(EVENT_STAGE_COMPLETED, id)
                        .with_step(step)
                        .with_user(user_id)
                        .with_payload(json!({
                            "completed_units": tally.completed,
                            "total_units": tally.total,
                            "success_rate": tally.success_rate(),
                        })),
                );

                match next {
                    Some(next) => self.dispatch_next(id, next).await,
                    None => self.finalize(id).await.map(|_| ()),
                }
            }
            StageOutcome::Failed { failure, class } => {
                let optional = step == StepName::LipSync;
                let message = stage_error_message(step.label(), failure.kind);
                let can_resume = class == ErrorClass::Transient;

                let applied = modify(self.store.as_ref(), id, |g| {
                    if !epoch_is_current(g, step, epoch) {
                        return Ok(None);
                    }
                    fail_step(g, step, &failure, &message)?;
                    if optional {
                        g.lipsync_failed = true;
                    } else {
                        g.error_message = Some(message.clone());
                        g.can_resume = can_resume;
                    }
                    Ok(Some(g.user_id))
                })
                .await?;
                let Some(user_id) = applied else {
                    return Ok(());
                };

                self.events.publish(
                    GenerationEvent::new(EVENT_STAGE_FAILED, id)
                        .with_step(step)
                        .with_user(user_id)
                        .with_payload(json!({
                            "error_kind": failure.kind,
                            "completed_units": tally.completed,
                            "total_units": tally.total,
                        })),
                );

                if optional {
                    tracing::warn!(
                        generation_id = id,
                        error_kind = %failure.kind,
                        detail = %failure.detail,
                        "Lip-sync failed, delivering merged video",
                    );
                    return self.finalize(id).await.map(|_| ());
                }

                tracing::error!(
                    generation_id = id,
                    %step,
                    error_kind = %failure.kind,
                    provider = failure.provider.as_deref().unwrap_or("-"),
                    detail = %failure.detail,
                    can_resume,
                    "Stage failed",
                );
                self.events.publish(
                    GenerationEvent::new(EVENT_FAILED, id)
                        .with_step(step)
                        .with_user(user_id)
                        .with_payload(json!({
                            "error_kind": failure.kind,
                            "can_resume": can_resume,
                        })),
                );
                Ok(())
            }
        }
    }

    /// Publish the final video once every required step has completed.
    ///
    /// The lip-synced video wins when lip-sync succeeded; otherwise the
    /// merged video is delivered. Returns whether this call delivered.
    async fn finalize(&self, id: DbId) -> Result<bool, PipelineError> {
        let delivered = modify(self.store.as_ref(), id, |g| {
            let finished = g.steps.iter().all(|s| {
                s.status == StepStatus::Completed
                    || (s.name == StepName::LipSync && s.status == StepStatus::Failed)
            });
            if g.video_url.is_some() || !finished {
                return Ok(None);
            }

            let lip_sync_done = g
                .step(StepName::LipSync)
                .is_some_and(|s| s.status == StepStatus::Completed);
            let url = lip_sync_done
                .then(|| g.output_of(&whole(StepName::LipSync)))
                .flatten()
                .or_else(|| g.output_of(&whole(StepName::AudioVideoMerge)))
                .map(str::to_string)
                .ok_or_else(|| {
                    CoreError::Internal(format!("Generation {id} finished without a merged video"))
                })?;

            g.lipsync_failed = g
                .step(StepName::LipSync)
                .is_some_and(|s| s.status == StepStatus::Failed);
            g.video_url = Some(url.clone());
            g.error_message = None;
            g.can_resume = false;
            Ok(Some((url, g.lipsync_failed, g.user_id)))
        })
        .await?;

        let Some((video_url, lipsync_failed, user_id)) = delivered else {
            return Ok(false);
        };
        tracing::info!(generation_id = id, %video_url, lipsync_failed, "Video generation completed");
        self.events.publish(
            GenerationEvent::new(EVENT_COMPLETED, id)
                .with_user(user_id)
                .with_payload(json!({
                    "video_url": video_url,
                    "lipsync_failed": lipsync_failed,
                })),
        );
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Time out the active step of a run nobody has written to since
    /// `generation.version`.
    async fn fail_abandoned(
        self: &Arc<Self>,
        generation: &VideoGeneration,
        step: StepName,
    ) -> Result<bool, PipelineError> {
        let id = generation.id;
        let version = generation.version;
        let failure = UnitFailure::new(ErrorKind::Timeout, "stage abandoned past its maximum duration");
        let message = stage_error_message(step.label(), failure.kind);
        let optional = step == StepName::LipSync;

        let applied = modify(self.store.as_ref(), id, |g| {
            if g.version != version {
                return Ok(None);
            }
            for unit in g.units.iter_mut().filter(|u| u.key.step == step && !u.is_completed()) {
                let attempts = unit.attempts;
                unit.fail(&failure, attempts);
            }
            fail_step(g, step, &failure, &message)?;
            if optional {
                g.lipsync_failed = true;
            } else {
                g.error_message = Some(message.clone());
                g.can_resume = true;
            }
            Ok(Some(g.user_id))
        })
        .await?;
        let Some(user_id) = applied else {
            return Ok(false);
        };

        tracing::warn!(generation_id = id, %step, "Recovered abandoned stage as timed out");
        if optional {
            self.finalize(id).await?;
        } else {
            self.events.publish(
                GenerationEvent::new(EVENT_FAILED, id)
                    .with_step(step)
                    .with_user(user_id)
                    .with_payload(json!({ "error_kind": failure.kind, "can_resume": true })),
            );
        }
        Ok(true)
    }

    /// Continue a run that stopped between two steps.
    async fn resume_idle(self: &Arc<Self>, generation: &VideoGeneration) -> Result<bool, PipelineError> {
        let next_pending = generation
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Pending)
            .map(|s| s.name);

        match next_pending {
            Some(step) => {
                tracing::warn!(generation_id = generation.id, %step, "Re-dispatching idle run");
                self.dispatch_next(generation.id, step).await?;
                Ok(true)
            }
            None => self.finalize(generation.id).await,
        }
    }

    async fn outline_for(&self, generation: &VideoGeneration) -> Result<ScriptOutline, PipelineError> {
        let outline = self
            .scripts
            .load_outline(generation.script_id, generation.chapter_id)
            .await?;
        Ok(outline.unwrap_or_else(|| ScriptOutline {
            script_id: generation.script_id,
            chapter_id: generation.chapter_id,
            scenes: Vec::new(),
            characters: Vec::new(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Pure transition helpers
// ---------------------------------------------------------------------------

/// Decide the target step and mode of a retry, rejecting invalid requests.
fn plan_retry(
    generation: &VideoGeneration,
    from_step: Option<StepName>,
) -> Result<(StepName, DispatchMode), PipelineError> {
    let id = generation.id;
    if let Some(active) = generation.steps.iter().find(|s| s.status.is_active()) {
        return Err(CoreError::Conflict(format!(
            "Video generation {id} is still running step '{}'",
            active.name
        ))
        .into());
    }

    let target = match from_step {
        Some(step) => step,
        None => generation
            .failed_at_step()
            .or_else(|| {
                generation
                    .step(StepName::LipSync)
                    .filter(|s| s.status == StepStatus::Failed)
                    .map(|s| s.name)
            })
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Video generation {id} has no failed step; specify from_step"
                ))
            })?,
    };

    let state = generation.step(target).ok_or_else(|| {
        CoreError::Validation(format!(
            "Step '{target}' is not part of video generation {id}"
        ))
    })?;

    if let Some(blocker) = generation
        .steps
        .iter()
        .take_while(|s| s.name != target)
        .find(|s| s.status != StepStatus::Completed)
    {
        return Err(CoreError::Validation(format!(
            "Cannot retry from '{target}': preceding step '{}' is {}",
            blocker.name, blocker.status
        ))
        .into());
    }

    let mode = if state.status == StepStatus::Failed {
        DispatchMode::Resume
    } else {
        DispatchMode::Fresh
    };
    Ok((target, mode))
}

/// Mark `step` as running and prepare its units. Returns the step's epoch.
fn begin_step(
    generation: &mut VideoGeneration,
    step: StepName,
    mode: DispatchMode,
    planned: &[GenerationUnit],
) -> Result<u32, PipelineError> {
    let has_units = generation.units.iter().any(|u| u.key.step == step);
    match mode {
        DispatchMode::Fresh => {
            generation.units.retain(|u| u.key.step != step);
            generation.units.extend(planned.iter().cloned());
        }
        DispatchMode::Resume if !has_units => {
            generation.units.extend(planned.iter().cloned());
        }
        DispatchMode::Resume => {
            for unit in generation
                .units
                .iter_mut()
                .filter(|u| u.key.step == step && !u.is_completed())
            {
                unit.requeue();
            }
        }
    }

    let progress = StageTally::from_units(generation.units_for(step)).progress_percent();
    let state = step_mut(generation, step)?;
    state.status = match mode {
        DispatchMode::Fresh => StepStatus::Processing,
        DispatchMode::Resume => StepStatus::Retrying,
    };
    state.progress = progress;
    state.started_at = Some(Utc::now());
    state.completed_at = None;
    state.error_message = None;
    state.error_kind = None;
    let epoch = state.retry_count;

    generation.error_message = None;
    generation.can_resume = false;
    validate_step_sequence(&generation.steps)?;
    Ok(epoch)
}

fn fail_step(
    generation: &mut VideoGeneration,
    step: StepName,
    failure: &UnitFailure,
    message: &str,
) -> Result<(), PipelineError> {
    let progress = StageTally::from_units(generation.units_for(step)).progress_percent();
    let state = step_mut(generation, step)?;
    state.status = StepStatus::Failed;
    state.progress = progress;
    state.error_message = Some(message.to_string());
    state.error_kind = Some(failure.kind);
    Ok(())
}

fn step_mut(
    generation: &mut VideoGeneration,
    step: StepName,
) -> Result<&mut vidgen_core::steps::PipelineStep, PipelineError> {
    let id = generation.id;
    generation.step_mut(step).ok_or_else(|| {
        CoreError::Validation(format!("Step '{step}' is not part of video generation {id}")).into()
    })
}

fn whole(step: StepName) -> UnitKey {
    UnitKey::new(step, UnitSubject::Whole)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
