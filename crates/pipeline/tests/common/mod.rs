//! Shared test harness for pipeline integration tests.
//!
//! Runs the real coordinator over the in-memory status store, a static
//! script and a scripted provider invoker.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vidgen_core::failure::ProviderError;
use vidgen_core::providers::QualityTier;
use vidgen_core::snapshot::StatusSnapshot;
use vidgen_core::types::{DbId, Timestamp};
use vidgen_db::models::script::{ScriptCharacter, ScriptOutline, ScriptScene};
use vidgen_db::models::video_generation::{NewVideoGeneration, VideoGeneration};
use vidgen_events::EventBus;
use vidgen_pipeline::{
    MemoryStatusStore, PipelineConfig, PipelineCoordinator, ProviderInvoker, ProviderSelector,
    RunLocks, StartRequest, StaticScriptSource, StatusGateway, StatusStore, StoreError,
};

pub const SCRIPT_ID: DbId = 1;
pub const CHAPTER_ID: DbId = 1;

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// Canned reply for calls matching a rule.
#[derive(Clone)]
pub enum Reply {
    Fail(ProviderError),
    /// Never answers.
    Hang,
}

struct Rule {
    provider: Option<&'static str>,
    unit_prefix: &'static str,
    reply: Reply,
}

/// Provider invoker whose failures are scripted per provider and unit.
///
/// Calls matching no rule succeed with output `"{provider}://{unit}"`.
/// Once [`FakeInvoker::heal`] is called every call succeeds.
#[derive(Default)]
pub struct FakeInvoker {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, String)>>,
    healed: AtomicBool,
}

impl FakeInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reply with `reply` to calls to `provider` (any provider when `None`)
    /// for units whose key starts with `unit_prefix`.
    pub fn on(&self, provider: Option<&'static str>, unit_prefix: &'static str, reply: Reply) {
        self.rules.lock().unwrap().push(Rule {
            provider,
            unit_prefix,
            reply,
        });
    }

    pub fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }

    /// Calls made for units whose key starts with `unit_prefix`, as providers.
    pub fn calls_for(&self, unit_prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, unit)| unit.starts_with(unit_prefix))
            .map(|(provider, _)| provider.clone())
            .collect()
    }

    fn reply_for(&self, provider: &str, unit: &str) -> Option<Reply> {
        if self.healed.load(Ordering::SeqCst) {
            return None;
        }
        self.rules
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.provider.map_or(true, |p| p == provider) && unit.starts_with(r.unit_prefix))
            .map(|r| r.reply.clone())
    }
}

#[async_trait]
impl ProviderInvoker for FakeInvoker {
    async fn invoke(
        &self,
        provider_id: &str,
        payload: &serde_json::Value,
    ) -> Result<String, ProviderError> {
        let unit = payload["unit"].as_str().unwrap_or_default().to_string();
        self.calls
            .lock()
            .unwrap()
            .push((provider_id.to_string(), unit.clone()));

        match self.reply_for(provider_id, &unit) {
            None => Ok(format!("{provider_id}://{unit}")),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::new("hung call resumed"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Slow store
// ---------------------------------------------------------------------------

/// In-memory store whose reads and writes each take `lag`, like a database
/// round-trip.
pub struct SlowStore {
    inner: MemoryStatusStore,
    lag: Duration,
    /// Hand out the inner store's run locks.
    share_locks: bool,
}

impl SlowStore {
    pub fn new(lag: Duration, share_locks: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStatusStore::new(),
            lag,
            share_locks,
        })
    }
}

#[async_trait]
impl StatusStore for SlowStore {
    async fn create(&self, input: &NewVideoGeneration) -> Result<VideoGeneration, StoreError> {
        self.inner.create(input).await
    }

    async fn find(&self, id: DbId) -> Result<Option<VideoGeneration>, StoreError> {
        tokio::time::sleep(self.lag).await;
        self.inner.find(id).await
    }

    async fn compare_and_swap(
        &self,
        generation: &VideoGeneration,
    ) -> Result<Option<VideoGeneration>, StoreError> {
        tokio::time::sleep(self.lag).await;
        self.inner.compare_and_swap(generation).await
    }

    async fn list_in_flight_before(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<VideoGeneration>, StoreError> {
        self.inner.list_in_flight_before(cutoff).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn run_locks(&self) -> Option<&RunLocks> {
        if self.share_locks {
            self.inner.run_locks()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Script fixtures
// ---------------------------------------------------------------------------

pub fn outline(scenes: usize, characters: usize) -> ScriptOutline {
    ScriptOutline {
        script_id: SCRIPT_ID,
        chapter_id: CHAPTER_ID,
        scenes: (0..scenes)
            .map(|i| ScriptScene {
                id: i as DbId + 1,
                script_id: SCRIPT_ID,
                chapter_id: CHAPTER_ID,
                position: i as i32,
                visual_description: format!("Scene {i} at the harbour"),
                narration: format!("Narration for scene {i}"),
                dialogue: None,
                speaker_position: None,
                duration_secs: Some(4.0),
            })
            .collect(),
        characters: (0..characters)
            .map(|i| ScriptCharacter {
                id: i as DbId + 1,
                script_id: SCRIPT_ID,
                position: i as i32,
                name: format!("Character {i}"),
                description: "a sailor".to_string(),
                voice: None,
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub coordinator: Arc<PipelineCoordinator>,
    pub gateway: StatusGateway,
    pub invoker: Arc<FakeInvoker>,
}

/// Config with short budgets suitable for tests.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        provider_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn harness(outline: ScriptOutline, invoker: Arc<FakeInvoker>, config: PipelineConfig) -> Harness {
    harness_with_store(outline, invoker, config, Arc::new(MemoryStatusStore::new()))
}

pub fn harness_with_store(
    outline: ScriptOutline,
    invoker: Arc<FakeInvoker>,
    config: PipelineConfig,
    store: Arc<dyn StatusStore>,
) -> Harness {
    let scripts = Arc::new(StaticScriptSource::new().with_outline(outline));
    let coordinator = PipelineCoordinator::new(
        store.clone(),
        scripts,
        invoker.clone(),
        ProviderSelector::new(),
        Arc::new(EventBus::default()),
        config,
    );
    Harness {
        coordinator,
        gateway: StatusGateway::new(store),
        invoker,
    }
}

pub fn request(tier: QualityTier, lip_sync: bool) -> StartRequest {
    StartRequest {
        script_id: SCRIPT_ID,
        chapter_id: CHAPTER_ID,
        quality_tier: tier,
        user_id: Some(42),
        lip_sync,
    }
}

/// Poll until the run is terminal. Returns the final snapshot and every
/// overall percentage observed on the way.
pub async fn wait_terminal(gateway: &StatusGateway, id: DbId) -> (StatusSnapshot, Vec<u8>) {
    let mut seen = Vec::new();
    let poll = async {
        loop {
            let snap = gateway.get_status(id).await.expect("status");
            seen.push(snap.progress.percentage);
            if snap.is_terminal() {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    let snap = tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("run did not reach a terminal status");
    (snap, seen)
}
