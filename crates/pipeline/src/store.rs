//! Status Store: durable record of every run.
//!
//! All writes after creation are compare-and-swap on the run's `version`.
//! [`modify`] wraps the read-modify-write cycle. Writers in one process queue
//! on a per-run lock; conflicts with other processes are re-applied after a
//! jittered backoff, so concurrent unit completions never lose updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sqlx::PgPool;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use vidgen_core::error::CoreError;
use vidgen_core::steps::{initial_steps, GenerationStatus};
use vidgen_core::types::{DbId, Timestamp};
use vidgen_db::models::video_generation::{NewVideoGeneration, VideoGeneration};
use vidgen_db::repositories::VideoGenerationRepo;

use crate::error::PipelineError;

/// Read-modify-write attempts before [`modify`] gives up with a conflict.
const MAX_CAS_ATTEMPTS: u32 = 64;

/// First pause after a lost race; doubles up to [`CAS_BACKOFF_MAX`].
const CAS_BACKOFF_BASE: Duration = Duration::from_millis(2);
const CAS_BACKOFF_MAX: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Video generation {0} not found")]
    NotFound(DbId),

    #[error("Video generation {0} kept changing under concurrent writes")]
    Conflict(DbId),
}

/// Persistence seam for pipeline runs.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert a new pending run.
    async fn create(&self, input: &NewVideoGeneration) -> Result<VideoGeneration, StoreError>;

    async fn find(&self, id: DbId) -> Result<Option<VideoGeneration>, StoreError>;

    /// Write `generation` if the stored version still equals
    /// `generation.version`. Returns the saved row, or `None` on a lost race.
    async fn compare_and_swap(
        &self,
        generation: &VideoGeneration,
    ) -> Result<Option<VideoGeneration>, StoreError>;

    /// Non-terminal runs that have not been written since `cutoff`.
    async fn list_in_flight_before(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<VideoGeneration>, StoreError>;

    /// Verify the backing storage is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Per-run write locks shared by every writer in this process.
    ///
    /// Stores without one rely on the version check and backoff alone.
    fn run_locks(&self) -> Option<&RunLocks> {
        None
    }
}

/// One async mutex per run, created on demand.
///
/// Entries nobody holds are dropped on the next acquire.
#[derive(Default)]
pub struct RunLocks {
    locks: std::sync::Mutex<HashMap<DbId, Arc<Mutex<()>>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to run `id`.
    pub async fn acquire(&self, id: DbId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Load a run or fail with a `NotFound` domain error.
pub async fn load(store: &dyn StatusStore, id: DbId) -> Result<VideoGeneration, PipelineError> {
    store.find(id).await?.ok_or_else(|| {
        PipelineError::Core(CoreError::NotFound {
            entity: "VideoGeneration",
            id,
        })
    })
}

/// Atomically apply `change` to a run.
///
/// `change` may run several times; it must derive everything from the
/// generation it is handed. Returning `Ok(None)` skips the write. The overall
/// status is re-derived from the steps before every write.
pub async fn modify<T, F>(
    store: &dyn StatusStore,
    id: DbId,
    mut change: F,
) -> Result<Option<T>, PipelineError>
where
    F: FnMut(&mut VideoGeneration) -> Result<Option<T>, PipelineError> + Send,
    T: Send,
{
    let _guard = match store.run_locks() {
        Some(locks) => Some(locks.acquire(id).await),
        None => None,
    };

    let mut backoff = CAS_BACKOFF_BASE;
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let mut generation = load(store, id).await?;
        let Some(value) = change(&mut generation)? else {
            return Ok(None);
        };
        generation.refresh_status();

        if store.compare_and_swap(&generation).await?.is_some() {
            return Ok(Some(value));
        }
        if attempt == MAX_CAS_ATTEMPTS {
            break;
        }
        tracing::warn!(generation_id = id, attempt, "Optimistic lock conflict, retrying write");
        tokio::time::sleep(jittered(backoff)).await;
        backoff = (backoff * 2).min(CAS_BACKOFF_MAX);
    }

    tracing::error!(generation_id = id, "Giving up after repeated write conflicts");
    Err(StoreError::Conflict(id).into())
}

/// `base` scaled by a random factor in `[0.5, 1.5)`.
fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::rng().random_range(0.5..1.5))
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// Status store backed by the `video_generations` table.
#[derive(Clone)]
pub struct PgStatusStore {
    pool: PgPool,
    locks: Arc<RunLocks>,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            locks: Arc::new(RunLocks::new()),
        }
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn create(&self, input: &NewVideoGeneration) -> Result<VideoGeneration, StoreError> {
        Ok(VideoGenerationRepo::create(&self.pool, input).await?)
    }

    async fn find(&self, id: DbId) -> Result<Option<VideoGeneration>, StoreError> {
        Ok(VideoGenerationRepo::find_by_id(&self.pool, id).await?)
    }

    async fn compare_and_swap(
        &self,
        generation: &VideoGeneration,
    ) -> Result<Option<VideoGeneration>, StoreError> {
        Ok(VideoGenerationRepo::update_versioned(&self.pool, generation).await?)
    }

    async fn list_in_flight_before(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<VideoGeneration>, StoreError> {
        Ok(VideoGenerationRepo::list_in_flight_before(&self.pool, cutoff).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(vidgen_db::health_check(&self.pool).await?)
    }

    fn run_locks(&self) -> Option<&RunLocks> {
        Some(&self.locks)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local status store with the same versioning semantics as
/// [`PgStatusStore`]. Used by tests and database-less deployments.
#[derive(Default)]
pub struct MemoryStatusStore {
    runs: RwLock<HashMap<DbId, VideoGeneration>>,
    next_id: AtomicI64,
    locks: RunLocks,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn create(&self, input: &NewVideoGeneration) -> Result<VideoGeneration, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let generation = VideoGeneration {
            id,
            script_id: input.script_id,
            chapter_id: input.chapter_id,
            user_id: input.user_id,
            quality_tier: input.quality_tier,
            status: GenerationStatus::Pending,
            lip_sync_enabled: input.lip_sync_enabled,
            video_url: None,
            error_message: None,
            can_resume: false,
            lipsync_failed: false,
            retry_count: 0,
            steps: initial_steps(input.lip_sync_enabled),
            units: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.runs.write().await.insert(id, generation.clone());
        Ok(generation)
    }

    async fn find(&self, id: DbId) -> Result<Option<VideoGeneration>, StoreError> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn compare_and_swap(
        &self,
        generation: &VideoGeneration,
    ) -> Result<Option<VideoGeneration>, StoreError> {
        let mut runs = self.runs.write().await;
        let stored = runs
            .get_mut(&generation.id)
            .ok_or(StoreError::NotFound(generation.id))?;
        if stored.version != generation.version {
            return Ok(None);
        }

        let mut saved = generation.clone();
        saved.version += 1;
        saved.updated_at = Utc::now();
        *stored = saved.clone();
        Ok(Some(saved))
    }

    async fn list_in_flight_before(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<VideoGeneration>, StoreError> {
        let mut stale: Vec<_> = self
            .runs
            .read()
            .await
            .values()
            .filter(|g| !g.status.is_terminal() && g.updated_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|g| g.updated_at);
        Ok(stale)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn run_locks(&self) -> Option<&RunLocks> {
        Some(&self.locks)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
