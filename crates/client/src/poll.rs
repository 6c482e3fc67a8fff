//! Status polling with exponential backoff.
//!
//! Successful reads are spaced by the `poll_interval_ms` the server puts in
//! each snapshot. Transient read errors are retried with exponential
//! backoff and never reach the caller unless they exhaust the attempt
//! ceiling. Dropping or cancelling the poll never cancels the run itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vidgen_core::snapshot::StatusSnapshot;
use vidgen_core::types::DbId;

/// Tunable parameters for the poll loop.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay after the first failed read.
    pub initial_delay: Duration,
    /// Upper bound on the delay between failed reads.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Consecutive failed reads tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 24,
        }
    }
}

/// Calculate the next backoff delay, clamped to [`PollConfig::max_delay`].
pub fn next_delay(current: Duration, config: &PollConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Network failure or 5xx; worth retrying.
    #[error("Status read failed: {0}")]
    Transient(String),

    #[error("Video generation {0} not found")]
    NotFound(DbId),

    /// The server refused the request for a reason retrying will not fix.
    #[error("Status request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Gave up after {0} consecutive failed status reads")]
    RetriesExhausted(u32),
}

impl PollError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PollError::Transient(_))
    }
}

/// Where snapshots come from: the HTTP API in production, fakes in tests.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, id: DbId) -> Result<StatusSnapshot, PollError>;
}

struct PollState {
    source: Arc<dyn StatusSource>,
    id: DbId,
    config: PollConfig,
    cancel: CancellationToken,
    wait: Duration,
    backoff: Duration,
    failures: u32,
    done: bool,
}

/// Poll a run until it is terminal, `cancel` fires, or reads keep failing.
///
/// The first read happens immediately. The stream yields every snapshot,
/// ends after the first terminal one, and yields at most one error: either
/// a non-transient read error or [`PollError::RetriesExhausted`].
pub fn poll_status(
    source: Arc<dyn StatusSource>,
    id: DbId,
    config: PollConfig,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<StatusSnapshot, PollError>> + Send {
    let state = PollState {
        source,
        id,
        backoff: config.initial_delay,
        config,
        cancel,
        wait: Duration::ZERO,
        failures: 0,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            if !st.wait.is_zero() {
                tokio::select! {
                    _ = st.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(st.wait) => {}
                }
            }

            let result = tokio::select! {
                _ = st.cancel.cancelled() => return None,
                result = st.source.fetch(st.id) => result,
            };

            match result {
                Ok(snapshot) => {
                    st.failures = 0;
                    st.backoff = st.config.initial_delay;
                    st.wait = Duration::from_millis(snapshot.poll_interval_ms);
                    st.done = snapshot.is_terminal() || snapshot.poll_interval_ms == 0;
                    return Some((Ok(snapshot), st));
                }
                Err(e) if e.is_transient() => {
                    st.failures += 1;
                    if st.failures >= st.config.max_attempts {
                        tracing::error!(
                            generation_id = st.id,
                            attempts = st.failures,
                            error = %e,
                            "Giving up on status polling",
                        );
                        st.done = true;
                        return Some((Err(PollError::RetriesExhausted(st.failures)), st));
                    }
                    tracing::warn!(
                        generation_id = st.id,
                        attempt = st.failures,
                        delay_ms = st.backoff.as_millis() as u64,
                        error = %e,
                        "Status read failed, backing off",
                    );
                    st.wait = st.backoff;
                    st.backoff = next_delay(st.backoff, &st.config);
                }
                Err(e) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
            }
        }
    })
}

/// One run's poll loop running as its own task.
///
/// Cancelled when [`PollHandle::cancel`] is called or the handle is dropped.
pub struct PollHandle {
    cancel: CancellationToken,
    updates: mpsc::Receiver<Result<StatusSnapshot, PollError>>,
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn spawn(source: Arc<dyn StatusSource>, id: DbId, config: PollConfig) -> Self {
        let cancel = CancellationToken::new();
        let (tx, updates) = mpsc::channel(16);
        let stream = poll_status(source, id, config, cancel.clone());

        let task = tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(update) = stream.next().await {
                if tx.send(update).await.is_err() {
                    break;
                }
            }
        });

        Self {
            cancel,
            updates,
            task,
        }
    }

    /// Next update, or `None` once polling has ended.
    pub async fn next(&mut self) -> Option<Result<StatusSnapshot, PollError>> {
        self.updates.recv().await
    }

    /// Stop polling. The run itself keeps going on the server.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use chrono::Utc;
    use vidgen_core::progress::PipelineProgress;
    use vidgen_core::steps::GenerationStatus;

    use super::*;

    fn snapshot(status: GenerationStatus, poll_interval_ms: u64) -> StatusSnapshot {
        StatusSnapshot {
            generation_id: 1,
            status,
            steps: Vec::new(),
            progress: PipelineProgress {
                completed_steps: 0,
                failed_steps: 0,
                total_steps: 5,
                percentage: 0,
                current_step: None,
                next_step: None,
            },
            can_resume: false,
            retry_count: 0,
            video_url: None,
            lipsync_failed: false,
            failed_at_step: None,
            error_message: None,
            error_hint: None,
            poll_interval_ms,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Replays canned responses, then keeps returning the last one.
    struct Replay {
        responses: Mutex<VecDeque<Result<StatusSnapshot, PollError>>>,
        fetches: Mutex<u32>,
    }

    impl Replay {
        fn new(responses: Vec<Result<StatusSnapshot, PollError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                fetches: Mutex::new(0),
            })
        }

        fn fetches(&self) -> u32 {
            *self.fetches.lock().unwrap()
        }
    }

    #[async_trait]
    impl StatusSource for Replay {
        async fn fetch(&self, _id: DbId) -> Result<StatusSnapshot, PollError> {
            *self.fetches.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            match responses.pop_front() {
                Some(response) => response,
                None => Err(PollError::Transient("connection reset".into())),
            }
        }
    }

    fn fast() -> PollConfig {
        PollConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }

    async fn collect(
        source: Arc<Replay>,
        config: PollConfig,
    ) -> Vec<Result<StatusSnapshot, PollError>> {
        poll_status(source, 1, config, CancellationToken::new())
            .collect()
            .await
    }

    // -- Backoff --

    #[test]
    fn next_delay_doubles_and_clamps() {
        let config = PollConfig::default();
        assert_eq!(next_delay(Duration::from_secs(1), &config), Duration::from_secs(2));
        assert_eq!(next_delay(Duration::from_secs(20), &config), Duration::from_secs(30));
    }

    // -- Stream --

    #[tokio::test]
    async fn ends_after_terminal_snapshot() {
        let source = Replay::new(vec![
            Ok(snapshot(GenerationStatus::GeneratingAudio, 1)),
            Ok(snapshot(GenerationStatus::GeneratingImages, 1)),
            Ok(snapshot(GenerationStatus::Completed, 0)),
            Ok(snapshot(GenerationStatus::Completed, 0)),
        ]);
        let updates = collect(source.clone(), fast()).await;

        assert_eq!(updates.len(), 3);
        assert_matches!(&updates[2], Ok(s) if s.status == GenerationStatus::Completed);
        assert_eq!(source.fetches(), 3);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_silently() {
        let source = Replay::new(vec![
            Err(PollError::Transient("503".into())),
            Err(PollError::Transient("503".into())),
            Ok(snapshot(GenerationStatus::Failed, 0)),
        ]);
        let updates = collect(source.clone(), fast()).await;

        assert_eq!(updates.len(), 1);
        assert_matches!(&updates[0], Ok(s) if s.status == GenerationStatus::Failed);
        assert_eq!(source.fetches(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_ceiling() {
        let source = Replay::new(Vec::new());
        let updates = collect(source.clone(), fast()).await;

        assert_eq!(updates.len(), 1);
        assert_matches!(updates[0], Err(PollError::RetriesExhausted(5)));
        assert_eq!(source.fetches(), 5);
    }

    #[tokio::test]
    async fn not_found_ends_immediately() {
        let source = Replay::new(vec![Err(PollError::NotFound(1))]);
        let updates = collect(source.clone(), fast()).await;

        assert_eq!(updates.len(), 1);
        assert_matches!(updates[0], Err(PollError::NotFound(1)));
    }

    #[tokio::test]
    async fn cancelled_poll_yields_nothing() {
        let source = Replay::new(vec![Ok(snapshot(GenerationStatus::Pending, 1))]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let updates: Vec<_> = poll_status(source.clone(), 1, fast(), cancel).collect().await;

        assert!(updates.is_empty());
        assert_eq!(source.fetches(), 0);
    }

    // -- Handle --

    #[tokio::test]
    async fn handle_forwards_updates_until_terminal() {
        let source = Replay::new(vec![
            Ok(snapshot(GenerationStatus::MergingAudio, 1)),
            Ok(snapshot(GenerationStatus::Completed, 0)),
        ]);
        let mut handle = PollHandle::spawn(source, 1, fast());

        assert_matches!(handle.next().await, Some(Ok(s)) if s.status == GenerationStatus::MergingAudio);
        assert_matches!(handle.next().await, Some(Ok(s)) if s.status == GenerationStatus::Completed);
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_handle_stops_polling() {
        let source = Replay::new(vec![
            Ok(snapshot(GenerationStatus::GeneratingVideo, 60_000)),
            Ok(snapshot(GenerationStatus::Completed, 0)),
        ]);
        let mut handle = PollHandle::spawn(source.clone(), 1, fast());

        assert_matches!(handle.next().await, Some(Ok(_)));
        handle.cancel();
        assert!(handle.next().await.is_none());
        assert_eq!(source.fetches(), 1);
    }
}
