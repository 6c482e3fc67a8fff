//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`GenerationEvent`]s.
//! It is designed to be shared via `Arc<EventBus>` across the application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use vidgen_core::steps::StepName;
use vidgen_core::types::DbId;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A run was created and its first stage dispatched.
pub const EVENT_STARTED: &str = "video_generation.started";
/// A stage worker began processing its units.
pub const EVENT_STAGE_STARTED: &str = "video_generation.stage_started";
/// A stage finished with enough successful units.
pub const EVENT_STAGE_COMPLETED: &str = "video_generation.stage_completed";
/// A stage finished without enough successful units.
pub const EVENT_STAGE_FAILED: &str = "video_generation.stage_failed";
/// The run delivered its video.
pub const EVENT_COMPLETED: &str = "video_generation.completed";
/// The run stopped at a failed stage.
pub const EVENT_FAILED: &str = "video_generation.failed";
/// A failed or finished run was restarted from a step.
pub const EVENT_RETRIED: &str = "video_generation.retried";

// ---------------------------------------------------------------------------
// GenerationEvent
// ---------------------------------------------------------------------------

/// A lifecycle event of one video generation run.
///
/// Constructed via [`GenerationEvent::new`] and enriched with
/// [`with_step`](GenerationEvent::with_step),
/// [`with_user`](GenerationEvent::with_user) and
/// [`with_payload`](GenerationEvent::with_payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationEvent {
    /// One of the `EVENT_*` constants.
    pub event_type: String,

    pub generation_id: DbId,

    /// Stage the event concerns, for stage-level events.
    pub step: Option<StepName>,

    /// Owner of the run, when known.
    pub user_id: Option<DbId>,

    /// Free-form JSON payload carrying event-specific data.
    pub payload: serde_json::Value,

    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl GenerationEvent {
    pub fn new(event_type: impl Into<String>, generation_id: DbId) -> Self {
        Self {
            event_type: event_type.into(),
            generation_id,
            step: None,
            user_id: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: StepName) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_user(mut self, user_id: Option<DbId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use vidgen_events::bus::{EventBus, GenerationEvent, EVENT_STARTED};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(GenerationEvent::new(EVENT_STARTED, 1));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<GenerationEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest un-consumed events are dropped and
    /// slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers. Dropped if there are none.
    pub fn publish(&self, event: GenerationEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Mirror every event into the tracing log until the bus is dropped.
pub async fn log_events(mut rx: broadcast::Receiver<GenerationEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                tracing::info!(
                    event_type = %event.event_type,
                    generation_id = event.generation_id,
                    step = event.step.map(|s| s.as_str()),
                    payload = %event.payload,
                    "Generation event",
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event log subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let event = GenerationEvent::new(EVENT_STAGE_COMPLETED, 42)
            .with_step(StepName::ImageGeneration)
            .with_user(Some(7))
            .with_payload(serde_json::json!({"success_rate": 0.5}));

        bus.publish(event);

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.event_type, EVENT_STAGE_COMPLETED);
        assert_eq!(received.generation_id, 42);
        assert_eq!(received.step, Some(StepName::ImageGeneration));
        assert_eq!(received.user_id, Some(7));
        assert_eq!(received.payload["success_rate"], 0.5);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(GenerationEvent::new(EVENT_STARTED, 1));

        assert_eq!(rx1.recv().await.unwrap().event_type, EVENT_STARTED);
        assert_eq!(rx2.recv().await.unwrap().event_type, EVENT_STARTED);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(GenerationEvent::new(EVENT_FAILED, 3));
    }

    #[tokio::test]
    async fn log_events_stops_when_bus_dropped() {
        let bus = EventBus::default();
        let handle = tokio::spawn(log_events(bus.subscribe()));
        bus.publish(GenerationEvent::new(EVENT_COMPLETED, 5));
        drop(bus);
        handle.await.expect("logger task should exit cleanly");
    }
}
