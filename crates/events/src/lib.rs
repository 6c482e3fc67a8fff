//! In-process event bus for video generation lifecycle events.
//!
//! - [`EventBus`]: publish/subscribe hub backed by `tokio::sync::broadcast`.
//! - [`GenerationEvent`]: the event envelope published by the coordinator.
//! - [`log_events`]: subscriber that mirrors every event into the tracing log.

pub mod bus;

pub use bus::{log_events, EventBus, GenerationEvent};
