use std::sync::Arc;

use vidgen_events::EventBus;
use vidgen_pipeline::{PipelineCoordinator, StatusGateway, StatusStore};

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Owns run transitions (start, retry, recovery).
    pub coordinator: Arc<PipelineCoordinator>,
    /// Read-only status snapshots.
    pub gateway: StatusGateway,
    /// Backing store, used directly only for health checks.
    pub store: Arc<dyn StatusStore>,
    pub event_bus: Arc<EventBus>,
}
