//! Orchestration of video generation runs.
//!
//! [`PipelineCoordinator`] owns the run lifecycle and dispatches one
//! [`StageWorker`] per stage. Workers fan units out to the
//! [`UnitExecutor`], which walks each unit through its provider waterfall.
//! All state lives in a [`StatusStore`]; [`StatusGateway`] serves the
//! read-only snapshots clients poll.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod http_provider;
pub mod plan;
pub mod provider;
pub mod script;
pub mod stage;
pub mod store;

pub use config::PipelineConfig;
pub use coordinator::{PipelineCoordinator, StartRequest};
pub use error::PipelineError;
pub use executor::{UnitExecutor, UnitOutcome};
pub use gateway::StatusGateway;
pub use http_provider::HttpProviderInvoker;
pub use provider::{ProviderInvoker, ProviderSelector};
pub use script::{PgScriptSource, ScriptSource, StaticScriptSource};
pub use stage::StageWorker;
pub use store::{MemoryStatusStore, PgStatusStore, RunLocks, StatusStore, StoreError};
