//! Periodic recovery of abandoned runs.
//!
//! A run is abandoned when its stage task died with the process (or was
//! otherwise lost) and nothing has written to it for longer than the
//! stage's maximum duration. The sweep fails such stages as timed out,
//! which leaves the run resumable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use vidgen_pipeline::PipelineCoordinator;

/// Run the recovery sweep loop until `cancel` is triggered.
pub async fn run(
    coordinator: Arc<PipelineCoordinator>,
    sweep_interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        interval_secs = sweep_interval.as_secs(),
        "Recovery sweeper started"
    );

    let mut interval = tokio::time::interval(sweep_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Recovery sweeper stopping");
                break;
            }
            _ = interval.tick() => {
                match coordinator.recover_stale(Utc::now()).await {
                    Ok(0) => tracing::debug!("Recovery sweep: nothing to recover"),
                    Ok(recovered) => tracing::info!(recovered, "Recovery sweep: recovered runs"),
                    Err(e) => tracing::error!(error = %e, "Recovery sweep failed"),
                }
            }
        }
    }
}
