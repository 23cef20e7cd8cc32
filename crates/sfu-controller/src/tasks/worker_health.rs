//! Worker health tracker background task.
//!
//! Turns status callbacks collected on the [`WorkerStatusBoard`] into
//! registry reconciliations: on every tick (which also catches workers whose
//! last report went stale) and whenever a worker's status flips.

use crate::repositories::ResourceStore;
use crate::rpc::{MediaWorkerClient, WorkerStatusBoard};
use crate::services::WorkerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Start the worker health tracker.
///
/// Returns when the cancellation token is triggered.
#[instrument(skip_all, name = "sfu.task.worker_health")]
pub async fn start_worker_health_tracker(
    store: Arc<ResourceStore>,
    client: Arc<dyn MediaWorkerClient>,
    board: Arc<WorkerStatusBoard>,
    check_interval: Duration,
    staleness: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "sfu.task.worker_health",
        check_interval_ms = check_interval.as_millis() as u64,
        staleness_ms = staleness.as_millis() as u64,
        "Starting worker health tracker"
    );

    let mut interval = tokio::time::interval(check_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = board.changed() => {}
            _ = cancel_token.cancelled() => {
                info!(
                    target: "sfu.task.worker_health",
                    "Worker health tracker received shutdown signal, exiting"
                );
                break;
            }
        }

        let live = board.snapshot(staleness);
        if let Err(e) = WorkerRegistry::on_workers_changed(&store, client.as_ref(), &live).await {
            // The next tick retries with a fresh snapshot.
            error!(
                target: "sfu.task.worker_health",
                error = %e,
                "Failed to reconcile workers"
            );
        }
    }

    info!(target: "sfu.task.worker_health", "Worker health tracker stopped");
}
