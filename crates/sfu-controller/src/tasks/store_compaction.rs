//! Store compaction background task.
//!
//! Periodically drops Deleted rows that nothing references any more, so the
//! resource store only grows with live calls.

use crate::errors::SfuError;
use crate::repositories::{PurgeStats, ResourceStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Start the store compaction task.
///
/// Returns when the cancellation token is triggered.
#[instrument(skip_all, name = "sfu.task.store_compaction")]
pub async fn start_store_compaction(
    store: Arc<ResourceStore>,
    check_interval: Duration,
    retention: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "sfu.task.store_compaction",
        check_interval_secs = check_interval.as_secs(),
        retention_secs = retention.as_secs(),
        "Starting store compaction task"
    );

    let mut interval = tokio::time::interval(check_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = run_compaction(&store, retention) {
                    error!(
                        target: "sfu.task.store_compaction",
                        error = %e,
                        "Store compaction failed"
                    );
                }
            }
            _ = cancel_token.cancelled() => {
                info!(
                    target: "sfu.task.store_compaction",
                    "Store compaction task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "sfu.task.store_compaction", "Store compaction task stopped");
}

/// One compaction pass (separated for testing).
pub fn run_compaction(store: &ResourceStore, retention: Duration) -> Result<PurgeStats, SfuError> {
    let stats = store.purge_finished(retention)?;
    if stats.total() > 0 {
        info!(
            target: "sfu.task.store_compaction",
            routers = stats.routers,
            transports = stats.transports,
            producers = stats.producers,
            consumers = stats.consumers,
            "Purged deleted rows"
        );
    } else {
        debug!(target: "sfu.task.store_compaction", "Nothing to purge");
    }
    Ok(stats)
}
