use super::Reconciler;
use crate::errors::SfuError;
use crate::rpc::WorkerRef;
use tracing::{info, instrument};

impl Reconciler {
    /// Release whatever the controller still holds for a removed worker.
    /// Its routers were finalized when it was removed.
    #[instrument(skip_all, name = "sfu.reconcile.worker_cleanup", fields(worker_id = %worker_id))]
    pub(super) async fn cleanup_worker(&self, worker_id: &str) -> Result<(), SfuError> {
        let worker = self
            .store
            .read(|tables| tables.workers.get(worker_id).map(WorkerRef::from))??;

        self.client.release_worker(&worker).await?;

        info!(target: "sfu.reconcile.worker", worker_id = %worker_id, "Worker released");
        Ok(())
    }
}
