//! Worker Registry.
//!
//! Reconciles the observed worker set against durable worker records.

use crate::errors::SfuError;
use crate::models::{WorkerAppData, WorkerRecord};
use crate::observability::metrics;
use crate::queue::WorkItem;
use crate::repositories::{ResourceStore, Transaction};
use crate::rpc::{LiveWorker, MediaWorkerClient, WorkerRef};
use crate::services::lifecycle::LifecycleService;
use chrono::Utc;
use std::collections::HashMap;
use tracing::{info, instrument, warn};

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Stale records whose process still reports healthy.
    pub killed: Vec<String>,
}

impl WorkerDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.killed.is_empty()
    }
}

pub struct WorkerRegistry;

impl WorkerRegistry {
    /// Diff `live` against the store:
    /// - active records missing or unhealthy in `live` are removed
    /// - healthy workers without a record are added
    /// - healthy workers whose record is already deleted are killed
    ///
    /// Kill commands go out after the transaction commits.
    #[instrument(skip_all, name = "sfu.service.worker_registry", fields(live = live.len()))]
    pub async fn on_workers_changed(
        store: &ResourceStore,
        client: &dyn MediaWorkerClient,
        live: &[LiveWorker],
    ) -> Result<WorkerDiff, SfuError> {
        let healthy: HashMap<&str, &LiveWorker> = live
            .iter()
            .filter(|w| w.healthy)
            .map(|w| (w.id.as_str(), w))
            .collect();

        let (diff, to_kill, active) = store.transact(|tx| {
            let mut diff = WorkerDiff::default();
            let mut to_kill = Vec::new();

            let gone: Vec<String> = tx
                .active_workers()
                .into_iter()
                .filter(|w| !healthy.contains_key(w.id.as_str()))
                .map(|w| w.id.clone())
                .collect();
            for worker_id in gone {
                Self::on_worker_removed(tx, &worker_id)?;
                diff.removed.push(worker_id);
            }

            for worker in healthy.values() {
                match tx.workers.find(&worker.id) {
                    None => {
                        Self::on_worker_added(tx, &worker.id, worker.app_data.clone());
                        diff.added.push(worker.id.clone());
                    }
                    Some(record) if record.deleted => {
                        to_kill.push(WorkerRef::from(record));
                        diff.killed.push(worker.id.clone());
                    }
                    Some(_) => {}
                }
            }

            diff.added.sort();
            diff.killed.sort();
            Ok((diff, to_kill, tx.active_workers().len()))
        })?;

        metrics::set_workers_active(active);

        for worker in to_kill {
            warn!(
                target: "sfu.service.worker_registry",
                worker_id = %worker.worker_id,
                "Deleted worker still reports healthy, killing it"
            );
            if let Err(e) = client.kill_worker(&worker).await {
                warn!(
                    target: "sfu.service.worker_registry",
                    worker_id = %worker.worker_id,
                    error = %e,
                    "Failed to kill stale worker"
                );
            }
        }

        if !diff.is_empty() {
            info!(
                target: "sfu.service.worker_registry",
                added = diff.added.len(),
                removed = diff.removed.len(),
                killed = diff.killed.len(),
                active = active,
                "Worker set changed"
            );
        }
        Ok(diff)
    }

    pub fn on_worker_added(tx: &mut Transaction<'_>, worker_id: &str, app_data: WorkerAppData) {
        let now = Utc::now();
        tx.workers.insert(WorkerRecord {
            id: worker_id.to_string(),
            healthy: true,
            deleted: false,
            app_data,
            created_at: now,
            updated_at: now,
        });
    }

    /// Mark the worker deleted, finalize every router placed on it (and
    /// everything below), then queue cleanup.
    pub fn on_worker_removed(tx: &mut Transaction<'_>, worker_id: &str) -> Result<(), SfuError> {
        let worker = tx.workers.get_mut(worker_id)?;
        if worker.deleted {
            return Ok(());
        }
        worker.healthy = false;
        worker.deleted = true;

        let routers = tx.routers_by_worker(worker_id);
        for router_id in &routers {
            LifecycleService::finalize_router(tx, router_id)?;
        }
        tx.push_work(WorkItem::WorkerCleanup {
            worker_id: worker_id.to_string(),
        });

        warn!(
            target: "sfu.service.worker_registry",
            worker_id = %worker_id,
            routers = routers.len(),
            "Worker removed"
        );
        Ok(())
    }
}
