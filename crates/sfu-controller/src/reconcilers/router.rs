use super::{router_handle, Reconciler};
use crate::errors::SfuError;
use crate::models::{advance, RouterState};
use crate::queue::LifecycleEvent;
use crate::rpc::{RouterHandle, WorkerRef};
use crate::services::LifecycleService;
use tracing::{debug, info, instrument, warn};

impl Reconciler {
    /// Place the router if needed, create it on its worker, commit `created`
    /// and fan out to the transports waiting on it.
    #[instrument(skip_all, name = "sfu.reconcile.router_create", fields(router_id = %router_id))]
    pub(super) async fn create_router(
        &self,
        router_id: &str,
        ip: Option<&str>,
    ) -> Result<(), SfuError> {
        let worker = self.store.transact(|tx| {
            let Some(router) = tx.routers.find(router_id) else {
                return Ok(None);
            };
            if router.state != RouterState::Creating {
                return Ok(None);
            }
            let worker_id = match router.worker_id.clone() {
                Some(worker_id) => worker_id,
                None => {
                    let worker_id = self.picker.pick_worker(tx, ip)?;
                    tx.routers.get_mut(router_id)?.worker_id = Some(worker_id.clone());
                    worker_id
                }
            };
            let worker = tx.workers.get(&worker_id)?;
            Ok(Some(WorkerRef::from(worker)))
        })?;

        let Some(worker) = worker else {
            debug!(target: "sfu.reconcile.router", router_id = %router_id, "Router no longer creating");
            return Ok(());
        };

        let handle = self
            .client
            .create_router(&worker, router_id, &self.router_codecs)
            .await?;

        let committed = self.store.transact(|tx| {
            let Some(router) = tx.routers.find_mut(router_id) else {
                return Ok(false);
            };
            if router.state != RouterState::Creating {
                return Ok(false);
            }
            advance(&mut router.state, RouterState::Created);
            LifecycleService::on_router_created(tx, router_id);
            Ok(true)
        })?;

        if committed {
            info!(
                target: "sfu.reconcile.router",
                router_id = %router_id,
                worker_id = %handle.worker.worker_id,
                "Router created"
            );
        } else {
            warn!(
                target: "sfu.reconcile.router",
                router_id = %router_id,
                "Router removed while being created, closing it"
            );
            self.close_orphaned_router(&handle).await;
        }
        Ok(())
    }

    /// Close the router on its worker (if it ever had one) and commit
    /// `deleted`.
    #[instrument(skip_all, name = "sfu.reconcile.router_delete", fields(router_id = %router_id))]
    pub(super) async fn delete_router(&self, router_id: &str) -> Result<(), SfuError> {
        let target = self.store.read(|tables| -> Result<_, SfuError> {
            let Some(router) = tables.routers.find(router_id) else {
                return Ok(None);
            };
            if router.state == RouterState::Deleted {
                return Ok(None);
            }
            Ok(Some(router_handle(tables, router)))
        })??;

        let Some(handle) = target else {
            return Ok(());
        };
        if let Some(handle) = &handle {
            self.client.close_router(handle).await?;
        }

        self.store.transact(|tx| {
            let Some(router) = tx.routers.find_mut(router_id) else {
                return Ok(());
            };
            if advance(&mut router.state, RouterState::Deleted) {
                tx.emit(LifecycleEvent::RouterRemoved {
                    router_id: router_id.to_string(),
                });
            }
            Ok(())
        })?;

        info!(
            target: "sfu.reconcile.router",
            router_id = %router_id,
            remote = handle.is_some(),
            "Router deleted"
        );
        Ok(())
    }

    async fn close_orphaned_router(&self, handle: &RouterHandle) {
        if let Err(e) = self.client.close_router(handle).await {
            warn!(
                target: "sfu.reconcile.router",
                router_id = %handle.router_id,
                error = %e,
                "Failed to close orphaned router"
            );
        }
    }
}
