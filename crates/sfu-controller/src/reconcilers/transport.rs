use super::{router_handle, transport_handle, Reconciler};
use crate::errors::SfuError;
use crate::models::{advance, RouterState, TransportState};
use crate::queue::LifecycleEvent;
use crate::rpc::TransportHandle;
use crate::services::LifecycleService;
use tracing::{debug, info, instrument, warn};

impl Reconciler {
    #[instrument(skip_all, name = "sfu.reconcile.transport_create", fields(transport_id = %transport_id))]
    pub(super) async fn create_transport(&self, transport_id: &str) -> Result<(), SfuError> {
        let handle = self.store.read(|tables| -> Result<_, SfuError> {
            let Some(transport) = tables.transports.find(transport_id) else {
                return Ok(None);
            };
            if transport.state != TransportState::Creating {
                return Ok(None);
            }
            let router = tables.routers.get(&transport.router_id)?;
            // Queued again by the router fan-out once the router exists.
            if router.state != RouterState::Created {
                return Ok(None);
            }
            Ok(router_handle(tables, router).map(|h| h.transport(transport_id)))
        })??;

        let Some(handle) = handle else {
            debug!(target: "sfu.reconcile.transport", transport_id = %transport_id, "Nothing to create");
            return Ok(());
        };

        let server_parameters = self
            .client
            .create_webrtc_transport(&handle.router, transport_id, &self.transport_options)
            .await?;

        let committed = self.store.transact(|tx| {
            let Some(transport) = tx.transports.find_mut(transport_id) else {
                return Ok(false);
            };
            if transport.state != TransportState::Creating {
                return Ok(false);
            }
            transport.server_parameters = Some(server_parameters);
            advance(&mut transport.state, TransportState::Created);
            LifecycleService::on_transport_created(tx, transport_id)?;
            Ok(true)
        })?;

        if committed {
            info!(target: "sfu.reconcile.transport", transport_id = %transport_id, "Transport created");
        } else {
            warn!(
                target: "sfu.reconcile.transport",
                transport_id = %transport_id,
                "Transport removed while being created, closing it"
            );
            self.close_orphaned_transport(&handle).await;
        }
        Ok(())
    }

    #[instrument(skip_all, name = "sfu.reconcile.transport_connect", fields(transport_id = %transport_id))]
    pub(super) async fn connect_transport(&self, transport_id: &str) -> Result<(), SfuError> {
        let target = self.store.read(|tables| -> Result<_, SfuError> {
            let Some(transport) = tables.transports.find(transport_id) else {
                return Ok(None);
            };
            if transport.state != TransportState::Connecting {
                return Ok(None);
            }
            let Some(parameters) = transport.client_parameters.clone() else {
                return Ok(None);
            };
            Ok(transport_handle(tables, transport)?.map(|handle| (handle, parameters)))
        })??;

        let Some((handle, parameters)) = target else {
            debug!(target: "sfu.reconcile.transport", transport_id = %transport_id, "Nothing to connect");
            return Ok(());
        };

        self.client.connect_transport(&handle, &parameters).await?;

        self.store.transact(|tx| {
            let Some(transport) = tx.transports.find_mut(transport_id) else {
                return Ok(());
            };
            if transport.state == TransportState::Connecting
                && advance(&mut transport.state, TransportState::Connected)
            {
                tx.emit(LifecycleEvent::TransportConnected {
                    transport_id: transport_id.to_string(),
                });
            }
            Ok(())
        })?;

        info!(target: "sfu.reconcile.transport", transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    #[instrument(skip_all, name = "sfu.reconcile.transport_delete", fields(transport_id = %transport_id))]
    pub(super) async fn delete_transport(&self, transport_id: &str) -> Result<(), SfuError> {
        let target = self.store.read(|tables| -> Result<_, SfuError> {
            let Some(transport) = tables.transports.find(transport_id) else {
                return Ok(None);
            };
            if transport.state == TransportState::Deleted {
                return Ok(None);
            }
            Ok(Some(transport_handle(tables, transport)?))
        })??;

        let Some(handle) = target else {
            return Ok(());
        };
        if let Some(handle) = &handle {
            self.client.close_transport(handle).await?;
        }

        self.store.transact(|tx| {
            let Some(transport) = tx.transports.find_mut(transport_id) else {
                return Ok(());
            };
            if advance(&mut transport.state, TransportState::Deleted) {
                tx.emit(LifecycleEvent::TransportRemoved {
                    transport_id: transport_id.to_string(),
                });
            }
            Ok(())
        })?;

        info!(target: "sfu.reconcile.transport", transport_id = %transport_id, "Transport deleted");
        Ok(())
    }

    async fn close_orphaned_transport(&self, handle: &TransportHandle) {
        if let Err(e) = self.client.close_transport(handle).await {
            warn!(
                target: "sfu.reconcile.transport",
                transport_id = %handle.transport_id,
                error = %e,
                "Failed to close orphaned transport"
            );
        }
    }
}
