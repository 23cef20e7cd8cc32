use super::{transport_handle, Reconciler};
use crate::errors::SfuError;
use crate::models::{advance, StreamState};
use crate::rpc::{ProduceOptions, TransportHandle};
use crate::services::LifecycleService;
use tracing::{debug, info, instrument, warn};

impl Reconciler {
    #[instrument(skip_all, name = "sfu.reconcile.producer_create", fields(producer_id = %producer_id))]
    pub(super) async fn create_producer(&self, producer_id: &str) -> Result<(), SfuError> {
        let target = self.store.read(|tables| -> Result<_, SfuError> {
            let Some(producer) = tables.producers.find(producer_id) else {
                return Ok(None);
            };
            if producer.state != StreamState::Creating {
                return Ok(None);
            }
            let transport = tables.transports.get(&producer.transport_id)?;
            // Queued again by the transport fan-out.
            if !transport.state.is_ready() {
                return Ok(None);
            }
            let Some(handle) = transport_handle(tables, transport)? else {
                return Ok(None);
            };
            let options = ProduceOptions {
                kind: producer.kind,
                rtp_parameters: producer.rtp_parameters.decode()?,
                paused: producer.paused,
            };
            Ok(Some((handle, options)))
        })??;

        let Some((handle, options)) = target else {
            debug!(target: "sfu.reconcile.producer", producer_id = %producer_id, "Nothing to create");
            return Ok(());
        };

        let info = self.client.produce(&handle, producer_id, &options).await?;

        let committed = self.store.transact(|tx| {
            let Some(producer) = tx.producers.find_mut(producer_id) else {
                return Ok(false);
            };
            if producer.state != StreamState::Creating {
                return Ok(false);
            }
            producer.raw_id = Some(info.raw_id);
            advance(&mut producer.state, StreamState::Created);
            LifecycleService::on_producer_created(tx, producer_id)?;
            Ok(true)
        })?;

        if committed {
            info!(target: "sfu.reconcile.producer", producer_id = %producer_id, "Producer created");
        } else {
            warn!(
                target: "sfu.reconcile.producer",
                producer_id = %producer_id,
                "Producer removed while being created, closing it"
            );
            self.close_orphaned_producer(&handle, producer_id).await;
        }
        Ok(())
    }

    #[instrument(skip_all, name = "sfu.reconcile.producer_delete", fields(producer_id = %producer_id))]
    pub(super) async fn delete_producer(&self, producer_id: &str) -> Result<(), SfuError> {
        let target = self.store.read(|tables| -> Result<_, SfuError> {
            let Some(producer) = tables.producers.find(producer_id) else {
                return Ok(None);
            };
            if producer.state == StreamState::Deleted {
                return Ok(None);
            }
            let transport = tables.transports.get(&producer.transport_id)?;
            Ok(Some(transport_handle(tables, transport)?))
        })??;

        let Some(handle) = target else {
            return Ok(());
        };
        if let Some(handle) = &handle {
            self.client.close_producer(handle, producer_id).await?;
        }

        // ProducerRemoved was published when deletion was requested.
        self.store.transact(|tx| {
            let Some(producer) = tx.producers.find_mut(producer_id) else {
                return Ok(());
            };
            advance(&mut producer.state, StreamState::Deleted);
            Ok(())
        })?;

        info!(target: "sfu.reconcile.producer", producer_id = %producer_id, "Producer deleted");
        Ok(())
    }

    async fn close_orphaned_producer(&self, handle: &TransportHandle, producer_id: &str) {
        if let Err(e) = self.client.close_producer(handle, producer_id).await {
            warn!(
                target: "sfu.reconcile.producer",
                producer_id = %producer_id,
                error = %e,
                "Failed to close orphaned producer"
            );
        }
    }
}
