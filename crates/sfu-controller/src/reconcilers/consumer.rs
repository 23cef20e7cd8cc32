use super::{transport_handle, Reconciler};
use crate::errors::SfuError;
use crate::models::{advance, Lifecycle, StoredRtpParameters, StreamState};
use crate::queue::LifecycleEvent;
use crate::rpc::{ConsumeOptions, TransportHandle};
use tracing::{debug, info, instrument, warn};

impl Reconciler {
    /// Create the consumer once its transport is ready and its producer is
    /// created. The commit re-checks the producer: a consumer never becomes
    /// `created` on top of a removed producer.
    #[instrument(skip_all, name = "sfu.reconcile.consumer_create", fields(consumer_id = %consumer_id))]
    pub(super) async fn create_consumer(&self, consumer_id: &str) -> Result<(), SfuError> {
        let target = self.store.read(|tables| -> Result<_, SfuError> {
            let Some(consumer) = tables.consumers.find(consumer_id) else {
                return Ok(None);
            };
            if consumer.state != StreamState::Creating {
                return Ok(None);
            }
            let transport = tables.transports.get(&consumer.transport_id)?;
            let producer = tables.producers.get(&consumer.producer_id)?;
            if !transport.state.is_ready() || producer.state != StreamState::Created {
                return Ok(None);
            }
            let producer_raw_id = producer.raw_id.clone().ok_or_else(|| {
                SfuError::Store(format!("producer {} is created without raw id", producer.id))
            })?;
            let Some(handle) = transport_handle(tables, transport)? else {
                return Ok(None);
            };
            let options = ConsumeOptions {
                producer_raw_id,
                rtp_capabilities: consumer.rtp_capabilities.clone(),
                paused: consumer.paused,
            };
            Ok(Some((handle, options)))
        })??;

        let Some((handle, options)) = target else {
            debug!(target: "sfu.reconcile.consumer", consumer_id = %consumer_id, "Nothing to create");
            return Ok(());
        };

        let info = self.client.consume(&handle, consumer_id, &options).await?;
        let rtp_parameters = StoredRtpParameters::encode(&info.rtp_parameters)?;

        let committed = self.store.transact(|tx| {
            let producer_live = {
                let Some(consumer) = tx.consumers.find(consumer_id) else {
                    return Ok(false);
                };
                tx.producers
                    .find(&consumer.producer_id)
                    .is_some_and(|p| !p.state.is_removing())
            };
            let Some(consumer) = tx.consumers.find_mut(consumer_id) else {
                return Ok(false);
            };
            if consumer.state != StreamState::Creating || !producer_live {
                return Ok(false);
            }
            consumer.raw_id = Some(info.raw_id);
            consumer.rtp_parameters = Some(rtp_parameters);
            advance(&mut consumer.state, StreamState::Created);
            let transport_id = consumer.transport_id.clone();
            tx.emit(LifecycleEvent::ConsumerCreated {
                consumer_id: consumer_id.to_string(),
                transport_id,
            });
            Ok(true)
        })?;

        if committed {
            info!(target: "sfu.reconcile.consumer", consumer_id = %consumer_id, "Consumer created");
        } else {
            warn!(
                target: "sfu.reconcile.consumer",
                consumer_id = %consumer_id,
                "Consumer removed while being created, closing it"
            );
            self.close_orphaned_consumer(&handle, consumer_id).await;
        }
        Ok(())
    }

    #[instrument(skip_all, name = "sfu.reconcile.consumer_delete", fields(consumer_id = %consumer_id))]
    pub(super) async fn delete_consumer(&self, consumer_id: &str) -> Result<(), SfuError> {
        let target = self.store.read(|tables| -> Result<_, SfuError> {
            let Some(consumer) = tables.consumers.find(consumer_id) else {
                return Ok(None);
            };
            if consumer.state == StreamState::Deleted {
                return Ok(None);
            }
            let transport = tables.transports.get(&consumer.transport_id)?;
            Ok(Some(transport_handle(tables, transport)?))
        })??;

        let Some(handle) = target else {
            return Ok(());
        };
        if let Some(handle) = &handle {
            self.client.close_consumer(handle, consumer_id).await?;
        }

        self.store.transact(|tx| {
            let Some(consumer) = tx.consumers.find_mut(consumer_id) else {
                return Ok(());
            };
            advance(&mut consumer.state, StreamState::Deleted);
            Ok(())
        })?;

        info!(target: "sfu.reconcile.consumer", consumer_id = %consumer_id, "Consumer deleted");
        Ok(())
    }

    #[instrument(skip_all, name = "sfu.reconcile.consumer_unpause", fields(consumer_id = %consumer_id))]
    pub(super) async fn unpause_consumer(&self, consumer_id: &str) -> Result<(), SfuError> {
        let handle = self.store.read(|tables| -> Result<_, SfuError> {
            let Some(consumer) = tables.consumers.find(consumer_id) else {
                return Ok(None);
            };
            if consumer.state != StreamState::Created || !consumer.paused {
                return Ok(None);
            }
            let transport = tables.transports.get(&consumer.transport_id)?;
            transport_handle(tables, transport)
        })??;

        let Some(handle) = handle else {
            return Ok(());
        };

        self.client.resume_consumer(&handle, consumer_id).await?;

        self.store.transact(|tx| {
            let Some(consumer) = tx.consumers.find_mut(consumer_id) else {
                return Ok(());
            };
            if consumer.state == StreamState::Created {
                consumer.paused = false;
            }
            Ok(())
        })?;

        debug!(target: "sfu.reconcile.consumer", consumer_id = %consumer_id, "Consumer resumed");
        Ok(())
    }

    async fn close_orphaned_consumer(&self, handle: &TransportHandle, consumer_id: &str) {
        if let Err(e) = self.client.close_consumer(handle, consumer_id).await {
            warn!(
                target: "sfu.reconcile.consumer",
                consumer_id = %consumer_id,
                error = %e,
                "Failed to close orphaned consumer"
            );
        }
    }
}
