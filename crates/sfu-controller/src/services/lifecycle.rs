//! Resource Lifecycle Manager.
//!
//! Owns the Router/Transport/Producer/Consumer state machines. Every
//! function runs inside a caller-provided [`Transaction`], so a state change
//! and the work item it implies commit together or not at all.
//!
//! Deletion cascades strictly downward. A cascaded child is finalized to
//! `deleted` directly: closing the parent on the worker closes the child
//! remotely as well, so no separate work item is queued for it.

use crate::errors::SfuError;
use crate::models::{
    advance, new_id, ConsumerRecord, DtlsParameters, Lifecycle, MediaKind, ProducerRecord,
    RouterRecord, RouterState, RtpCapabilities, SourceKind, StoredRtpParameters, StreamState,
    TransportDirection, TransportRecord, TransportState,
};
use crate::queue::{LifecycleEvent, WorkItem};
use crate::repositories::Transaction;
use chrono::Utc;
use tracing::debug;

/// Parameters of a producer to create.
#[derive(Debug, Clone)]
pub struct NewProducer {
    pub peer_id: String,
    pub source: SourceKind,
    pub kind: MediaKind,
    pub mid: String,
    pub rtp_parameters: StoredRtpParameters,
}

pub struct LifecycleService;

impl LifecycleService {
    // ========================================================================
    // Router
    // ========================================================================

    /// Create a router record in `creating` and queue its creation.
    pub fn create_router(tx: &mut Transaction<'_>, call_id: &str, ip: Option<&str>) -> String {
        let id = new_id();
        let now = Utc::now();
        tx.routers.insert(RouterRecord {
            id: id.clone(),
            call_id: call_id.to_string(),
            worker_id: None,
            state: RouterState::Creating,
            ip: ip.map(str::to_string),
            created_at: now,
            updated_at: now,
        });
        tx.push_work(WorkItem::RouterCreate {
            router_id: id.clone(),
            ip: ip.map(str::to_string),
        });
        debug!(target: "sfu.service.lifecycle", router_id = %id, call_id = %call_id, "Router requested");
        id
    }

    pub fn delete_router(tx: &mut Transaction<'_>, router_id: &str) -> Result<(), SfuError> {
        let router = tx.routers.get_mut(router_id)?;
        if router.state.is_removing() {
            return Ok(());
        }
        advance(&mut router.state, RouterState::Deleting);
        Self::cascade_router(tx, router_id);
        tx.push_work(WorkItem::RouterDelete {
            router_id: router_id.to_string(),
        });
        Ok(())
    }

    /// Router is gone together with its worker: finalize it and everything
    /// below it without any remote call.
    pub fn finalize_router(tx: &mut Transaction<'_>, router_id: &str) -> Result<(), SfuError> {
        let router = tx.routers.get_mut(router_id)?;
        if router.state.is_removing() {
            return Ok(());
        }
        advance(&mut router.state, RouterState::Deleted);
        Self::cascade_router(tx, router_id);
        tx.emit(LifecycleEvent::RouterRemoved {
            router_id: router_id.to_string(),
        });
        Ok(())
    }

    fn cascade_router(tx: &mut Transaction<'_>, router_id: &str) {
        for transport_id in tx.transports_by_router(router_id) {
            Self::finalize_transport(tx, &transport_id);
        }
    }

    /// Fan-out once the router exists on its worker: transports requested
    /// while it was being created can now be created too.
    pub fn on_router_created(tx: &mut Transaction<'_>, router_id: &str) {
        for transport_id in tx.transports_by_router(router_id) {
            let waiting = tx
                .transports
                .find(&transport_id)
                .is_some_and(|t| t.state == TransportState::Creating);
            if waiting {
                tx.push_work(WorkItem::TransportCreate { transport_id });
            }
        }
        tx.emit(LifecycleEvent::RouterCreated {
            router_id: router_id.to_string(),
        });
    }

    // ========================================================================
    // Transport
    // ========================================================================

    pub fn create_transport(
        tx: &mut Transaction<'_>,
        router_id: &str,
        call_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> Result<String, SfuError> {
        let router_state = tx.routers.get(router_id)?.state;
        if router_state.is_removing() {
            return Err(SfuError::InvalidState(format!(
                "router {router_id} is being deleted"
            )));
        }

        let id = new_id();
        let now = Utc::now();
        tx.transports.insert(TransportRecord {
            id: id.clone(),
            router_id: router_id.to_string(),
            call_id: call_id.to_string(),
            peer_id: peer_id.to_string(),
            direction,
            state: TransportState::Creating,
            client_parameters: None,
            server_parameters: None,
            created_at: now,
            updated_at: now,
        });
        if router_state == RouterState::Created {
            tx.push_work(WorkItem::TransportCreate {
                transport_id: id.clone(),
            });
        }
        Ok(id)
    }

    /// Store the client's DTLS parameters and connect once possible.
    pub fn connect_transport(
        tx: &mut Transaction<'_>,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        let transport = tx.transports.get_mut(transport_id)?;
        if transport.client_parameters.is_some()
            || !matches!(
                transport.state,
                TransportState::Creating | TransportState::Created
            )
        {
            return Ok(());
        }
        transport.client_parameters = Some(dtls_parameters);
        if transport.state == TransportState::Created {
            advance(&mut transport.state, TransportState::Connecting);
            tx.push_work(WorkItem::TransportConnect {
                transport_id: transport_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn delete_transport(tx: &mut Transaction<'_>, transport_id: &str) -> Result<(), SfuError> {
        let transport = tx.transports.get_mut(transport_id)?;
        if transport.state.is_removing() {
            return Ok(());
        }
        advance(&mut transport.state, TransportState::Deleting);
        Self::cascade_transport(tx, transport_id);
        tx.push_work(WorkItem::TransportDelete {
            transport_id: transport_id.to_string(),
        });
        Ok(())
    }

    fn finalize_transport(tx: &mut Transaction<'_>, transport_id: &str) {
        let Ok(transport) = tx.transports.get_mut(transport_id) else {
            return;
        };
        if !advance(&mut transport.state, TransportState::Deleted) {
            return;
        }
        Self::cascade_transport(tx, transport_id);
        tx.emit(LifecycleEvent::TransportRemoved {
            transport_id: transport_id.to_string(),
        });
    }

    fn cascade_transport(tx: &mut Transaction<'_>, transport_id: &str) {
        for producer_id in tx.producers_by_transport(transport_id) {
            Self::finalize_producer(tx, &producer_id);
        }
        for consumer_id in tx.consumers_by_transport(transport_id) {
            Self::finalize_consumer(tx, &consumer_id);
        }
    }

    /// Fan-out once the transport exists on its worker.
    pub fn on_transport_created(tx: &mut Transaction<'_>, transport_id: &str) -> Result<(), SfuError> {
        let transport = tx.transports.get_mut(transport_id)?;
        if transport.client_parameters.is_some() && transport.state == TransportState::Created {
            advance(&mut transport.state, TransportState::Connecting);
            tx.push_work(WorkItem::TransportConnect {
                transport_id: transport_id.to_string(),
            });
        }

        for producer_id in tx.producers_by_transport(transport_id) {
            let waiting = tx
                .producers
                .find(&producer_id)
                .is_some_and(|p| p.state == StreamState::Creating);
            if waiting {
                tx.push_work(WorkItem::ProducerCreate { producer_id });
            }
        }

        for consumer_id in tx.consumers_by_transport(transport_id) {
            let ready = tx.consumers.find(&consumer_id).is_some_and(|c| {
                c.state == StreamState::Creating
                    && tx
                        .producers
                        .find(&c.producer_id)
                        .is_some_and(|p| p.state == StreamState::Created)
            });
            if ready {
                tx.push_work(WorkItem::ConsumerCreate { consumer_id });
            }
        }

        tx.emit(LifecycleEvent::TransportCreated {
            transport_id: transport_id.to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // Producer
    // ========================================================================

    pub fn create_producer(
        tx: &mut Transaction<'_>,
        transport_id: &str,
        producer: NewProducer,
    ) -> Result<String, SfuError> {
        let transport = tx.transports.get(transport_id)?;
        if transport.state.is_removing() {
            return Err(SfuError::InvalidState(format!(
                "transport {transport_id} is being deleted"
            )));
        }
        let router_id = transport.router_id.clone();
        let transport_ready = transport.state.is_ready();

        let id = new_id();
        let now = Utc::now();
        tx.producers.insert(ProducerRecord {
            id: id.clone(),
            transport_id: transport_id.to_string(),
            router_id,
            peer_id: producer.peer_id,
            source: producer.source,
            kind: producer.kind,
            mid: producer.mid,
            rtp_parameters: producer.rtp_parameters,
            paused: false,
            raw_id: None,
            state: StreamState::Creating,
            created_at: now,
            updated_at: now,
        });
        if transport_ready {
            tx.push_work(WorkItem::ProducerCreate {
                producer_id: id.clone(),
            });
        }
        Ok(id)
    }

    pub fn delete_producer(tx: &mut Transaction<'_>, producer_id: &str) -> Result<(), SfuError> {
        let producer = tx.producers.get_mut(producer_id)?;
        if producer.state.is_removing() {
            return Ok(());
        }
        advance(&mut producer.state, StreamState::Deleting);
        let transport_id = producer.transport_id.clone();
        for consumer_id in tx.consumers_by_producer(producer_id) {
            Self::finalize_consumer(tx, &consumer_id);
        }
        tx.push_work(WorkItem::ProducerDelete {
            producer_id: producer_id.to_string(),
        });
        tx.emit(LifecycleEvent::ProducerRemoved {
            producer_id: producer_id.to_string(),
            transport_id,
        });
        Ok(())
    }

    fn finalize_producer(tx: &mut Transaction<'_>, producer_id: &str) {
        let Ok(producer) = tx.producers.get_mut(producer_id) else {
            return;
        };
        if !advance(&mut producer.state, StreamState::Deleted) {
            return;
        }
        let transport_id = producer.transport_id.clone();
        for consumer_id in tx.consumers_by_producer(producer_id) {
            Self::finalize_consumer(tx, &consumer_id);
        }
        tx.emit(LifecycleEvent::ProducerRemoved {
            producer_id: producer_id.to_string(),
            transport_id,
        });
    }

    /// Fan-out once the producer exists: consumers waiting on it whose
    /// transport is ready can now be created.
    pub fn on_producer_created(tx: &mut Transaction<'_>, producer_id: &str) -> Result<(), SfuError> {
        let transport_id = tx.producers.get(producer_id)?.transport_id.clone();
        for consumer_id in tx.consumers_by_producer(producer_id) {
            let ready = tx.consumers.find(&consumer_id).is_some_and(|c| {
                c.state == StreamState::Creating
                    && tx
                        .transports
                        .find(&c.transport_id)
                        .is_some_and(|t| t.state.is_ready())
            });
            if ready {
                tx.push_work(WorkItem::ConsumerCreate { consumer_id });
            }
        }
        tx.emit(LifecycleEvent::ProducerCreated {
            producer_id: producer_id.to_string(),
            transport_id,
        });
        Ok(())
    }

    // ========================================================================
    // Consumer
    // ========================================================================

    pub fn create_consumer(
        tx: &mut Transaction<'_>,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<String, SfuError> {
        let transport = tx.transports.get(transport_id)?;
        if transport.state.is_removing() {
            return Err(SfuError::InvalidState(format!(
                "transport {transport_id} is being deleted"
            )));
        }
        let transport_ready = transport.state.is_ready();
        let router_id = transport.router_id.clone();

        let producer = tx.producers.get(producer_id)?;
        if producer.state.is_removing() {
            return Err(SfuError::InvalidState(format!(
                "producer {producer_id} is being deleted"
            )));
        }
        let producer_ready = producer.state == StreamState::Created;
        let kind = producer.kind;

        let id = new_id();
        let now = Utc::now();
        tx.consumers.insert(ConsumerRecord {
            id: id.clone(),
            transport_id: transport_id.to_string(),
            producer_id: producer_id.to_string(),
            router_id,
            kind,
            rtp_capabilities,
            rtp_parameters: None,
            paused: true,
            raw_id: None,
            state: StreamState::Creating,
            created_at: now,
            updated_at: now,
        });
        if transport_ready && producer_ready {
            tx.push_work(WorkItem::ConsumerCreate {
                consumer_id: id.clone(),
            });
        }
        Ok(id)
    }

    pub fn delete_consumer(tx: &mut Transaction<'_>, consumer_id: &str) -> Result<(), SfuError> {
        let consumer = tx.consumers.get_mut(consumer_id)?;
        if consumer.state.is_removing() {
            return Ok(());
        }
        advance(&mut consumer.state, StreamState::Deleting);
        let transport_id = consumer.transport_id.clone();
        tx.push_work(WorkItem::ConsumerDelete {
            consumer_id: consumer_id.to_string(),
        });
        tx.emit(LifecycleEvent::ConsumerRemoved {
            consumer_id: consumer_id.to_string(),
            transport_id,
        });
        Ok(())
    }

    fn finalize_consumer(tx: &mut Transaction<'_>, consumer_id: &str) {
        let Ok(consumer) = tx.consumers.get_mut(consumer_id) else {
            return;
        };
        let was_removing = consumer.state.is_removing();
        if !advance(&mut consumer.state, StreamState::Deleted) {
            return;
        }
        let transport_id = consumer.transport_id.clone();
        if !was_removing {
            tx.emit(LifecycleEvent::ConsumerRemoved {
                consumer_id: consumer_id.to_string(),
                transport_id,
            });
        }
    }

    /// Queue a resume of a paused consumer.
    ///
    /// # Errors
    ///
    /// `SfuError::InvalidState` while the consumer is still `creating`.
    pub fn unpause_consumer(tx: &mut Transaction<'_>, consumer_id: &str) -> Result<(), SfuError> {
        let consumer = tx.consumers.get(consumer_id)?;
        if consumer.state == StreamState::Creating {
            return Err(SfuError::InvalidState(format!(
                "consumer {consumer_id} is still being created"
            )));
        }
        if consumer.state.is_removing() || !consumer.paused {
            return Ok(());
        }
        tx.push_work(WorkItem::ConsumerUnpause {
            consumer_id: consumer_id.to_string(),
        });
        Ok(())
    }
}
