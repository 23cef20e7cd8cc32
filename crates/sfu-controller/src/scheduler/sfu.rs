//! SFU scheduling strategy.
//!
//! Every participant gets a receive transport; speakers also get a send
//! transport. A receive transport consumes the producers of the send
//! transports listed in the peer's `consumes`. All steps of one façade call
//! run in a single store transaction.

use super::{CallScheduler, PeerJoin, StreamView};
use crate::context::RequestContext;
use crate::errors::SfuError;
use crate::models::{
    CallRecord, Lifecycle, PeerRecord, ProducerRecord, Role, RtpCapabilities, RtpCodecCapability,
    SourceKind, Sources, TransportDirection,
};
use crate::negotiation::{EndStreamRecord, NegotiationAdapter, StreamHint};
use crate::queue::LifecycleEvent;
use crate::repositories::{ResourceStore, Tables, Transaction};
use crate::services::LifecycleService;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct SfuScheduler {
    store: Arc<ResourceStore>,
    router_codecs: Vec<RtpCodecCapability>,
}

fn peer_of<'t>(tables: &'t Tables, call_id: &str, peer_id: &str) -> Result<&'t PeerRecord, SfuError> {
    tables
        .calls
        .get(call_id)?
        .peers
        .get(peer_id)
        .ok_or_else(|| SfuError::NotFound(format!("peer {peer_id} in call {call_id}")))
}

fn peer_mut<'t>(
    tx: &'t mut Transaction<'_>,
    call_id: &str,
    peer_id: &str,
) -> Result<&'t mut PeerRecord, SfuError> {
    tx.calls
        .get_mut(call_id)?
        .peers
        .get_mut(peer_id)
        .ok_or_else(|| SfuError::NotFound(format!("peer {peer_id} in call {call_id}")))
}

/// The consumer can decode at least one of the producer's media codecs.
fn can_consume(capabilities: &RtpCapabilities, producer: &ProducerRecord) -> Result<bool, SfuError> {
    let params = producer.rtp_parameters.decode()?;
    let supported = params.media_codecs().any(|codec| capabilities.supports(codec));
    Ok(supported)
}

impl SfuScheduler {
    pub fn new(store: Arc<ResourceStore>, router_codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            store,
            router_codecs,
        }
    }

    /// Router of the call, created if the call has none or its router is
    /// being deleted.
    fn ensure_router(
        tx: &mut Transaction<'_>,
        call_id: &str,
        ip: Option<&str>,
    ) -> Result<String, SfuError> {
        let current = tx.calls.get(call_id)?.router_id.clone();
        if let Some(router_id) = current {
            let live = tx
                .routers
                .find(&router_id)
                .is_some_and(|r| !r.state.is_removing());
            if live {
                return Ok(router_id);
            }
        }
        let router_id = LifecycleService::create_router(tx, call_id, ip);
        tx.calls.get_mut(call_id)?.router_id = Some(router_id.clone());
        Ok(router_id)
    }

    /// Transport plus its end-stream.
    fn open_transport(
        tx: &mut Transaction<'_>,
        router_id: &str,
        call_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> Result<String, SfuError> {
        let transport_id =
            LifecycleService::create_transport(tx, router_id, call_id, peer_id, direction)?;
        tx.end_streams.insert(EndStreamRecord::new(
            &transport_id,
            call_id,
            peer_id,
            direction,
        ));
        Ok(transport_id)
    }

    /// Create consumers on the peer's receive transport for every live
    /// producer of `send_transport_id` it does not consume yet.
    fn consume_transport(
        tx: &mut Transaction<'_>,
        call_id: &str,
        peer_id: &str,
        send_transport_id: &str,
    ) -> Result<(), SfuError> {
        let peer = peer_of(tx, call_id, peer_id)?;
        let Some(recv_id) = peer.recv_transport_id.clone() else {
            return Ok(());
        };
        let capabilities = peer.capabilities.clone();
        let recv_live = tx
            .transports
            .find(&recv_id)
            .is_some_and(|t| !t.state.is_removing());
        if !recv_live {
            return Ok(());
        }

        let consumed: Vec<String> = tx
            .consumers_by_transport(&recv_id)
            .into_iter()
            .filter_map(|id| tx.consumers.find(&id))
            .filter(|c| !c.state.is_removing())
            .map(|c| c.producer_id.clone())
            .collect();

        for producer_id in tx.producers_by_transport(send_transport_id) {
            if consumed.contains(&producer_id) {
                continue;
            }
            let Some(producer) = tx.producers.find(&producer_id) else {
                continue;
            };
            if producer.state.is_removing() {
                continue;
            }
            if !can_consume(&capabilities, producer)? {
                debug!(
                    target: "sfu.scheduler",
                    peer_id = %peer_id,
                    producer_id = %producer_id,
                    "Peer cannot decode producer, skipping"
                );
                continue;
            }
            LifecycleService::create_consumer(tx, &recv_id, &producer_id, capabilities.clone())?;
        }
        Self::drive_stream(tx, &recv_id)
    }

    /// Give every peer consuming the producer's transport a consumer for it.
    fn fan_out_producer(tx: &mut Transaction<'_>, producer_id: &str) -> Result<(), SfuError> {
        let producer = tx.producers.get(producer_id)?;
        let transport_id = producer.transport_id.clone();
        let owner = producer.peer_id.clone();
        let call_id = tx.transports.get(&transport_id)?.call_id.clone();

        let consuming: Vec<String> = tx
            .calls
            .get(&call_id)?
            .peers
            .values()
            .filter(|p| p.id != owner && p.consumes.contains(&transport_id))
            .map(|p| p.id.clone())
            .collect();
        for peer_id in consuming {
            Self::consume_transport(tx, &call_id, &peer_id, &transport_id)?;
        }
        Ok(())
    }

    /// Try to move an end-stream forward: answer a pending offer, or
    /// (re)offer a receive stream whose consumers changed.
    fn drive_stream(tx: &mut Transaction<'_>, stream_id: &str) -> Result<(), SfuError> {
        let Some(direction) = tx.end_streams.find(stream_id).map(|s| s.direction) else {
            return Ok(());
        };
        let live = tx
            .transports
            .find(stream_id)
            .is_some_and(|t| !t.state.is_removing());
        if !live {
            return Ok(());
        }
        match direction {
            TransportDirection::Send => {
                NegotiationAdapter::build_producer_answer(tx, stream_id)?;
            }
            TransportDirection::Recv => {
                if NegotiationAdapter::refresh_consumer_stream(tx, stream_id)? {
                    NegotiationAdapter::build_consumer_offer(tx, stream_id)?;
                }
            }
        }
        Ok(())
    }

    /// Stop consuming `send_transport_id` everywhere in the call.
    fn forget_send_transport(
        tx: &mut Transaction<'_>,
        call_id: &str,
        send_transport_id: &str,
    ) -> Result<(), SfuError> {
        for peer in tx.calls.get_mut(call_id)?.peers.values_mut() {
            peer.consumes.retain(|t| t != send_transport_id);
        }
        Ok(())
    }

    /// Start consuming `send_transport_id` on every other peer of the call.
    fn share_send_transport(
        tx: &mut Transaction<'_>,
        call_id: &str,
        owner: &str,
        send_transport_id: &str,
    ) -> Result<(), SfuError> {
        for peer in tx.calls.get_mut(call_id)?.peers.values_mut() {
            if peer.id != owner && !peer.consumes.iter().any(|t| t == send_transport_id) {
                peer.consumes.push(send_transport_id.to_string());
            }
        }
        Ok(())
    }

    fn views(tables: &Tables, call_id: &str, peer_id: &str) -> Vec<StreamView> {
        tables
            .end_streams_by_peer(call_id, peer_id)
            .into_iter()
            .filter(|s| {
                tables
                    .transports
                    .find(&s.id)
                    .is_some_and(|t| !t.state.is_removing())
            })
            .map(StreamView::from)
            .collect()
    }

    fn owned_stream(
        tables: &Tables,
        call_id: &str,
        peer_id: &str,
        stream_id: &str,
    ) -> Result<(), SfuError> {
        let stream = tables.end_streams.get(stream_id)?;
        if stream.call_id != call_id || stream.peer_id != peer_id {
            return Err(SfuError::NotFound(format!(
                "stream {stream_id} of peer {peer_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CallScheduler for SfuScheduler {
    async fn on_peer_added(
        &self,
        _ctx: &RequestContext,
        call_id: &str,
        peer: PeerJoin,
    ) -> Result<Vec<StreamView>, SfuError> {
        let views = self.store.transact(|tx| {
            let joined = tx
                .calls
                .find(call_id)
                .map(|call| call.peers.contains_key(&peer.peer_id));
            match joined {
                Some(true) => {
                    return Err(SfuError::InvalidState(format!(
                        "peer {} already joined call {call_id}",
                        peer.peer_id
                    )));
                }
                Some(false) => {}
                None => {
                    let now = Utc::now();
                    tx.calls.insert(CallRecord {
                        id: call_id.to_string(),
                        router_id: None,
                        peers: BTreeMap::new(),
                        created_at: now,
                        updated_at: now,
                    });
                }
            }

            let router_id = Self::ensure_router(tx, call_id, peer.ip.as_deref())?;
            let send_transport_id = match peer.role {
                Role::Speaker => Some(Self::open_transport(
                    tx,
                    &router_id,
                    call_id,
                    &peer.peer_id,
                    TransportDirection::Send,
                )?),
                Role::Listener => None,
            };
            let recv_transport_id = Self::open_transport(
                tx,
                &router_id,
                call_id,
                &peer.peer_id,
                TransportDirection::Recv,
            )?;

            let consumes: Vec<String> = tx
                .calls
                .get(call_id)?
                .peers
                .values()
                .filter_map(|p| p.send_transport_id.clone())
                .collect();

            tx.calls.get_mut(call_id)?.peers.insert(
                peer.peer_id.clone(),
                PeerRecord {
                    id: peer.peer_id.clone(),
                    role: peer.role,
                    sources: peer.sources,
                    capabilities: peer.capabilities.clone(),
                    ip: peer.ip.clone(),
                    send_transport_id: send_transport_id.clone(),
                    recv_transport_id: Some(recv_transport_id.clone()),
                    consumes: consumes.clone(),
                    producers: BTreeMap::new(),
                },
            );
            if let Some(send_transport_id) = &send_transport_id {
                Self::share_send_transport(tx, call_id, &peer.peer_id, send_transport_id)?;
            }
            for transport_id in &consumes {
                Self::consume_transport(tx, call_id, &peer.peer_id, transport_id)?;
            }
            Self::drive_stream(tx, &recv_transport_id)?;

            Ok(Self::views(tx, call_id, &peer.peer_id))
        })?;

        info!(
            target: "sfu.scheduler",
            call_id = %call_id,
            peer_id = %peer.peer_id,
            role = ?peer.role,
            "Peer added"
        );
        Ok(views)
    }

    async fn on_peer_removed(
        &self,
        _ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
    ) -> Result<(), SfuError> {
        let call_empty = self.store.transact(|tx| {
            let peer = peer_of(tx, call_id, peer_id)?.clone();
            for transport_id in [&peer.send_transport_id, &peer.recv_transport_id]
                .into_iter()
                .flatten()
            {
                LifecycleService::delete_transport(tx, transport_id)?;
            }
            if let Some(send_transport_id) = &peer.send_transport_id {
                Self::forget_send_transport(tx, call_id, send_transport_id)?;
            }

            let call = tx.calls.get_mut(call_id)?;
            call.peers.remove(peer_id);
            if !call.peers.is_empty() {
                return Ok(false);
            }
            if let Some(router_id) = call.router_id.take() {
                LifecycleService::delete_router(tx, &router_id)?;
            }
            tx.calls.remove(call_id);
            Ok(true)
        })?;

        info!(
            target: "sfu.scheduler",
            call_id = %call_id,
            peer_id = %peer_id,
            call_empty = call_empty,
            "Peer removed"
        );
        Ok(())
    }

    async fn on_peer_streams_changed(
        &self,
        _ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        sources: Sources,
    ) -> Result<Vec<StreamView>, SfuError> {
        self.store.transact(|tx| {
            let peer = peer_of(tx, call_id, peer_id)?;
            let previous = peer.sources;
            if previous == sources {
                return Ok(Self::views(tx, call_id, peer_id));
            }
            let send_transport_id = peer.send_transport_id.clone();
            let disabled: Vec<(SourceKind, Option<String>)> = previous
                .enabled()
                .filter(|source| !sources.contains(*source))
                .map(|source| (source, peer.producers.get(&source).cloned()))
                .collect();

            for (_, producer_id) in &disabled {
                if let Some(producer_id) = producer_id {
                    LifecycleService::delete_producer(tx, producer_id)?;
                }
            }

            let peer = peer_mut(tx, call_id, peer_id)?;
            peer.sources = sources;
            for (source, _) in &disabled {
                peer.producers.remove(source);
            }

            if let Some(send_transport_id) = send_transport_id {
                let stream = tx.end_streams.get_mut(&send_transport_id)?;
                for (source, _) in &disabled {
                    stream.source_mids.remove(source);
                }
                stream.request_offer()?;
            }

            debug!(
                target: "sfu.scheduler",
                call_id = %call_id,
                peer_id = %peer_id,
                disabled = disabled.len(),
                "Peer sources changed"
            );
            Ok(Self::views(tx, call_id, peer_id))
        })
    }

    async fn on_peer_role_changed(
        &self,
        _ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        role: Role,
    ) -> Result<Vec<StreamView>, SfuError> {
        self.store.transact(|tx| {
            let peer = peer_of(tx, call_id, peer_id)?.clone();
            if peer.role == role {
                return Ok(Self::views(tx, call_id, peer_id));
            }

            match role {
                Role::Listener => {
                    if let Some(send_transport_id) = &peer.send_transport_id {
                        LifecycleService::delete_transport(tx, send_transport_id)?;
                        Self::forget_send_transport(tx, call_id, send_transport_id)?;
                    }
                    let peer = peer_mut(tx, call_id, peer_id)?;
                    peer.send_transport_id = None;
                    peer.producers.clear();
                }
                Role::Speaker => {
                    let router_id = Self::ensure_router(tx, call_id, peer.ip.as_deref())?;
                    let send_transport_id = Self::open_transport(
                        tx,
                        &router_id,
                        call_id,
                        peer_id,
                        TransportDirection::Send,
                    )?;
                    Self::share_send_transport(tx, call_id, peer_id, &send_transport_id)?;
                    peer_mut(tx, call_id, peer_id)?.send_transport_id = Some(send_transport_id);
                }
            }
            peer_mut(tx, call_id, peer_id)?.role = role;

            info!(
                target: "sfu.scheduler",
                call_id = %call_id,
                peer_id = %peer_id,
                role = ?role,
                "Peer role changed"
            );
            Ok(Self::views(tx, call_id, peer_id))
        })
    }

    async fn on_stream_offer(
        &self,
        _ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        stream_id: &str,
        offer: &str,
        hints: &[StreamHint],
    ) -> Result<StreamView, SfuError> {
        self.store.transact(|tx| {
            Self::owned_stream(tx, call_id, peer_id, stream_id)?;
            let outcome =
                NegotiationAdapter::apply_offer(tx, stream_id, offer, hints, &self.router_codecs)?;
            for producer_id in &outcome.created_producers {
                Self::fan_out_producer(tx, producer_id)?;
            }
            NegotiationAdapter::build_producer_answer(tx, stream_id)?;
            Ok(StreamView::from(tx.end_streams.get(stream_id)?))
        })
    }

    async fn on_stream_answer(
        &self,
        _ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        stream_id: &str,
        answer: &str,
    ) -> Result<StreamView, SfuError> {
        self.store.transact(|tx| {
            Self::owned_stream(tx, call_id, peer_id, stream_id)?;
            let renegotiate = NegotiationAdapter::apply_answer(tx, stream_id, answer)?;
            debug!(
                target: "sfu.scheduler",
                stream_id = %stream_id,
                renegotiate = renegotiate,
                "Answer accepted"
            );
            // Consumers may have changed while the offer was out.
            Self::drive_stream(tx, stream_id)?;
            Ok(StreamView::from(tx.end_streams.get(stream_id)?))
        })
    }

    async fn on_stream_candidate(
        &self,
        _ctx: &RequestContext,
        _call_id: &str,
        _peer_id: &str,
        _stream_id: &str,
        _candidate: &str,
    ) -> Result<(), SfuError> {
        // ICE-lite workers gather no remote candidates from signaling.
        Err(SfuError::NotSupported("stream candidates".to_string()))
    }

    async fn on_stream_failed(
        &self,
        _ctx: &RequestContext,
        _call_id: &str,
        _peer_id: &str,
        _stream_id: &str,
    ) -> Result<(), SfuError> {
        Err(SfuError::NotSupported("stream failure reports".to_string()))
    }

    async fn update_consumes(
        &self,
        _ctx: &RequestContext,
        _call_id: &str,
        _peer_id: &str,
        _consumes: &[String],
    ) -> Result<(), SfuError> {
        Err(SfuError::NotSupported("consume list updates".to_string()))
    }

    async fn peer_streams(
        &self,
        _ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
    ) -> Result<Vec<StreamView>, SfuError> {
        self.store.read(|tables| {
            peer_of(tables, call_id, peer_id)?;
            Ok(Self::views(tables, call_id, peer_id))
        })?
    }

    async fn on_lifecycle_event(
        &self,
        _ctx: &RequestContext,
        event: &LifecycleEvent,
    ) -> Result<(), SfuError> {
        match event {
            LifecycleEvent::TransportCreated { transport_id }
            | LifecycleEvent::TransportConnected { transport_id }
            | LifecycleEvent::ProducerCreated { transport_id, .. }
            | LifecycleEvent::ConsumerCreated { transport_id, .. }
            | LifecycleEvent::ConsumerRemoved { transport_id, .. } => self
                .store
                .transact(|tx| Self::drive_stream(tx, transport_id)),
            LifecycleEvent::RouterRemoved { router_id } => self.store.transact(|tx| {
                let calls = tx
                    .calls
                    .ids_where(|c| c.router_id.as_deref() == Some(router_id.as_str()));
                for call_id in calls {
                    tx.calls.get_mut(&call_id)?.router_id = None;
                }
                Ok(())
            }),
            LifecycleEvent::RouterCreated { .. }
            | LifecycleEvent::TransportRemoved { .. }
            | LifecycleEvent::ProducerRemoved { .. } => Ok(()),
        }
    }
}
