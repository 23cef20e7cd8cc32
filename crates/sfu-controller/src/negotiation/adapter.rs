//! Negotiation Adapter.
//!
//! Turns client offers/answers into resource operations and renders the
//! server side of each negotiation from resource state. Everything here runs
//! inside a store transaction; building an SDP is only possible once the
//! resources it describes exist on a worker, so the `build_*` functions
//! return `Ok(None)` until then and are retried whenever a dependency
//! changes.
//!
//! Producer side (client sends): client offers, server answers `recvonly`.
//! Consumer side (client receives): server offers `sendonly`, client answers.

use super::convert::{active_section, rejected_section, rtp_parameters_from_section, server_session};
use super::end_stream::EndStreamState;
use super::sdp::{MediaDirection, SessionDescription};
use crate::errors::SfuError;
use crate::models::{
    ConsumerRecord, DtlsParameters, DtlsRole, Lifecycle, MediaKind, PeerRecord,
    RtpCodecCapability, RtpParameters, SourceKind, StoredRtpParameters, StreamState,
    TransportDirection, TransportState,
};
use crate::observability::metrics;
use crate::repositories::{Tables, Transaction};
use crate::services::{LifecycleService, NewProducer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Client metadata binding an offered media section to a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHint {
    pub source: SourceKind,
    pub mid: String,
}

/// Producers touched by an offer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferOutcome {
    pub created_producers: Vec<String>,
    pub deleted_producers: Vec<String>,
}

pub struct NegotiationAdapter;

fn peer_of<'t>(tables: &'t Tables, call_id: &str, peer_id: &str) -> Result<&'t PeerRecord, SfuError> {
    tables
        .calls
        .get(call_id)?
        .peers
        .get(peer_id)
        .ok_or_else(|| SfuError::NotFound(format!("peer {peer_id} in call {call_id}")))
}

fn session_id(created_at: DateTime<Utc>) -> u64 {
    u64::try_from(created_at.timestamp_micros()).unwrap_or_default()
}

impl NegotiationAdapter {
    /// Apply a client offer on a producer-side stream.
    ///
    /// Hints are validated up front: each must name an offered section whose
    /// direction is `sendonly` or `inactive` and whose media type matches the
    /// source, for a source the peer has enabled. A source stays bound to the
    /// first mid it was offered on. `sendonly` sections without a live
    /// producer get one; `inactive` sections drop theirs.
    ///
    /// An offer without media sections is valid and creates nothing.
    pub fn apply_offer(
        tx: &mut Transaction<'_>,
        stream_id: &str,
        offer: &str,
        hints: &[StreamHint],
        router_codecs: &[RtpCodecCapability],
    ) -> Result<OfferOutcome, SfuError> {
        let stream = tx.end_streams.get(stream_id)?;
        if stream.direction != TransportDirection::Send {
            return Err(SfuError::InvalidState(format!(
                "stream {stream_id} is server-offered"
            )));
        }
        if matches!(
            stream.state,
            EndStreamState::NeedOffer | EndStreamState::WaitAnswer
        ) {
            return Err(SfuError::InvalidState(format!(
                "stream {stream_id} is {}, not accepting offers",
                stream.state.as_str()
            )));
        }
        let call_id = stream.call_id.clone();
        let peer_id = stream.peer_id.clone();
        let bound = stream.source_mids.clone();

        if tx.transports.get(stream_id)?.state.is_removing() {
            return Err(SfuError::InvalidState(format!(
                "transport {stream_id} is being deleted"
            )));
        }

        let sdp = SessionDescription::parse(offer)?;
        let peer = peer_of(tx, &call_id, &peer_id)?.clone();

        let mut seen = BTreeSet::new();
        for hint in hints {
            if !seen.insert(hint.source) {
                return Err(SfuError::Negotiation(format!(
                    "source {} hinted twice",
                    hint.source.as_str()
                )));
            }
            let section = sdp.find_media(&hint.mid).ok_or_else(|| {
                SfuError::Negotiation(format!("hint references unknown section {}", hint.mid))
            })?;
            let direction = section.direction();
            if !matches!(direction, MediaDirection::SendOnly | MediaDirection::Inactive) {
                return Err(SfuError::Negotiation(format!(
                    "section {} is {}, expected sendonly or inactive",
                    hint.mid,
                    direction.as_str()
                )));
            }
            if section.kind() != Some(hint.source.media_kind()) {
                return Err(SfuError::Negotiation(format!(
                    "section {} carries {}, {} needs {}",
                    hint.mid,
                    section.media,
                    hint.source.as_str(),
                    hint.source.media_kind().as_str()
                )));
            }
            if !peer.sources.contains(hint.source) {
                return Err(SfuError::Negotiation(format!(
                    "source {} is not enabled",
                    hint.source.as_str()
                )));
            }
            if let Some(existing) = bound.get(&hint.source) {
                if *existing != hint.mid {
                    return Err(SfuError::Negotiation(format!(
                        "source {} is bound to section {existing}, not {}",
                        hint.source.as_str(),
                        hint.mid
                    )));
                }
            }
            if bound
                .iter()
                .any(|(source, mid)| *source != hint.source && *mid == hint.mid)
            {
                return Err(SfuError::Negotiation(format!(
                    "section {} is bound to another source",
                    hint.mid
                )));
            }
        }

        if !sdp.media.is_empty() {
            let fingerprints = sdp.fingerprints();
            if fingerprints.is_empty() {
                return Err(SfuError::Negotiation(
                    "offer carries no DTLS fingerprint".to_string(),
                ));
            }
            let role = sdp
                .setup()
                .and_then(DtlsRole::from_setup)
                .unwrap_or(DtlsRole::Client);
            LifecycleService::connect_transport(
                tx,
                stream_id,
                DtlsParameters { role, fingerprints },
            )?;
        }

        let mut outcome = OfferOutcome::default();
        let mut created: Vec<(SourceKind, String)> = Vec::new();
        let mut dropped: Vec<SourceKind> = Vec::new();
        for hint in hints {
            let section = sdp.find_media(&hint.mid).ok_or_else(|| {
                SfuError::Negotiation(format!("hint references unknown section {}", hint.mid))
            })?;
            let existing = peer
                .producers
                .get(&hint.source)
                .filter(|id| {
                    tx.producers
                        .find(id)
                        .is_some_and(|p| !p.state.is_removing())
                })
                .cloned();

            match (section.direction(), existing) {
                (MediaDirection::SendOnly, Some(_)) => {}
                (MediaDirection::SendOnly, None) => {
                    let params = rtp_parameters_from_section(section, router_codecs)?;
                    let producer_id = LifecycleService::create_producer(
                        tx,
                        stream_id,
                        NewProducer {
                            peer_id: peer_id.clone(),
                            source: hint.source,
                            kind: hint.source.media_kind(),
                            mid: hint.mid.clone(),
                            rtp_parameters: StoredRtpParameters::encode(&params)?,
                        },
                    )?;
                    outcome.created_producers.push(producer_id.clone());
                    created.push((hint.source, producer_id));
                }
                (_, Some(producer_id)) => {
                    LifecycleService::delete_producer(tx, &producer_id)?;
                    outcome.deleted_producers.push(producer_id);
                    dropped.push(hint.source);
                }
                (_, None) => {}
            }
        }

        {
            let call = tx.calls.get_mut(&call_id)?;
            let peer = call
                .peers
                .get_mut(&peer_id)
                .ok_or_else(|| SfuError::NotFound(format!("peer {peer_id} in call {call_id}")))?;
            for source in dropped {
                peer.producers.remove(&source);
            }
            for (source, producer_id) in created {
                peer.producers.insert(source, producer_id);
            }
        }

        let stream = tx.end_streams.get_mut(stream_id)?;
        for hint in hints {
            stream.source_mids.insert(hint.source, hint.mid.clone());
        }
        stream.remote_sdp = Some(offer.to_string());
        stream.transition(EndStreamState::NeedAnswer)?;

        debug!(
            target: "sfu.negotiation",
            stream_id = %stream_id,
            sections = sdp.media.len(),
            created = outcome.created_producers.len(),
            deleted = outcome.deleted_producers.len(),
            "Offer applied"
        );
        Ok(outcome)
    }

    /// Render the answer of a producer-side stream once the transport is
    /// connected and every producer of an enabled source is created.
    ///
    /// Sections mirror the offer: `recvonly` for sections backed by a
    /// created producer, rejected otherwise.
    pub fn build_producer_answer(
        tx: &mut Transaction<'_>,
        stream_id: &str,
    ) -> Result<Option<String>, SfuError> {
        let stream = tx.end_streams.get(stream_id)?;
        if stream.direction != TransportDirection::Send
            || stream.state != EndStreamState::NeedAnswer
        {
            return Ok(None);
        }
        let Some(remote) = stream.remote_sdp.as_deref() else {
            return Ok(None);
        };
        let offer = SessionDescription::parse(remote)?;
        let created_at = stream.created_at;

        let transport = tx.transports.get(stream_id)?;
        if transport.state.is_removing()
            || (!offer.media.is_empty() && transport.state != TransportState::Connected)
        {
            return Ok(None);
        }
        let server = transport.server_parameters.clone();

        let peer = peer_of(tx, &stream.call_id, &stream.peer_id)?;
        let mut ready: BTreeMap<String, (MediaKind, RtpParameters)> = BTreeMap::new();
        for source in peer.sources.enabled() {
            let Some(producer_id) = peer.producers.get(&source) else {
                continue;
            };
            let producer = tx.producers.get(producer_id)?;
            match producer.state {
                StreamState::Creating => return Ok(None),
                StreamState::Created => {
                    ready.insert(
                        producer.mid.clone(),
                        (producer.kind, producer.rtp_parameters.decode()?),
                    );
                }
                StreamState::Deleting | StreamState::Deleted => {}
            }
        }

        let sections = offer
            .media
            .iter()
            .map(|offered| {
                let mid = offered.mid().unwrap_or_default();
                match (ready.get(mid), server.as_ref()) {
                    (Some((kind, params)), Some(server)) => active_section(
                        *kind,
                        mid,
                        params,
                        MediaDirection::RecvOnly,
                        server,
                        "passive",
                    ),
                    _ => rejected_section(&offered.media, mid, offered.formats.clone()),
                }
            })
            .collect();

        let stream = tx.end_streams.get_mut(stream_id)?;
        let version = stream.bump_sdp_version();
        let answer = server_session(session_id(created_at), version, sections).to_string();
        stream.local_sdp = Some(answer.clone());
        stream.transition(EndStreamState::Online)?;

        metrics::record_negotiation("producer_answer", "built");
        debug!(
            target: "sfu.negotiation",
            stream_id = %stream_id,
            accepted = ready.len(),
            version = version,
            "Answer built"
        );
        Ok(Some(answer))
    }

    /// Compare the live consumers of a consumer-side stream with the last
    /// offer and request a renegotiation if they differ.
    ///
    /// Returns whether the stream now needs a server offer.
    pub fn refresh_consumer_stream(
        tx: &mut Transaction<'_>,
        stream_id: &str,
    ) -> Result<bool, SfuError> {
        if tx.end_streams.get(stream_id)?.direction != TransportDirection::Recv {
            return Ok(false);
        }
        let live: BTreeSet<String> = tx
            .consumers_by_transport(stream_id)
            .into_iter()
            .filter(|id| {
                tx.consumers
                    .find(id)
                    .is_some_and(|c| !c.state.is_removing())
            })
            .collect();

        let stream = tx.end_streams.get_mut(stream_id)?;
        if live != stream.offered_consumers {
            stream.request_renegotiation()
        } else {
            Ok(stream.state == EndStreamState::NeedOffer)
        }
    }

    /// Render the offer of a consumer-side stream once every live consumer
    /// is created.
    ///
    /// Each consumer keeps the section it was first offered in; removed
    /// consumers leave a rejected section behind.
    pub fn build_consumer_offer(
        tx: &mut Transaction<'_>,
        stream_id: &str,
    ) -> Result<Option<String>, SfuError> {
        let stream = tx.end_streams.get(stream_id)?;
        if stream.direction != TransportDirection::Recv
            || stream.state != EndStreamState::NeedOffer
        {
            return Ok(None);
        }
        let created_at = stream.created_at;
        let nothing_offered_yet = stream.section_order.is_empty();

        let transport = tx.transports.get(stream_id)?;
        if !transport.state.is_ready() {
            return Ok(None);
        }
        let Some(server) = transport.server_parameters.clone() else {
            return Ok(None);
        };

        let live: Vec<ConsumerRecord> = tx
            .consumers_by_transport(stream_id)
            .into_iter()
            .filter_map(|id| tx.consumers.find(&id).cloned())
            .filter(|c| !c.state.is_removing())
            .collect();
        if live.iter().any(|c| c.state == StreamState::Creating) {
            return Ok(None);
        }
        if live.is_empty() && nothing_offered_yet {
            return Ok(None);
        }

        let (order, mids, kinds) = {
            let stream = tx.end_streams.get_mut(stream_id)?;
            for consumer in &live {
                if !stream.consumer_mids.contains_key(&consumer.id) {
                    let mid = stream.allocate_mid();
                    stream.consumer_mids.insert(consumer.id.clone(), mid);
                    stream.consumer_kinds.insert(consumer.id.clone(), consumer.kind);
                    stream.section_order.push(consumer.id.clone());
                }
            }
            (
                stream.section_order.clone(),
                stream.consumer_mids.clone(),
                stream.consumer_kinds.clone(),
            )
        };

        let mut sections = Vec::with_capacity(order.len());
        for consumer_id in &order {
            let Some(mid) = mids.get(consumer_id) else {
                continue;
            };
            match live.iter().find(|c| &c.id == consumer_id) {
                Some(consumer) => {
                    let params = consumer
                        .rtp_parameters
                        .as_ref()
                        .ok_or_else(|| {
                            SfuError::Store(format!(
                                "consumer {consumer_id} is created without RTP parameters"
                            ))
                        })?
                        .decode()?;
                    sections.push(active_section(
                        consumer.kind,
                        mid,
                        &params,
                        MediaDirection::SendOnly,
                        &server,
                        "actpass",
                    ));
                }
                None => {
                    let kind = kinds.get(consumer_id).copied().unwrap_or(MediaKind::Audio);
                    sections.push(rejected_section(kind.as_str(), mid, Vec::new()));
                }
            }
        }

        let stream = tx.end_streams.get_mut(stream_id)?;
        let version = stream.bump_sdp_version();
        let offer = server_session(session_id(created_at), version, sections).to_string();
        stream.local_sdp = Some(offer.clone());
        stream.offered_consumers = live.iter().map(|c| c.id.clone()).collect();
        stream.transition(EndStreamState::WaitAnswer)?;

        metrics::record_negotiation("consumer_offer", "built");
        debug!(
            target: "sfu.negotiation",
            stream_id = %stream_id,
            sections = order.len(),
            active = live.len(),
            version = version,
            "Offer built"
        );
        Ok(Some(offer))
    }

    /// Apply a client answer on a consumer-side stream: connect the
    /// transport with the client as DTLS client, then resume every offered
    /// consumer.
    ///
    /// Returns whether a renegotiation deferred during `wait-answer` now
    /// needs a fresh server offer.
    pub fn apply_answer(
        tx: &mut Transaction<'_>,
        stream_id: &str,
        answer: &str,
    ) -> Result<bool, SfuError> {
        let stream = tx.end_streams.get(stream_id)?;
        if stream.direction != TransportDirection::Recv {
            return Err(SfuError::InvalidState(format!(
                "stream {stream_id} is client-offered"
            )));
        }
        if stream.state != EndStreamState::WaitAnswer {
            return Err(SfuError::InvalidState(format!(
                "stream {stream_id} is {}, not awaiting an answer",
                stream.state.as_str()
            )));
        }
        let offered = stream.offered_consumers.clone();

        let sdp = SessionDescription::parse(answer)?;
        let fingerprints = sdp.fingerprints();
        if fingerprints.is_empty() {
            return Err(SfuError::Negotiation(
                "answer carries no DTLS fingerprint".to_string(),
            ));
        }
        LifecycleService::connect_transport(
            tx,
            stream_id,
            DtlsParameters {
                role: DtlsRole::Client,
                fingerprints,
            },
        )?;

        for consumer_id in &offered {
            let resumable = tx
                .consumers
                .find(consumer_id)
                .is_some_and(|c| c.state == StreamState::Created && c.paused);
            if resumable {
                LifecycleService::unpause_consumer(tx, consumer_id)?;
            }
        }

        let stream = tx.end_streams.get_mut(stream_id)?;
        stream.remote_sdp = Some(answer.to_string());
        stream.transition(EndStreamState::Online)?;
        let renegotiate = if stream.renegotiate_pending {
            stream.renegotiate_pending = false;
            stream.request_renegotiation()?
        } else {
            false
        };

        debug!(
            target: "sfu.negotiation",
            stream_id = %stream_id,
            resumed = offered.len(),
            renegotiate = renegotiate,
            "Answer applied"
        );
        Ok(renegotiate)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::rtp::{
        default_router_codecs, RtcpParameters, RtpCodecParameters, RtpEncodingParameters,
    };
    use crate::models::transport::{DtlsFingerprint, IceCandidate, IceParameters, IceProtocol};
    use crate::models::{
        CallRecord, ProducerRecord, RouterRecord, RouterState, ServerParameters, Sources,
        TransportRecord,
    };
    use crate::negotiation::end_stream::EndStreamRecord;
    use crate::queue::{EventBus, QueueKind, WorkQueue};
    use crate::repositories::ResourceStore;
    use std::sync::Arc;

    const SPEAKER_OFFER: &str = "v=0\r\n\
o=- 42 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=fingerprint:sha-256 AB:CD:EF:01\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=ssrc:1001 cname:alice\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=ssrc-group:FID 2001 2002\r\n\
a=ssrc:2001 cname:alice\r\n\
a=ssrc:2002 cname:alice\r\n";

    const LISTENER_ANSWER: &str = "v=0\r\n\
o=- 7 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=fingerprint:sha-256 12:34:56:78\r\n\
a=setup:active\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:0\r\n\
a=recvonly\r\n";

    fn store() -> ResourceStore {
        ResourceStore::new(Arc::new(WorkQueue::new()), Arc::new(EventBus::new()))
    }

    fn server() -> ServerParameters {
        ServerParameters {
            ice_parameters: IceParameters {
                username_fragment: "srvufrag".to_string(),
                password: "srvpassword".to_string(),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1076302079,
                ip: "203.0.113.5".to_string(),
                port: 40000,
                protocol: IceProtocol::Udp,
                tcp_type: None,
            }],
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    fn opus() -> RtpParameters {
        RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: BTreeMap::new(),
                rtcp_feedback: Vec::new(),
            }],
            header_extensions: Vec::new(),
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(5001),
                rtx: None,
            }],
            rtcp: RtcpParameters {
                cname: Some("sfu".to_string()),
                reduced_size: true,
            },
        }
    }

    fn transport(id: &str, direction: TransportDirection, state: TransportState) -> TransportRecord {
        let now = Utc::now();
        TransportRecord {
            id: id.to_string(),
            router_id: "r1".to_string(),
            call_id: "c1".to_string(),
            peer_id: "p1".to_string(),
            direction,
            state,
            client_parameters: None,
            server_parameters: Some(server()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Call `c1` with peer `p1` owning transport `t1` and its end-stream.
    fn seed(store: &ResourceStore, direction: TransportDirection, sources: Sources) {
        store
            .transact(|tx| {
                let now = Utc::now();
                tx.routers.insert(RouterRecord {
                    id: "r1".to_string(),
                    call_id: "c1".to_string(),
                    worker_id: Some("w1".to_string()),
                    state: RouterState::Created,
                    ip: None,
                    created_at: now,
                    updated_at: now,
                });
                tx.transports
                    .insert(transport("t1", direction, TransportState::Created));
                let (send, recv) = match direction {
                    TransportDirection::Send => (Some("t1".to_string()), None),
                    TransportDirection::Recv => (None, Some("t1".to_string())),
                };
                let peer = PeerRecord {
                    id: "p1".to_string(),
                    role: crate::models::Role::Speaker,
                    sources,
                    capabilities: Default::default(),
                    ip: None,
                    send_transport_id: send,
                    recv_transport_id: recv,
                    consumes: Vec::new(),
                    producers: BTreeMap::new(),
                };
                tx.calls.insert(CallRecord {
                    id: "c1".to_string(),
                    router_id: Some("r1".to_string()),
                    peers: BTreeMap::from([("p1".to_string(), peer)]),
                    created_at: now,
                    updated_at: now,
                });
                tx.end_streams
                    .insert(EndStreamRecord::new("t1", "c1", "p1", direction));
                Ok(())
            })
            .unwrap();
    }

    fn audio_video() -> Sources {
        Sources {
            audio: true,
            video: true,
            screen: false,
        }
    }

    fn hint(source: SourceKind, mid: &str) -> StreamHint {
        StreamHint {
            source,
            mid: mid.to_string(),
        }
    }

    fn remote_producer(id: &str) -> ProducerRecord {
        let now = Utc::now();
        ProducerRecord {
            id: id.to_string(),
            transport_id: "t-remote".to_string(),
            router_id: "r1".to_string(),
            peer_id: "p2".to_string(),
            source: SourceKind::Audio,
            kind: MediaKind::Audio,
            mid: "0".to_string(),
            rtp_parameters: StoredRtpParameters::encode(&opus()).unwrap(),
            paused: false,
            raw_id: Some(format!("raw-{id}")),
            state: StreamState::Created,
            created_at: now,
            updated_at: now,
        }
    }

    fn consumer(id: &str, producer_id: &str, state: StreamState) -> ConsumerRecord {
        let now = Utc::now();
        let created = state == StreamState::Created;
        ConsumerRecord {
            id: id.to_string(),
            transport_id: "t1".to_string(),
            producer_id: producer_id.to_string(),
            router_id: "r1".to_string(),
            kind: MediaKind::Audio,
            rtp_capabilities: Default::default(),
            rtp_parameters: created.then(|| StoredRtpParameters::encode(&opus()).unwrap()),
            paused: true,
            raw_id: created.then(|| format!("raw-{id}")),
            state,
            created_at: now,
            updated_at: now,
        }
    }

    fn mark_consumer_created(tx: &mut Transaction<'_>, id: &str) {
        let consumer = tx.consumers.get_mut(id).unwrap();
        consumer.state = StreamState::Created;
        consumer.rtp_parameters = Some(StoredRtpParameters::encode(&opus()).unwrap());
        consumer.raw_id = Some(format!("raw-{id}"));
    }

    #[test]
    fn test_offer_creates_producers_and_answer_waits_for_them() {
        let store = store();
        seed(&store, TransportDirection::Send, audio_video());
        let hints = [hint(SourceKind::Audio, "0"), hint(SourceKind::Video, "1")];

        let outcome = store
            .transact(|tx| {
                let outcome = NegotiationAdapter::apply_offer(
                    tx,
                    "t1",
                    SPEAKER_OFFER,
                    &hints,
                    &default_router_codecs(),
                )?;
                assert_eq!(NegotiationAdapter::build_producer_answer(tx, "t1")?, None);
                Ok(outcome)
            })
            .unwrap();
        assert_eq!(outcome.created_producers.len(), 2);
        assert_eq!(store.queue().len(QueueKind::ProducerCreate), 2);
        assert_eq!(store.queue().len(QueueKind::TransportConnect), 1);

        let answer = store
            .transact(|tx| {
                tx.transports.get_mut("t1")?.state = TransportState::Connected;
                for id in &outcome.created_producers {
                    tx.producers.get_mut(id)?.state = StreamState::Created;
                }
                NegotiationAdapter::build_producer_answer(tx, "t1")
            })
            .unwrap()
            .unwrap();

        let sdp = SessionDescription::parse(&answer).unwrap();
        assert_eq!(sdp.media.len(), 2);
        assert!(sdp
            .media
            .iter()
            .all(|m| m.direction() == MediaDirection::RecvOnly));
        assert_eq!(sdp.setup(), Some("passive"));

        let stream = store
            .read(|t| t.end_streams.get("t1").cloned())
            .unwrap()
            .unwrap();
        assert_eq!(stream.state, EndStreamState::Online);
        assert_eq!(stream.local_sdp.as_deref(), Some(answer.as_str()));
        assert_eq!(
            stream.source_mids.get(&SourceKind::Video).map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_hint_for_wrong_media_kind_is_rejected_without_side_effects() {
        let store = store();
        seed(&store, TransportDirection::Send, audio_video());

        let err = store
            .transact(|tx| {
                NegotiationAdapter::apply_offer(
                    tx,
                    "t1",
                    SPEAKER_OFFER,
                    &[hint(SourceKind::Audio, "1")],
                    &default_router_codecs(),
                )
            })
            .unwrap_err();
        assert!(matches!(err, SfuError::Negotiation(_)));

        assert!(store.read(|t| t.producers.is_empty()).unwrap());
        assert!(store.queue().is_empty());
        let state = store
            .read(|t| t.end_streams.get("t1").map(|s| s.state))
            .unwrap()
            .unwrap();
        assert_eq!(state, EndStreamState::WaitOffer);
    }

    #[test]
    fn test_hint_for_disabled_source_is_rejected() {
        let store = store();
        seed(
            &store,
            TransportDirection::Send,
            Sources {
                audio: true,
                video: false,
                screen: false,
            },
        );

        let err = store
            .transact(|tx| {
                NegotiationAdapter::apply_offer(
                    tx,
                    "t1",
                    SPEAKER_OFFER,
                    &[hint(SourceKind::Video, "1")],
                    &default_router_codecs(),
                )
            })
            .unwrap_err();
        assert!(matches!(err, SfuError::Negotiation(_)));
    }

    #[test]
    fn test_source_stays_bound_to_its_first_section() {
        let store = store();
        seed(&store, TransportDirection::Send, audio_video());
        store
            .transact(|tx| {
                tx.end_streams
                    .get_mut("t1")?
                    .source_mids
                    .insert(SourceKind::Video, "4".to_string());
                Ok(())
            })
            .unwrap();

        let err = store
            .transact(|tx| {
                NegotiationAdapter::apply_offer(
                    tx,
                    "t1",
                    SPEAKER_OFFER,
                    &[hint(SourceKind::Video, "1")],
                    &default_router_codecs(),
                )
            })
            .unwrap_err();
        assert!(matches!(err, SfuError::Negotiation(msg) if msg.contains("bound")));
    }

    #[test]
    fn test_offer_without_fingerprint_is_rejected() {
        let store = store();
        seed(&store, TransportDirection::Send, audio_video());
        let offer = SPEAKER_OFFER.replace("a=fingerprint:sha-256 AB:CD:EF:01\r\n", "");

        let err = store
            .transact(|tx| {
                NegotiationAdapter::apply_offer(tx, "t1", &offer, &[], &default_router_codecs())
            })
            .unwrap_err();
        assert!(matches!(err, SfuError::Negotiation(_)));
    }

    #[test]
    fn test_empty_offer_is_answered_without_connecting() {
        let store = store();
        seed(&store, TransportDirection::Send, audio_video());
        let offer = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

        let answer = store
            .transact(|tx| {
                NegotiationAdapter::apply_offer(tx, "t1", offer, &[], &default_router_codecs())?;
                NegotiationAdapter::build_producer_answer(tx, "t1")
            })
            .unwrap()
            .unwrap();
        assert!(SessionDescription::parse(&answer).unwrap().media.is_empty());
        assert!(store.queue().is_empty());
    }

    #[test]
    fn test_consumer_offer_waits_for_creation_then_renegotiates_after_answer() {
        let store = store();
        seed(&store, TransportDirection::Recv, audio_video());

        // First consumer still creating: no offer yet.
        let offer = store
            .transact(|tx| {
                tx.producers.insert(remote_producer("pr1"));
                tx.consumers
                    .insert(consumer("k1", "pr1", StreamState::Creating));
                assert!(NegotiationAdapter::refresh_consumer_stream(tx, "t1")?);
                NegotiationAdapter::build_consumer_offer(tx, "t1")
            })
            .unwrap();
        assert_eq!(offer, None);

        let offer = store
            .transact(|tx| {
                mark_consumer_created(tx, "k1");
                NegotiationAdapter::refresh_consumer_stream(tx, "t1")?;
                NegotiationAdapter::build_consumer_offer(tx, "t1")
            })
            .unwrap()
            .unwrap();
        let sdp = SessionDescription::parse(&offer).unwrap();
        assert_eq!(sdp.media.len(), 1);
        let section = sdp.find_media("0").unwrap();
        assert_eq!(section.direction(), MediaDirection::SendOnly);
        assert_eq!(sdp.setup(), Some("actpass"));

        // A second consumer arrives while the offer is out.
        let needs_offer = store
            .transact(|tx| {
                tx.producers.insert(remote_producer("pr2"));
                tx.consumers
                    .insert(consumer("k2", "pr2", StreamState::Creating));
                NegotiationAdapter::refresh_consumer_stream(tx, "t1")
            })
            .unwrap();
        assert!(!needs_offer);

        let renegotiate = store
            .transact(|tx| NegotiationAdapter::apply_answer(tx, "t1", LISTENER_ANSWER))
            .unwrap();
        assert!(renegotiate);
        assert_eq!(store.queue().len(QueueKind::ConsumerUnpause), 1);
        assert_eq!(store.queue().len(QueueKind::TransportConnect), 1);

        let offer = store
            .transact(|tx| {
                mark_consumer_created(tx, "k2");
                NegotiationAdapter::build_consumer_offer(tx, "t1")
            })
            .unwrap()
            .unwrap();
        let sdp = SessionDescription::parse(&offer).unwrap();
        let mids: Vec<&str> = sdp.media.iter().filter_map(|m| m.mid()).collect();
        assert_eq!(mids, vec!["0", "1"]);
        assert!(sdp.origin.session_version > 1);
    }

    #[test]
    fn test_removed_consumer_leaves_rejected_section() {
        let store = store();
        seed(&store, TransportDirection::Recv, audio_video());
        store
            .transact(|tx| {
                tx.producers.insert(remote_producer("pr1"));
                tx.consumers
                    .insert(consumer("k1", "pr1", StreamState::Created));
                NegotiationAdapter::refresh_consumer_stream(tx, "t1")?;
                NegotiationAdapter::build_consumer_offer(tx, "t1")?;
                NegotiationAdapter::apply_answer(tx, "t1", LISTENER_ANSWER)?;
                Ok(())
            })
            .unwrap();

        let offer = store
            .transact(|tx| {
                tx.consumers.get_mut("k1")?.state = StreamState::Deleted;
                assert!(NegotiationAdapter::refresh_consumer_stream(tx, "t1")?);
                NegotiationAdapter::build_consumer_offer(tx, "t1")
            })
            .unwrap()
            .unwrap();

        let sdp = SessionDescription::parse(&offer).unwrap();
        let section = sdp.find_media("0").unwrap();
        assert_eq!(section.port, 0);
        assert_eq!(section.direction(), MediaDirection::Inactive);
    }

    #[test]
    fn test_purged_consumer_keeps_its_media_kind() {
        let store = store();
        seed(&store, TransportDirection::Recv, audio_video());
        store
            .transact(|tx| {
                tx.producers.insert(remote_producer("pr1"));
                let mut video = consumer("k1", "pr1", StreamState::Created);
                video.kind = MediaKind::Video;
                tx.consumers.insert(video);
                NegotiationAdapter::refresh_consumer_stream(tx, "t1")?;
                NegotiationAdapter::build_consumer_offer(tx, "t1")?;
                NegotiationAdapter::apply_answer(tx, "t1", LISTENER_ANSWER)?;
                Ok(())
            })
            .unwrap();

        let offer = store
            .transact(|tx| {
                tx.consumers.remove("k1");
                assert!(NegotiationAdapter::refresh_consumer_stream(tx, "t1")?);
                NegotiationAdapter::build_consumer_offer(tx, "t1")
            })
            .unwrap()
            .unwrap();

        let sdp = SessionDescription::parse(&offer).unwrap();
        let section = sdp.find_media("0").unwrap();
        assert_eq!(section.port, 0);
        assert_eq!(section.media, "video");
    }

    #[test]
    fn test_answer_outside_wait_answer_is_invalid_state() {
        let store = store();
        seed(&store, TransportDirection::Recv, audio_video());

        let err = store
            .transact(|tx| NegotiationAdapter::apply_answer(tx, "t1", LISTENER_ANSWER))
            .unwrap_err();
        assert!(matches!(err, SfuError::InvalidState(_)));
    }
}
