//! End-to-end negotiation through the scheduler, reconcilers and a mock
//! media worker.
//!
//! Each test drives a [`TestCluster`] by hand: façade calls, then `settle()`
//! to run queued work and deliver lifecycle events until nothing is left.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use sfu_controller::context::RequestContext;
use sfu_controller::errors::SfuError;
use sfu_controller::models::{
    DtlsRole, Lifecycle, Role, RouterState, SourceKind, Sources, StreamState, TransportDirection,
    TransportState,
};
use sfu_controller::negotiation::{EndStreamState, MediaDirection, SessionDescription};
use sfu_controller::scheduler::{PeerJoin, StreamView};
use sfu_test_utils::*;
use std::time::Duration;

const CALL: &str = "call-1";

async fn cluster() -> TestCluster {
    TestCluster::builder()
        .worker("w1", "198.51.100.1")
        .build()
        .await
}

fn sections(sdp: &str) -> Vec<(String, u16, MediaDirection)> {
    SessionDescription::parse(sdp)
        .expect("server SDP must parse")
        .media
        .iter()
        .map(|m| (m.mid().unwrap_or_default().to_string(), m.port, m.direction()))
        .collect()
}

fn by_direction(views: &[StreamView], direction: TransportDirection) -> StreamView {
    views
        .iter()
        .find(|v| v.direction == direction)
        .cloned()
        .expect("missing stream")
}

/// Alice speaks audio+video, Bob listens; both fully negotiated.
async fn negotiated_pair() -> TestCluster {
    let cluster = cluster().await;
    cluster.join(CALL, "alice", Role::Speaker, audio_video()).await;
    cluster.join(CALL, "bob", Role::Listener, Sources::default()).await;
    cluster.settle().await;

    cluster
        .offer(CALL, "alice", &ClientOffer::new().audio("0").video("1"))
        .await
        .expect("offer failed");
    cluster.settle().await;
    cluster.answer(CALL, "bob").await.expect("answer failed");
    cluster.settle().await;
    assert!(cluster.is_idle());
    cluster
}

// ============================================================================
// Join and full negotiation
// ============================================================================

#[tokio::test]
async fn test_join_returns_streams_per_role() {
    let cluster = cluster().await;

    let speaker = cluster.join(CALL, "alice", Role::Speaker, audio_only()).await;
    assert_eq!(speaker.len(), 2);
    let send = by_direction(&speaker, TransportDirection::Send);
    let recv = by_direction(&speaker, TransportDirection::Recv);
    assert_eq!(send.state, EndStreamState::WaitOffer);
    assert_eq!(recv.state, EndStreamState::NeedOffer);
    assert!(recv.sdp.is_none());

    let listener = cluster.join(CALL, "bob", Role::Listener, Sources::default()).await;
    assert_eq!(listener.len(), 1);
    assert_eq!(listener[0].direction, TransportDirection::Recv);

    cluster.settle().await;
    assert_eq!(cluster.worker().open_routers().len(), 1, "one router per call");
    assert_eq!(cluster.worker().open_transports().len(), 3);
}

#[tokio::test]
async fn test_speaker_and_listener_negotiate_end_to_end() {
    let cluster = cluster().await;
    cluster.join(CALL, "alice", Role::Speaker, audio_video()).await;
    cluster.join(CALL, "bob", Role::Listener, Sources::default()).await;
    cluster.settle().await;

    // Transport not connected yet: the answer has to wait.
    let view = cluster
        .offer(CALL, "alice", &ClientOffer::new().audio("0").video("1"))
        .await
        .unwrap();
    assert_eq!(view.state, EndStreamState::NeedAnswer);
    assert!(view.sdp.is_none());

    cluster.settle().await;

    let send = cluster
        .stream(CALL, "alice", TransportDirection::Send)
        .await
        .unwrap();
    assert_eq!(send.state, EndStreamState::Online);
    let answer = sections(send.sdp.as_deref().unwrap());
    assert_eq!(answer.len(), 2);
    for (_, port, direction) in &answer {
        assert_ne!(*port, 0);
        assert_eq!(*direction, MediaDirection::RecvOnly);
    }
    let answer_sdp = send.sdp.unwrap();
    assert!(answer_sdp.contains("a=setup:passive"));
    assert!(answer_sdp.contains("a=ice-lite"));

    let recv = cluster
        .stream(CALL, "bob", TransportDirection::Recv)
        .await
        .unwrap();
    assert_eq!(recv.state, EndStreamState::WaitAnswer);
    let offer = sections(recv.sdp.as_deref().unwrap());
    assert_eq!(
        offer.iter().map(|(mid, _, _)| mid.as_str()).collect::<Vec<_>>(),
        vec!["0", "1"]
    );
    assert!(offer.iter().all(|(_, _, d)| *d == MediaDirection::SendOnly));

    // Consumers start paused until the listener answers.
    assert_eq!(cluster.worker().open_producers().len(), 2);
    let consumers = cluster.worker().open_consumers();
    assert_eq!(consumers.len(), 2);
    for consumer_id in &consumers {
        assert_eq!(cluster.worker().consumer_paused(consumer_id), Some(true));
    }

    let view = cluster.answer(CALL, "bob").await.unwrap();
    assert_eq!(view.state, EndStreamState::Online);
    cluster.settle().await;

    for consumer_id in &consumers {
        assert_eq!(cluster.worker().consumer_paused(consumer_id), Some(false));
    }
    let tables = cluster.tables();
    let bob_recv = tables.transports.get(&recv.stream_id).unwrap();
    assert_eq!(bob_recv.state, TransportState::Connected);
    let dtls = cluster.worker().transport_dtls(&recv.stream_id).unwrap();
    assert_eq!(dtls.role, DtlsRole::Client);

    // Alice consumes nobody: her receive stream never needs an offer.
    let alice_recv = cluster
        .stream(CALL, "alice", TransportDirection::Recv)
        .await
        .unwrap();
    assert_eq!(alice_recv.state, EndStreamState::NeedOffer);
    assert!(alice_recv.sdp.is_none());
}

#[tokio::test]
async fn test_late_listener_consumes_existing_producers() {
    let cluster = cluster().await;
    cluster.join(CALL, "alice", Role::Speaker, audio_video()).await;
    cluster.settle().await;
    cluster
        .offer(CALL, "alice", &ClientOffer::new().audio("0").video("1"))
        .await
        .unwrap();
    cluster.settle().await;

    cluster.join(CALL, "carol", Role::Listener, Sources::default()).await;
    cluster.settle().await;

    let recv = cluster
        .stream(CALL, "carol", TransportDirection::Recv)
        .await
        .unwrap();
    assert_eq!(recv.state, EndStreamState::WaitAnswer);
    assert_eq!(sections(recv.sdp.as_deref().unwrap()).len(), 2);
}

#[tokio::test]
async fn test_listener_without_video_codecs_gets_audio_only() {
    let cluster = cluster().await;
    cluster.join(CALL, "alice", Role::Speaker, audio_video()).await;
    cluster
        .try_join(
            CALL,
            PeerJoin {
                peer_id: "dave".to_string(),
                role: Role::Listener,
                sources: Sources::default(),
                capabilities: audio_capabilities(),
                ip: None,
            },
        )
        .await
        .unwrap();
    cluster.settle().await;
    cluster
        .offer(CALL, "alice", &ClientOffer::new().audio("0").video("1"))
        .await
        .unwrap();
    cluster.settle().await;

    let recv = cluster
        .stream(CALL, "dave", TransportDirection::Recv)
        .await
        .unwrap();
    let offer = SessionDescription::parse(recv.sdp.as_deref().unwrap()).unwrap();
    assert_eq!(offer.media.len(), 1);
    assert_eq!(offer.media[0].media, "audio");
}

#[tokio::test]
async fn test_sequence_number_grows_with_every_transition() {
    let cluster = negotiated_pair().await;
    let recv = cluster
        .stream(CALL, "bob", TransportDirection::Recv)
        .await
        .unwrap();
    // need-offer -> wait-answer -> online
    assert_eq!(recv.seq, 2);

    let send = cluster
        .stream(CALL, "alice", TransportDirection::Send)
        .await
        .unwrap();
    // wait-offer -> need-answer -> online
    assert_eq!(send.seq, 2);
}

// ============================================================================
// Leaving
// ============================================================================

#[tokio::test]
async fn test_speaker_leaving_rejects_listener_sections() {
    let cluster = negotiated_pair().await;

    cluster.leave(CALL, "alice").await.unwrap();
    cluster.settle().await;

    let recv = cluster
        .stream(CALL, "bob", TransportDirection::Recv)
        .await
        .unwrap();
    assert_eq!(recv.state, EndStreamState::WaitAnswer);
    let offer = sections(recv.sdp.as_deref().unwrap());
    assert_eq!(offer.len(), 2, "sections keep their position");
    assert!(offer.iter().all(|(_, port, _)| *port == 0));

    assert!(cluster.worker().open_producers().is_empty());
    assert!(cluster.worker().open_consumers().is_empty());
    assert_eq!(cluster.worker().open_routers().len(), 1, "bob still in the call");
    assert_eq!(cluster.worker().open_transports().len(), 1);

    let tables = cluster.tables();
    let call = tables.calls.get(CALL).unwrap();
    assert!(call.peers.get("bob").unwrap().consumes.is_empty());
}

#[tokio::test]
async fn test_last_peer_leaving_deletes_router() {
    let cluster = negotiated_pair().await;

    cluster.leave(CALL, "alice").await.unwrap();
    cluster.leave(CALL, "bob").await.unwrap();
    cluster.settle().await;

    assert!(cluster.worker().open_routers().is_empty());
    assert!(cluster.worker().open_transports().is_empty());

    let tables = cluster.tables();
    assert!(tables.routers.values().all(|r| r.state.is_terminal()));
    assert!(tables.transports.values().all(|t| t.state.is_terminal()));
    assert!(tables.producers.values().all(|p| p.state.is_terminal()));
    assert!(tables.consumers.values().all(|c| c.state.is_terminal()));
    assert!(!tables.calls.contains(CALL));
}

#[tokio::test]
async fn test_call_reuses_new_router_after_emptying() {
    let cluster = cluster().await;
    cluster.join(CALL, "alice", Role::Speaker, audio_only()).await;
    cluster.settle().await;
    cluster.leave(CALL, "alice").await.unwrap();
    cluster.settle().await;

    cluster.join(CALL, "alice", Role::Speaker, audio_only()).await;
    cluster.settle().await;

    let tables = cluster.tables();
    let router_id = tables.calls.get(CALL).unwrap().router_id.clone().unwrap();
    assert_eq!(
        tables.routers.get(&router_id).unwrap().state,
        RouterState::Created
    );
    assert_eq!(cluster.worker().open_routers().len(), 1);
}

#[tokio::test]
async fn test_finished_calls_do_not_accumulate() {
    let cluster = cluster().await;
    for i in 0..50 {
        let call_id = format!("call-{i}");
        cluster.join(&call_id, "alice", Role::Speaker, audio_video()).await;
        cluster.join(&call_id, "bob", Role::Listener, Sources::default()).await;
        cluster.settle().await;
        cluster
            .offer(&call_id, "alice", &ClientOffer::new().audio("0").video("1"))
            .await
            .expect("offer failed");
        cluster.settle().await;
        cluster.answer(&call_id, "bob").await.expect("answer failed");
        cluster.settle().await;
        cluster.leave(&call_id, "alice").await.unwrap();
        cluster.leave(&call_id, "bob").await.unwrap();
        cluster.settle().await;
    }
    assert!(cluster.tables().calls.is_empty());

    let stats = cluster.store().purge_finished(Duration::ZERO).unwrap();
    assert_eq!(stats.routers, 50);
    assert_eq!(stats.transports, 150);

    let tables = cluster.tables();
    assert!(tables.routers.is_empty());
    assert!(tables.transports.is_empty());
    assert!(tables.producers.is_empty());
    assert!(tables.consumers.is_empty());
    assert!(tables.end_streams.is_empty());
    assert_eq!(tables.workers.len(), 1);
}

#[tokio::test]
async fn test_leave_unknown_peer_is_not_found() {
    let cluster = cluster().await;
    cluster.join(CALL, "alice", Role::Speaker, audio_only()).await;

    let result = cluster.leave(CALL, "nobody").await;
    assert!(matches!(result, Err(SfuError::NotFound(_))));
}

// ============================================================================
// Role and source changes
// ============================================================================

#[tokio::test]
async fn test_listener_promoted_to_speaker_is_consumed_by_others() {
    let cluster = negotiated_pair().await;

    let ctx = RequestContext::new("peer_role_changed");
    let views = cluster
        .scheduler()
        .on_peer_role_changed(&ctx, CALL, "bob", Role::Speaker)
        .await
        .unwrap();
    let send = by_direction(&views, TransportDirection::Send);
    assert_eq!(send.state, EndStreamState::WaitOffer);

    let tables = cluster.tables();
    let alice = tables.calls.get(CALL).unwrap().peers.get("alice").unwrap();
    assert!(alice.consumes.contains(&send.stream_id));

    // Bob has no sources enabled yet.
    let ctx = RequestContext::new("peer_streams_changed");
    cluster
        .scheduler()
        .on_peer_streams_changed(&ctx, CALL, "bob", audio_only())
        .await
        .unwrap();
    cluster.settle().await;
    cluster
        .offer(CALL, "bob", &ClientOffer::new().audio("0"))
        .await
        .unwrap();
    cluster.settle().await;

    let recv = cluster
        .stream(CALL, "alice", TransportDirection::Recv)
        .await
        .unwrap();
    assert_eq!(recv.state, EndStreamState::WaitAnswer);
    assert_eq!(sections(recv.sdp.as_deref().unwrap()).len(), 1);
}

#[tokio::test]
async fn test_speaker_demoted_to_listener_drops_send_transport() {
    let cluster = negotiated_pair().await;
    let send = cluster
        .stream(CALL, "alice", TransportDirection::Send)
        .await
        .unwrap();

    let ctx = RequestContext::new("peer_role_changed");
    let views = cluster
        .scheduler()
        .on_peer_role_changed(&ctx, CALL, "alice", Role::Listener)
        .await
        .unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].direction, TransportDirection::Recv);
    cluster.settle().await;

    assert!(!cluster.worker().open_transports().contains(&send.stream_id));
    let recv = cluster
        .stream(CALL, "bob", TransportDirection::Recv)
        .await
        .unwrap();
    assert_eq!(recv.state, EndStreamState::WaitAnswer);
    assert!(sections(recv.sdp.as_deref().unwrap())
        .iter()
        .all(|(_, port, _)| *port == 0));
}

#[tokio::test]
async fn test_disabling_source_removes_its_producer() {
    let cluster = negotiated_pair().await;

    let ctx = RequestContext::new("peer_streams_changed");
    let views = cluster
        .scheduler()
        .on_peer_streams_changed(&ctx, CALL, "alice", audio_only())
        .await
        .unwrap();
    let send = by_direction(&views, TransportDirection::Send);
    assert_eq!(send.state, EndStreamState::WaitOffer, "client must re-offer");

    let tables = cluster.tables();
    let alice = tables.calls.get(CALL).unwrap().peers.get("alice").unwrap();
    assert_eq!(alice.producers.len(), 1);
    assert!(alice.producers.contains_key(&SourceKind::Audio));
    let video = tables
        .producers
        .values()
        .find(|p| p.source == SourceKind::Video)
        .unwrap();
    assert!(video.state.is_removing());

    cluster.settle().await;
    assert_eq!(cluster.worker().open_producers().len(), 1);

    let recv = cluster
        .stream(CALL, "bob", TransportDirection::Recv)
        .await
        .unwrap();
    assert_eq!(recv.state, EndStreamState::WaitAnswer);
    let offer = sections(recv.sdp.as_deref().unwrap());
    assert_eq!(offer.len(), 2);
    assert!(offer.iter().any(|(_, port, _)| *port == 0));
    assert!(offer.iter().any(|(_, port, _)| *port != 0));

    // Transport is connected and audio exists: answered right away.
    let view = cluster
        .offer(CALL, "alice", &ClientOffer::new().version(2).audio("0"))
        .await
        .unwrap();
    assert_eq!(view.state, EndStreamState::Online);
}

#[tokio::test]
async fn test_inactive_section_stops_producer() {
    let cluster = negotiated_pair().await;

    // Renegotiate from online with video stopped.
    let view = cluster
        .offer(
            CALL,
            "alice",
            &ClientOffer::new()
                .version(2)
                .audio("0")
                .stopped(SourceKind::Video, "1"),
        )
        .await
        .unwrap();
    assert_eq!(view.state, EndStreamState::Online);
    let answer = sections(view.sdp.as_deref().unwrap());
    assert_eq!(answer.len(), 2);
    assert_eq!(answer[1].1, 0, "stopped section is rejected");

    cluster.settle().await;
    assert_eq!(cluster.worker().open_producers().len(), 1);
    let tables = cluster.tables();
    assert!(tables
        .producers
        .values()
        .filter(|p| p.source == SourceKind::Video)
        .all(|p| p.state == StreamState::Deleted));
}

// ============================================================================
// Rejections
// ============================================================================

#[tokio::test]
async fn test_joining_twice_is_conflict() {
    let cluster = cluster().await;
    cluster.join(CALL, "alice", Role::Speaker, audio_only()).await;

    let result = cluster
        .try_join(
            CALL,
            PeerJoin {
                peer_id: "alice".to_string(),
                role: Role::Listener,
                sources: Sources::default(),
                capabilities: full_capabilities(),
                ip: None,
            },
        )
        .await;
    assert!(matches!(result, Err(SfuError::InvalidState(_))));
}

#[tokio::test]
async fn test_offer_on_another_peers_stream_is_not_found() {
    let cluster = cluster().await;
    cluster.join(CALL, "alice", Role::Speaker, audio_only()).await;
    cluster.join(CALL, "bob", Role::Speaker, audio_only()).await;
    let alice_send = cluster
        .stream(CALL, "alice", TransportDirection::Send)
        .await
        .unwrap();

    let (sdp, hints) = ClientOffer::new().audio("0").build();
    let ctx = RequestContext::new("offer");
    let result = cluster
        .scheduler()
        .on_stream_offer(&ctx, CALL, "bob", &alice_send.stream_id, &sdp, &hints)
        .await;
    assert!(matches!(result, Err(SfuError::NotFound(_))));
}

#[tokio::test]
async fn test_offer_for_disabled_source_leaves_no_trace() {
    let cluster = cluster().await;
    cluster.join(CALL, "alice", Role::Speaker, audio_only()).await;
    cluster.settle().await;

    let result = cluster
        .offer(CALL, "alice", &ClientOffer::new().audio("0").video("1"))
        .await;
    assert!(matches!(result, Err(SfuError::Negotiation(_))));

    let tables = cluster.tables();
    assert!(tables.producers.is_empty());
    let send = cluster
        .stream(CALL, "alice", TransportDirection::Send)
        .await
        .unwrap();
    assert_eq!(send.state, EndStreamState::WaitOffer);
    assert!(cluster.is_idle());
}

#[tokio::test]
async fn test_answer_without_outstanding_offer_is_conflict() {
    let cluster = negotiated_pair().await;
    let result = cluster.answer(CALL, "bob").await;
    assert!(matches!(result, Err(SfuError::InvalidState(_))));
}

#[tokio::test]
async fn test_unsupported_operations() {
    let cluster = negotiated_pair().await;
    let recv = cluster
        .stream(CALL, "bob", TransportDirection::Recv)
        .await
        .unwrap();
    let ctx = RequestContext::new("candidate");
    let scheduler = cluster.scheduler();

    let candidate = scheduler
        .on_stream_candidate(&ctx, CALL, "bob", &recv.stream_id, "candidate:1 1 udp 1 1.2.3.4 5 typ host")
        .await;
    assert!(matches!(candidate, Err(SfuError::NotSupported(_))));

    let failed = scheduler
        .on_stream_failed(&ctx, CALL, "bob", &recv.stream_id)
        .await;
    assert!(matches!(failed, Err(SfuError::NotSupported(_))));

    let consumes = scheduler
        .update_consumes(&ctx, CALL, "bob", &["t1".to_string()])
        .await;
    assert!(matches!(consumes, Err(SfuError::NotSupported(_))));
}
