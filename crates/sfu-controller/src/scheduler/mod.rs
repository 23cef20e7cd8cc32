//! Scheduler façade.
//!
//! [`CallScheduler`] is the boundary the signaling/API layer calls into.
//! Strategies implement it; [`TracedScheduler`] wraps any strategy with
//! spans, timing logs and negotiation metrics.

mod sfu;
mod traced;

pub use sfu::SfuScheduler;
pub use traced::TracedScheduler;

use crate::context::RequestContext;
use crate::errors::SfuError;
use crate::models::{RtpCapabilities, Role, Sources, TransportDirection};
use crate::negotiation::{EndStreamRecord, EndStreamState, StreamHint};
use crate::queue::LifecycleEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A participant joining a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerJoin {
    pub peer_id: String,
    pub role: Role,
    #[serde(default)]
    pub sources: Sources,
    #[serde(default)]
    pub capabilities: RtpCapabilities,
    /// Client IP, used as the placement hint for a new router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// What the signaling layer sees of one end-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamView {
    pub stream_id: String,
    pub direction: TransportDirection,
    pub state: EndStreamState,
    pub seq: u64,
    /// Latest server SDP: an answer on send streams, an offer on receive
    /// streams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
}

impl From<&EndStreamRecord> for StreamView {
    fn from(stream: &EndStreamRecord) -> Self {
        Self {
            stream_id: stream.id.clone(),
            direction: stream.direction,
            state: stream.state,
            seq: stream.seq,
            sdp: stream.local_sdp.clone(),
        }
    }
}

#[async_trait]
pub trait CallScheduler: Send + Sync {
    async fn on_peer_added(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer: PeerJoin,
    ) -> Result<Vec<StreamView>, SfuError>;

    async fn on_peer_removed(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
    ) -> Result<(), SfuError>;

    async fn on_peer_streams_changed(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        sources: Sources,
    ) -> Result<Vec<StreamView>, SfuError>;

    async fn on_peer_role_changed(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        role: Role,
    ) -> Result<Vec<StreamView>, SfuError>;

    async fn on_stream_offer(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        stream_id: &str,
        offer: &str,
        hints: &[StreamHint],
    ) -> Result<StreamView, SfuError>;

    async fn on_stream_answer(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        stream_id: &str,
        answer: &str,
    ) -> Result<StreamView, SfuError>;

    async fn on_stream_candidate(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        stream_id: &str,
        candidate: &str,
    ) -> Result<(), SfuError>;

    async fn on_stream_failed(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        stream_id: &str,
    ) -> Result<(), SfuError>;

    /// Replace the set of send transports a peer consumes.
    async fn update_consumes(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        consumes: &[String],
    ) -> Result<(), SfuError>;

    /// Live end-streams of a peer.
    async fn peer_streams(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
    ) -> Result<Vec<StreamView>, SfuError>;

    /// React to a committed lifecycle change.
    async fn on_lifecycle_event(
        &self,
        ctx: &RequestContext,
        event: &LifecycleEvent,
    ) -> Result<(), SfuError>;
}
