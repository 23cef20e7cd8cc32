//! Durable records and domain types.
//!
//! Records are the rows of the resource store tables. They are only ever
//! mutated inside a store transaction (see [`crate::repositories`]).

pub mod rtp;
pub mod state;
pub mod transport;

pub use rtp::{
    MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
    StoredRtpParameters,
};
pub use state::{advance, Lifecycle, RouterState, StreamState, TransportState};
pub use transport::{DtlsParameters, DtlsRole, ServerParameters};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generate an opaque resource id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// Workers
// ============================================================================

/// Payload a media worker advertises alongside its health status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAppData {
    /// Public IP of the worker host; also the geo-placement key.
    pub ip: String,
    /// RPC endpoint of the worker process, if it is reachable over HTTP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRecord {
    pub id: String,
    pub healthy: bool,
    pub deleted: bool,
    pub app_data: WorkerAppData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Healthy and not deleted: eligible for placement.
    pub fn is_active(&self) -> bool {
        self.healthy && !self.deleted
    }
}

// ============================================================================
// Media-plane resources
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RouterRecord {
    pub id: String,
    /// Call (conference) this router serves.
    pub call_id: String,
    pub worker_id: Option<String>,
    pub state: RouterState,
    /// Placement hint captured at creation.
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which way media flows from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportDirection {
    /// Client sends media; carries producers.
    Send,
    /// Client receives media; carries consumers.
    Recv,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRecord {
    pub id: String,
    pub router_id: String,
    pub call_id: String,
    pub peer_id: String,
    pub direction: TransportDirection,
    pub state: TransportState,
    pub client_parameters: Option<DtlsParameters>,
    pub server_parameters: Option<ServerParameters>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub id: String,
    pub transport_id: String,
    pub router_id: String,
    pub peer_id: String,
    pub source: SourceKind,
    pub kind: MediaKind,
    /// SDP media-section id the client bound this producer to.
    pub mid: String,
    pub rtp_parameters: StoredRtpParameters,
    pub paused: bool,
    /// Identifier returned by the worker once actually created.
    pub raw_id: Option<String>,
    pub state: StreamState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub id: String,
    pub transport_id: String,
    pub producer_id: String,
    pub router_id: String,
    pub kind: MediaKind,
    /// Receiving endpoint's capabilities, passed to `consume`.
    pub rtp_capabilities: RtpCapabilities,
    /// Negotiated by the worker; absent until created.
    pub rtp_parameters: Option<StoredRtpParameters>,
    pub paused: bool,
    pub raw_id: Option<String>,
    pub state: StreamState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Calls and peers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Speaker,
    Listener,
}

/// Logical media source of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Audio,
    Video,
    Screen,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Audio, SourceKind::Video, SourceKind::Screen];

    pub fn media_kind(self) -> MediaKind {
        match self {
            SourceKind::Audio => MediaKind::Audio,
            SourceKind::Video | SourceKind::Screen => MediaKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Audio => "audio",
            SourceKind::Video => "video",
            SourceKind::Screen => "screen",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sources {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
    #[serde(default)]
    pub screen: bool,
}

impl Sources {
    pub fn contains(&self, source: SourceKind) -> bool {
        match source {
            SourceKind::Audio => self.audio,
            SourceKind::Video => self.video,
            SourceKind::Screen => self.screen,
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = SourceKind> + '_ {
        SourceKind::ALL.into_iter().filter(|s| self.contains(*s))
    }
}

/// A conference participant as seen by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub id: String,
    pub role: Role,
    pub sources: Sources,
    pub capabilities: RtpCapabilities,
    pub ip: Option<String>,
    pub send_transport_id: Option<String>,
    pub recv_transport_id: Option<String>,
    /// Send-transport ids whose producers this peer consumes.
    pub consumes: Vec<String>,
    /// Producer per source on the send transport.
    pub producers: BTreeMap<SourceKind, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub id: String,
    pub router_id: Option<String>,
    pub peers: BTreeMap<String, PeerRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_enabled_order() {
        let sources = Sources {
            audio: true,
            video: false,
            screen: true,
        };
        let enabled: Vec<SourceKind> = sources.enabled().collect();
        assert_eq!(enabled, vec![SourceKind::Audio, SourceKind::Screen]);
    }

    #[test]
    fn test_screen_is_video() {
        assert_eq!(SourceKind::Screen.media_kind(), MediaKind::Video);
        assert_eq!(SourceKind::Audio.media_kind(), MediaKind::Audio);
    }

    #[test]
    fn test_new_id_is_unique() {
        assert_ne!(new_id(), new_id());
    }
}
