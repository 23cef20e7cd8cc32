//! RTP parameter and capability types.
//!
//! These mirror the shapes the media workers exchange (codecs, encodings,
//! header extensions, RTCP). [`StoredRtpParameters`] is the opaque durable
//! form kept on Producer/Consumer records.

use crate::errors::SfuError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Parse an SDP `m=` media type.
    pub fn from_sdp(media: &str) -> Option<Self> {
        match media {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

/// A negotiated codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    /// e.g. `audio/opus`, `video/VP8`, `video/rtx`.
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// fmtp parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    /// Codec name part of the MIME type (`opus`, `VP8`, ...).
    pub fn name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map_or(self.mime_type.as_str(), |(_, name)| name)
    }

    pub fn is_rtx(&self) -> bool {
        self.name().eq_ignore_ascii_case("rtx")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxParameters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default = "default_true")]
    pub reduced_size: bool,
}

fn default_true() -> bool {
    true
}

/// RTP send/receive parameters of a producer or consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// Media codecs, RTX excluded.
    pub fn media_codecs(&self) -> impl Iterator<Item = &RtpCodecParameters> {
        self.codecs.iter().filter(|c| !c.is_rtx())
    }
}

/// A codec a router or endpoint is able to handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    /// Same codec family (MIME type, clock rate, channels).
    pub fn matches(&self, codec: &RtpCodecParameters) -> bool {
        self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            && self.clock_rate == codec.clock_rate
            && (self.kind == MediaKind::Video || self.channels == codec.channels)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
}

impl RtpCapabilities {
    pub fn supports(&self, codec: &RtpCodecParameters) -> bool {
        self.codecs.iter().any(|cap| cap.matches(codec))
    }
}

/// Default media codecs every router is created with.
pub fn default_router_codecs() -> Vec<RtpCodecCapability> {
    let nack = |kind: &str, parameter: &str| RtcpFeedback {
        kind: kind.to_string(),
        parameter: parameter.to_string(),
    };
    let video_feedback = vec![
        nack("nack", ""),
        nack("nack", "pli"),
        nack("ccm", "fir"),
        nack("goog-remb", ""),
        nack("transport-cc", ""),
    ];

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: Some(111),
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::from([
                ("minptime".to_string(), "10".to_string()),
                ("useinbandfec".to_string(), "1".to_string()),
            ]),
            rtcp_feedback: vec![nack("transport-cc", "")],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: Some(96),
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: video_feedback.clone(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: Some(102),
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::from([
                ("level-asymmetry-allowed".to_string(), "1".to_string()),
                ("packetization-mode".to_string(), "1".to_string()),
                ("profile-level-id".to_string(), "42e01f".to_string()),
            ]),
            rtcp_feedback: video_feedback,
        },
    ]
}

/// Durable representation of [`RtpParameters`] on store records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRtpParameters(String);

impl StoredRtpParameters {
    pub fn encode(params: &RtpParameters) -> Result<Self, SfuError> {
        serde_json::to_string(params)
            .map(Self)
            .map_err(|e| SfuError::Store(format!("failed to encode RTP parameters: {e}")))
    }

    pub fn decode(&self) -> Result<RtpParameters, SfuError> {
        serde_json::from_str(&self.0)
            .map_err(|e| SfuError::Store(format!("failed to decode RTP parameters: {e}")))
    }
}
