//! Test fixtures: capabilities, sources, client SDP and geo data.

use sfu_controller::geo::Coordinate;
use sfu_controller::models::rtp::{default_router_codecs, RtpCodecCapability};
use sfu_controller::models::{RtpCapabilities, SourceKind, Sources, WorkerAppData};
use sfu_controller::negotiation::{SessionDescription, StreamHint};
use std::collections::HashMap;
use std::fmt::Write as _;

pub const CLIENT_FINGERPRINT: &str = "sha-256 0A:1B:2C:3D:4E:5F:60:71";

pub fn router_codecs() -> Vec<RtpCodecCapability> {
    default_router_codecs()
}

/// Capabilities of a client that decodes every router codec.
pub fn full_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_router_codecs(),
        header_extensions: Vec::new(),
    }
}

/// Capabilities of a client that only decodes audio.
pub fn audio_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_router_codecs()
            .into_iter()
            .filter(|c| c.mime_type.starts_with("audio/"))
            .collect(),
        header_extensions: Vec::new(),
    }
}

pub fn audio_only() -> Sources {
    Sources {
        audio: true,
        ..Sources::default()
    }
}

pub fn audio_video() -> Sources {
    Sources {
        audio: true,
        video: true,
        screen: false,
    }
}

pub fn worker_app_data(ip: &str) -> WorkerAppData {
    WorkerAppData {
        ip: ip.to_string(),
        endpoint: None,
    }
}

/// A few well-known cities keyed by a documentation-range IP.
pub fn geo_table() -> HashMap<String, Coordinate> {
    [
        ("198.51.100.1", 52.52, 13.40),  // Berlin
        ("198.51.100.2", 48.86, 2.35),   // Paris
        ("198.51.100.3", 40.71, -74.01), // New York
        ("198.51.100.4", 52.37, 4.90),   // Amsterdam
    ]
    .into_iter()
    .filter_map(|(ip, lat, long)| Some((ip.to_string(), Coordinate::new(lat, long)?)))
    .collect()
}

/// Builder for a client offer on a send stream.
///
/// ```rust,ignore
/// let (sdp, hints) = ClientOffer::new()
///     .audio("0")
///     .video("1")
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClientOffer {
    sections: Vec<(SourceKind, String, bool)>,
    version: u64,
}

impl ClientOffer {
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
            version: 1,
        }
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn audio(self, mid: &str) -> Self {
        self.section(SourceKind::Audio, mid, true)
    }

    pub fn video(self, mid: &str) -> Self {
        self.section(SourceKind::Video, mid, true)
    }

    pub fn screen(self, mid: &str) -> Self {
        self.section(SourceKind::Screen, mid, true)
    }

    /// An `inactive` section: the source stopped sending.
    pub fn stopped(self, source: SourceKind, mid: &str) -> Self {
        self.section(source, mid, false)
    }

    pub fn section(mut self, source: SourceKind, mid: &str, sending: bool) -> Self {
        self.sections.push((source, mid.to_string(), sending));
        self
    }

    /// SDP text plus the hints binding each section to its source.
    pub fn build(&self) -> (String, Vec<StreamHint>) {
        let mut sdp = format!(
            "v=0\r\no=- 4611731400430051336 {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.version
        );
        let mids: Vec<&str> = self.sections.iter().map(|(_, mid, _)| mid.as_str()).collect();
        if !mids.is_empty() {
            let _ = write!(sdp, "a=group:BUNDLE {}\r\n", mids.join(" "));
        }
        let mut hints = Vec::new();
        let mut ssrc = 1000u32;
        for (source, mid, sending) in &self.sections {
            ssrc += 10;
            let direction = if *sending { "sendonly" } else { "inactive" };
            let _ = match source.media_kind().as_str() {
                "audio" => write!(
                    sdp,
                    "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
                     a=fingerprint:{CLIENT_FINGERPRINT}\r\n\
                     a=setup:actpass\r\n\
                     a=mid:{mid}\r\n\
                     a={direction}\r\n\
                     a=rtpmap:111 opus/48000/2\r\n\
                     a=fmtp:111 minptime=10;useinbandfec=1\r\n\
                     a=ssrc:{ssrc} cname:client\r\n"
                ),
                _ => write!(
                    sdp,
                    "m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n\
                     a=fingerprint:{CLIENT_FINGERPRINT}\r\n\
                     a=setup:actpass\r\n\
                     a=mid:{mid}\r\n\
                     a={direction}\r\n\
                     a=rtpmap:96 VP8/90000\r\n\
                     a=rtpmap:97 rtx/90000\r\n\
                     a=fmtp:97 apt=96\r\n\
                     a=rtcp-fb:96 nack\r\n\
                     a=rtcp-fb:96 nack pli\r\n\
                     a=ssrc-group:FID {ssrc} {rtx}\r\n\
                     a=ssrc:{ssrc} cname:client\r\n\
                     a=ssrc:{rtx} cname:client\r\n",
                    rtx = ssrc + 1
                ),
            };
            hints.push(StreamHint {
                source: *source,
                mid: mid.clone(),
            });
        }
        (sdp, hints)
    }
}

/// Client answer to a server offer: every active section is accepted
/// `recvonly`, rejected sections stay rejected.
pub fn answer_for(server_offer: &str) -> String {
    let mut sdp = String::from(
        "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
    );
    let _ = write!(sdp, "a=fingerprint:{CLIENT_FINGERPRINT}\r\na=setup:active\r\n");
    let Ok(offer) = SessionDescription::parse(server_offer) else {
        return sdp;
    };
    for media in &offer.media {
        let mid = media.mid().unwrap_or_default();
        let (port, direction) = if media.port == 0 {
            (0, "inactive")
        } else {
            (9, "recvonly")
        };
        let _ = write!(sdp, "m={} {port} {}", media.media, media.protocol);
        for format in &media.formats {
            let _ = write!(sdp, " {format}");
        }
        let _ = write!(sdp, "\r\na=mid:{mid}\r\na={direction}\r\n");
    }
    sdp
}
