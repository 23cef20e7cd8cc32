//! ICE/DTLS parameter types for WebRTC transports.

use serde::{Deserialize, Serialize};

/// DTLS role of the remote (client) endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

impl DtlsRole {
    /// Role of the endpoint that wrote `a=setup:<value>`.
    ///
    /// `actpass` leaves the choice to us; we always answer `passive`, which
    /// makes the remote the DTLS client.
    pub fn from_setup(setup: &str) -> Option<Self> {
        match setup {
            "active" | "actpass" => Some(DtlsRole::Client),
            "passive" => Some(DtlsRole::Server),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    /// Hash function, e.g. `sha-256`.
    pub algorithm: String,
    /// Colon-separated uppercase hex.
    pub value: String,
}

/// DTLS parameters supplied by the client when connecting a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceProtocol {
    Udp,
    Tcp,
}

impl IceProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            IceProtocol::Udp => "udp",
            IceProtocol::Tcp => "tcp",
        }
    }
}

/// A server-side (host) ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub protocol: IceProtocol,
    /// Only meaningful for TCP candidates (`passive`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

impl IceCandidate {
    /// SDP `a=candidate:` value.
    pub fn to_sdp_value(&self) -> String {
        let mut value = format!(
            "{} 1 {} {} {} {} typ host",
            self.foundation,
            self.protocol.as_str(),
            self.priority,
            self.ip,
            self.port
        );
        if let Some(tcp_type) = &self.tcp_type {
            value.push_str(" tcptype ");
            value.push_str(tcp_type);
        }
        value
    }
}

/// Parameters the worker returns once a transport exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerParameters {
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Options for `createWebRtcTransport`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl WebRtcTransportOptions {
    pub fn new(announced_ip: Option<String>) -> Self {
        Self {
            announced_ip,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}
