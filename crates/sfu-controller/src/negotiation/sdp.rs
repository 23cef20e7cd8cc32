//! SDP codec.
//!
//! Parses SDP text into a session plus a list of media descriptions, and
//! serializes them back. Only the subset WebRTC endpoints exchange with an
//! ICE-lite SFU is interpreted; every attribute is preserved verbatim so
//! unknown ones survive a parse/serialize cycle.
//!
//! Each SDP line has the form `<type>=<value>` (RFC 8866 §5).

use crate::errors::SfuError;
use crate::models::rtp::{RtcpFeedback, RtpHeaderExtensionParameters};
use crate::models::transport::DtlsFingerprint;
use crate::models::MediaKind;
use nom::{
    bytes::complete::{take_till1, take_while1},
    character::complete::{anychar, char, digit1, not_line_ending, space1},
    combinator::{all_consuming, map_res, opt, rest},
    multi::many0,
    sequence::{preceded, tuple},
    IResult,
};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdpError {
    #[error("line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },

    #[error("missing v= line")]
    MissingVersion,

    #[error("invalid media description: {0}")]
    InvalidMedia(String),

    #[error("invalid attribute {name}: {value}")]
    InvalidAttribute { name: String, value: String },
}

impl From<SdpError> for SfuError {
    fn from(err: SdpError) -> Self {
        SfuError::Negotiation(format!("malformed SDP: {err}"))
    }
}

// ============================================================================
// Line parsers
// ============================================================================

fn sdp_line(input: &str) -> IResult<&str, (char, &str)> {
    let (input, key) = anychar(input)?;
    let (input, _) = char('=')(input)?;
    let (input, value) = not_line_ending(input)?;
    Ok((input, (key, value.trim())))
}

fn token(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_ascii_whitespace())(input)
}

fn number<T: std::str::FromStr>(input: &str) -> IResult<&str, T> {
    map_res(digit1, |s: &str| s.parse::<T>())(input)
}

/// `m=<media> <port>[/<count>] <proto> <fmt> ...`
fn media_line(input: &str) -> IResult<&str, (&str, u16, &str, Vec<&str>)> {
    let (input, (media, port, _, proto, formats)) = tuple((
        token,
        preceded(space1, number::<u16>),
        opt(preceded(char('/'), digit1)),
        preceded(space1, token),
        many0(preceded(space1, token)),
    ))(input)?;
    Ok((input, (media, port, proto, formats)))
}

/// `o=<username> <sess-id> <sess-version> IN IP4 <address>`
fn origin_line(input: &str) -> IResult<&str, (&str, u64, u64, &str)> {
    let (input, (username, session_id, session_version, _, _, address)) = tuple((
        token,
        preceded(space1, number::<u64>),
        preceded(space1, number::<u64>),
        preceded(space1, token),
        preceded(space1, token),
        preceded(space1, token),
    ))(input)?;
    Ok((input, (username, session_id, session_version, address)))
}

/// `a=<name>[:<value>]`
fn attribute_line(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    tuple((
        take_till1(|c: char| c == ':'),
        opt(preceded(char(':'), rest)),
    ))(input)
}

/// `a=rtpmap:<pt> <encoding>/<clock>[/<channels>]`
fn rtpmap_value(input: &str) -> IResult<&str, (u8, &str, u32, Option<u8>)> {
    tuple((
        number::<u8>,
        preceded(space1, take_till1(|c: char| c == '/')),
        preceded(char('/'), number::<u32>),
        opt(preceded(char('/'), number::<u8>)),
    ))(input)
}

/// `a=extmap:<id>[/<direction>] <uri>`
fn extmap_value(input: &str) -> IResult<&str, (u8, &str)> {
    let (input, (id, _, uri)) = tuple((
        number::<u8>,
        opt(preceded(char('/'), take_while1(|c: char| c.is_ascii_alphabetic()))),
        preceded(space1, token),
    ))(input)?;
    Ok((input, (id, uri)))
}

fn parse_with<'a, T>(
    parser: impl FnMut(&'a str) -> IResult<&'a str, T>,
    name: &str,
    value: &'a str,
) -> Result<T, SdpError> {
    all_consuming(parser)(value)
        .map(|(_, parsed)| parsed)
        .map_err(|_| SdpError::InvalidAttribute {
            name: name.to_string(),
            value: value.to_string(),
        })
}

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

impl Attribute {
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.into()),
        }
    }

    pub fn flag(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "a={}:{}", self.name, value),
            None => write!(f, "a={}", self.name),
        }
    }
}

/// A parsed `a=rtpmap` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

/// Primary and retransmission SSRCs of a send stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SsrcInfo {
    pub ssrc: Option<u32>,
    pub rtx_ssrc: Option<u32>,
    pub cname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// `audio`, `video` or `application`.
    pub media: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub connection: Option<String>,
    pub attributes: Vec<Attribute>,
}

impl MediaDescription {
    pub fn new(media: &str, port: u16, protocol: &str) -> Self {
        Self {
            media: media.to_string(),
            port,
            protocol: protocol.to_string(),
            formats: Vec::new(),
            connection: None,
            attributes: Vec::new(),
        }
    }

    /// Value of the first attribute called `name`.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.value.as_deref())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }

    /// Values of every attribute called `name`.
    pub fn attribute_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.attributes
            .iter()
            .filter(move |a| a.name == name)
            .filter_map(|a| a.value.as_deref())
    }

    pub fn push_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn mid(&self) -> Option<&str> {
        self.attribute("mid")
    }

    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_sdp(&self.media)
    }

    /// Direction attribute; a rejected section (port 0) is inactive.
    pub fn direction(&self) -> MediaDirection {
        if self.port == 0 {
            return MediaDirection::Inactive;
        }
        self.attributes
            .iter()
            .find_map(|a| {
                if a.value.is_none() {
                    MediaDirection::parse(&a.name)
                } else {
                    None
                }
            })
            .unwrap_or(MediaDirection::SendRecv)
    }

    pub fn rtpmaps(&self) -> Result<Vec<RtpMap>, SdpError> {
        self.attribute_values("rtpmap")
            .map(|value| {
                let (payload_type, encoding, clock_rate, channels) =
                    parse_with(rtpmap_value, "rtpmap", value)?;
                Ok(RtpMap {
                    payload_type,
                    encoding: encoding.to_string(),
                    clock_rate,
                    channels,
                })
            })
            .collect()
    }

    /// Format parameters of `payload_type`.
    pub fn fmtp(&self, payload_type: u8) -> BTreeMap<String, String> {
        let pt = payload_type.to_string();
        self.attribute_values("fmtp")
            .filter_map(|value| value.split_once(' '))
            .filter(|(fmt, _)| *fmt == pt)
            .flat_map(|(_, params)| params.split(';'))
            .filter_map(|param| {
                let param = param.trim();
                if param.is_empty() {
                    return None;
                }
                Some(match param.split_once('=') {
                    Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
                    None => (param.to_string(), String::new()),
                })
            })
            .collect()
    }

    /// `a=rtcp-fb` entries for `payload_type` (wildcard entries included).
    pub fn rtcp_feedback(&self, payload_type: u8) -> Vec<RtcpFeedback> {
        let pt = payload_type.to_string();
        self.attribute_values("rtcp-fb")
            .filter_map(|value| {
                let mut parts = value.split_whitespace();
                let fmt = parts.next()?;
                if fmt != pt && fmt != "*" {
                    return None;
                }
                let kind = parts.next()?.to_string();
                let parameter = parts.collect::<Vec<_>>().join(" ");
                Some(RtcpFeedback { kind, parameter })
            })
            .collect()
    }

    pub fn header_extensions(&self) -> Result<Vec<RtpHeaderExtensionParameters>, SdpError> {
        self.attribute_values("extmap")
            .map(|value| {
                let (id, uri) = parse_with(extmap_value, "extmap", value)?;
                Ok(RtpHeaderExtensionParameters {
                    uri: uri.to_string(),
                    id,
                })
            })
            .collect()
    }

    /// Primary SSRC, its FID (RTX) partner and CNAME.
    pub fn ssrc_info(&self) -> SsrcInfo {
        let mut info = SsrcInfo::default();
        for group in self.attribute_values("ssrc-group") {
            let mut parts = group.split_whitespace();
            if parts.next() == Some("FID") {
                info.ssrc = parts.next().and_then(|s| s.parse().ok());
                info.rtx_ssrc = parts.next().and_then(|s| s.parse().ok());
                break;
            }
        }
        for line in self.attribute_values("ssrc") {
            let Some((ssrc, attr)) = line.split_once(' ') else {
                continue;
            };
            let Ok(ssrc) = ssrc.parse::<u32>() else {
                continue;
            };
            if info.ssrc.is_none() {
                info.ssrc = Some(ssrc);
            }
            if info.cname.is_none() {
                if let Some(cname) = attr.strip_prefix("cname:") {
                    info.cname = Some(cname.to_string());
                }
            }
        }
        info
    }

    /// Media-level DTLS fingerprints.
    pub fn fingerprints(&self) -> Vec<DtlsFingerprint> {
        self.attribute_values("fingerprint")
            .filter_map(parse_fingerprint)
            .collect()
    }
}

fn parse_fingerprint(value: &str) -> Option<DtlsFingerprint> {
    let (algorithm, value) = value.trim().split_once(' ')?;
    Some(DtlsFingerprint {
        algorithm: algorithm.to_ascii_lowercase(),
        value: value.trim().to_ascii_uppercase(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: u64,
    pub session_version: u64,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub origin: Origin,
    pub session_name: String,
    pub attributes: Vec<Attribute>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            session_name: "-".to_string(),
            attributes: Vec::new(),
            media: Vec::new(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, SdpError> {
        let mut origin = None;
        let mut session_name = String::from("-");
        let mut attributes = Vec::new();
        let mut media: Vec<MediaDescription> = Vec::new();
        let mut seen_version = false;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            if raw.trim().is_empty() {
                continue;
            }
            let (_, (key, value)) = all_consuming(sdp_line)(raw.trim_end()).map_err(|_| {
                SdpError::InvalidLine {
                    line,
                    reason: "expected <type>=<value>".to_string(),
                }
            })?;

            match key {
                'v' => seen_version = true,
                'o' => {
                    let (_, (username, session_id, session_version, address)) =
                        all_consuming(origin_line)(value).map_err(|_| SdpError::InvalidLine {
                            line,
                            reason: "malformed origin".to_string(),
                        })?;
                    origin = Some(Origin {
                        username: username.to_string(),
                        session_id,
                        session_version,
                        address: address.to_string(),
                    });
                }
                's' => session_name = value.to_string(),
                'm' => {
                    let (_, (kind, port, protocol, formats)) = all_consuming(media_line)(value)
                        .map_err(|_| SdpError::InvalidMedia(value.to_string()))?;
                    let mut description = MediaDescription::new(kind, port, protocol);
                    description.formats = formats.into_iter().map(str::to_string).collect();
                    media.push(description);
                }
                'c' => {
                    if let Some(current) = media.last_mut() {
                        current.connection = Some(value.to_string());
                    }
                }
                'a' => {
                    let (_, (name, attr_value)) =
                        all_consuming(attribute_line)(value).map_err(|_| SdpError::InvalidLine {
                            line,
                            reason: "malformed attribute".to_string(),
                        })?;
                    let attribute = Attribute {
                        name: name.to_string(),
                        value: attr_value.map(str::to_string),
                    };
                    match media.last_mut() {
                        Some(current) => current.attributes.push(attribute),
                        None => attributes.push(attribute),
                    }
                }
                // t=, b=, i=, ... carry nothing we act on.
                _ => {}
            }
        }

        if !seen_version {
            return Err(SdpError::MissingVersion);
        }

        Ok(Self {
            origin: origin.unwrap_or(Origin {
                username: "-".to_string(),
                session_id: 0,
                session_version: 0,
                address: "0.0.0.0".to_string(),
            }),
            session_name,
            attributes,
            media,
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.value.as_deref())
    }

    pub fn find_media(&self, mid: &str) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.mid() == Some(mid))
    }

    /// DTLS fingerprints: session level first, else the first media section
    /// that carries any.
    pub fn fingerprints(&self) -> Vec<DtlsFingerprint> {
        let session: Vec<DtlsFingerprint> = self
            .attributes
            .iter()
            .filter(|a| a.name == "fingerprint")
            .filter_map(|a| a.value.as_deref())
            .filter_map(parse_fingerprint)
            .collect();
        if !session.is_empty() {
            return session;
        }
        self.media
            .iter()
            .map(MediaDescription::fingerprints)
            .find(|fingerprints| !fingerprints.is_empty())
            .unwrap_or_default()
    }

    /// `a=setup` value, media level taking precedence.
    pub fn setup(&self) -> Option<&str> {
        self.media
            .iter()
            .find_map(|m| m.attribute("setup"))
            .or_else(|| self.attribute("setup"))
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o={} {} {} IN IP4 {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        write!(f, "t=0 0\r\n")?;
        for attribute in &self.attributes {
            write!(f, "{attribute}\r\n")?;
        }
        for media in &self.media {
            write!(f, "m={} {} {}", media.media, media.port, media.protocol)?;
            for format in &media.formats {
                write!(f, " {format}")?;
            }
            write!(f, "\r\n")?;
            if let Some(connection) = &media.connection {
                write!(f, "c={connection}\r\n")?;
            }
            for attribute in &media.attributes {
                write!(f, "{attribute}\r\n")?;
            }
        }
        Ok(())
    }
}
