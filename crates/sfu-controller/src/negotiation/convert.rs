//! Conversion between SDP media sections and RTP parameters.

use super::sdp::{Attribute, MediaDescription, MediaDirection, Origin, RtpMap, SessionDescription};
use crate::errors::SfuError;
use crate::models::rtp::{RtcpParameters, RtpEncodingParameters, RtxParameters};
use crate::models::{MediaKind, RtpCodecCapability, RtpCodecParameters, RtpParameters, ServerParameters};

const PROTOCOL: &str = "UDP/TLS/RTP/SAVPF";
const NULL_CONNECTION: &str = "IN IP4 0.0.0.0";

fn codec_from_rtpmap(kind: MediaKind, section: &MediaDescription, map: &RtpMap) -> RtpCodecParameters {
    RtpCodecParameters {
        mime_type: format!("{}/{}", kind.as_str(), map.encoding),
        payload_type: map.payload_type,
        clock_rate: map.clock_rate,
        channels: map.channels,
        parameters: section.fmtp(map.payload_type),
        rtcp_feedback: section.rtcp_feedback(map.payload_type),
    }
}

/// RTP parameters a client sends on `section`.
///
/// Codecs are taken in offer order; the first one the router supports wins,
/// together with its RTX partner if one is offered.
///
/// # Errors
///
/// `SfuError::Negotiation` if the section is not audio/video, is malformed,
/// or offers no codec the router supports.
pub fn rtp_parameters_from_section(
    section: &MediaDescription,
    router_codecs: &[RtpCodecCapability],
) -> Result<RtpParameters, SfuError> {
    let mid = section.mid().unwrap_or("?");
    let kind = section.kind().ok_or_else(|| {
        SfuError::Negotiation(format!("section {mid} has unsupported media {}", section.media))
    })?;
    let rtpmaps = section.rtpmaps()?;

    let primary = rtpmaps
        .iter()
        .filter(|map| !map.encoding.eq_ignore_ascii_case("rtx"))
        .map(|map| codec_from_rtpmap(kind, section, map))
        .find(|codec| {
            router_codecs
                .iter()
                .any(|cap| cap.kind == kind && cap.matches(codec))
        })
        .ok_or_else(|| {
            SfuError::Negotiation(format!("section {mid} offers no supported codec"))
        })?;

    let apt = primary.payload_type.to_string();
    let rtx = rtpmaps
        .iter()
        .filter(|map| map.encoding.eq_ignore_ascii_case("rtx"))
        .map(|map| codec_from_rtpmap(kind, section, map))
        .find(|codec| codec.parameters.get("apt") == Some(&apt));

    let ssrc = section.ssrc_info();
    let encodings = match ssrc.ssrc {
        Some(primary_ssrc) => vec![RtpEncodingParameters {
            ssrc: Some(primary_ssrc),
            rtx: rtx
                .as_ref()
                .and(ssrc.rtx_ssrc)
                .map(|ssrc| RtxParameters { ssrc }),
        }],
        None => Vec::new(),
    };

    let mut codecs = vec![primary];
    codecs.extend(rtx);

    Ok(RtpParameters {
        mid: section.mid().map(str::to_string),
        codecs,
        header_extensions: section.header_extensions()?,
        encodings,
        rtcp: RtcpParameters {
            cname: ssrc.cname,
            reduced_size: section.has_attribute("rtcp-rsize"),
        },
    })
}

fn rtpmap_value(codec: &RtpCodecParameters) -> String {
    match codec.channels {
        Some(channels) if channels > 1 => format!(
            "{} {}/{}/{}",
            codec.payload_type,
            codec.name(),
            codec.clock_rate,
            channels
        ),
        _ => format!("{} {}/{}", codec.payload_type, codec.name(), codec.clock_rate),
    }
}

/// An accepted media section carrying `params` over the transport
/// described by `server`.
pub fn active_section(
    kind: MediaKind,
    mid: &str,
    params: &RtpParameters,
    direction: MediaDirection,
    server: &ServerParameters,
    setup: &str,
) -> MediaDescription {
    let mut section = MediaDescription::new(kind.as_str(), 9, PROTOCOL);
    section.formats = params
        .codecs
        .iter()
        .map(|c| c.payload_type.to_string())
        .collect();
    section.connection = Some(NULL_CONNECTION.to_string());

    section.push_attribute(Attribute::new(
        "ice-ufrag",
        server.ice_parameters.username_fragment.as_str(),
    ));
    section.push_attribute(Attribute::new("ice-pwd", server.ice_parameters.password.as_str()));
    for fingerprint in &server.fingerprints {
        section.push_attribute(Attribute::new(
            "fingerprint",
            format!("{} {}", fingerprint.algorithm, fingerprint.value),
        ));
    }
    section.push_attribute(Attribute::new("setup", setup));
    section.push_attribute(Attribute::new("mid", mid));
    section.push_attribute(Attribute::flag(direction.as_str()));
    section.push_attribute(Attribute::flag("rtcp-mux"));
    if params.rtcp.reduced_size {
        section.push_attribute(Attribute::flag("rtcp-rsize"));
    }

    for extension in &params.header_extensions {
        section.push_attribute(Attribute::new(
            "extmap",
            format!("{} {}", extension.id, extension.uri),
        ));
    }

    for codec in &params.codecs {
        section.push_attribute(Attribute::new("rtpmap", rtpmap_value(codec)));
        for feedback in &codec.rtcp_feedback {
            let value = if feedback.parameter.is_empty() {
                format!("{} {}", codec.payload_type, feedback.kind)
            } else {
                format!(
                    "{} {} {}",
                    codec.payload_type, feedback.kind, feedback.parameter
                )
            };
            section.push_attribute(Attribute::new("rtcp-fb", value));
        }
        if !codec.parameters.is_empty() {
            let fmtp = codec
                .parameters
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(";");
            section.push_attribute(Attribute::new(
                "fmtp",
                format!("{} {fmtp}", codec.payload_type),
            ));
        }
    }

    if direction == MediaDirection::SendOnly {
        push_ssrc_lines(&mut section, params);
    }

    for candidate in &server.ice_candidates {
        section.push_attribute(Attribute::new("candidate", candidate.to_sdp_value()));
    }
    section.push_attribute(Attribute::flag("end-of-candidates"));
    section
}

fn push_ssrc_lines(section: &mut MediaDescription, params: &RtpParameters) {
    let Some(encoding) = params.encodings.first() else {
        return;
    };
    let Some(ssrc) = encoding.ssrc else {
        return;
    };
    let cname = params.rtcp.cname.as_deref().unwrap_or("sfu");
    if let Some(rtx) = encoding.rtx {
        section.push_attribute(Attribute::new(
            "ssrc-group",
            format!("FID {ssrc} {}", rtx.ssrc),
        ));
        section.push_attribute(Attribute::new("ssrc", format!("{ssrc} cname:{cname}")));
        section.push_attribute(Attribute::new("ssrc", format!("{} cname:{cname}", rtx.ssrc)));
    } else {
        section.push_attribute(Attribute::new("ssrc", format!("{ssrc} cname:{cname}")));
    }
}

/// A rejected (port 0, inactive) section. The mid stays bound so the
/// m-line keeps its position.
pub fn rejected_section(media: &str, mid: &str, formats: Vec<String>) -> MediaDescription {
    let mut section = MediaDescription::new(media, 0, PROTOCOL);
    section.formats = if formats.is_empty() {
        vec!["0".to_string()]
    } else {
        formats
    };
    section.connection = Some(NULL_CONNECTION.to_string());
    section.push_attribute(Attribute::new("mid", mid));
    section.push_attribute(Attribute::flag(MediaDirection::Inactive.as_str()));
    section
}

/// Server session wrapping `media`. Only accepted sections join the bundle.
pub fn server_session(session_id: u64, version: u64, media: Vec<MediaDescription>) -> SessionDescription {
    let mut session = SessionDescription::new(Origin {
        username: "-".to_string(),
        session_id,
        session_version: version,
        address: "0.0.0.0".to_string(),
    });
    session.attributes.push(Attribute::flag("ice-lite"));

    let bundle: Vec<&str> = media
        .iter()
        .filter(|m| m.port != 0)
        .filter_map(MediaDescription::mid)
        .collect();
    if !bundle.is_empty() {
        session
            .attributes
            .push(Attribute::new("group", format!("BUNDLE {}", bundle.join(" "))));
    }
    session
        .attributes
        .push(Attribute::new("msid-semantic", " WMS *"));
    session.media = media;
    session
}
