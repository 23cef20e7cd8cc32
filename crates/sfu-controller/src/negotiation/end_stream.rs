//! Per-transport negotiation state.
//!
//! ```text
//! consumer side:  need-offer -> wait-answer -> online
//! producer side:  wait-offer -> need-answer -> online
//! ```
//!
//! `online` may go back to `need-offer` (server renegotiates) or to
//! `wait-offer`/`need-answer` (client renegotiates). Every state change bumps
//! `seq`, which the signaling layer uses to discard stale messages.

use crate::errors::SfuError;
use crate::models::{MediaKind, SourceKind, TransportDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndStreamState {
    /// Server owes the client an offer.
    NeedOffer,
    /// Server offer sent; waiting for the client answer.
    WaitAnswer,
    /// Waiting for the client to offer.
    WaitOffer,
    /// Client offer received; server owes an answer.
    NeedAnswer,
    Online,
}

impl EndStreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            EndStreamState::NeedOffer => "need-offer",
            EndStreamState::WaitAnswer => "wait-answer",
            EndStreamState::WaitOffer => "wait-offer",
            EndStreamState::NeedAnswer => "need-answer",
            EndStreamState::Online => "online",
        }
    }

    fn allows(self, next: EndStreamState) -> bool {
        use EndStreamState::*;
        matches!(
            (self, next),
            (NeedOffer, WaitAnswer)
                | (WaitAnswer, Online)
                | (WaitOffer, NeedAnswer)
                | (NeedAnswer, NeedAnswer)
                | (NeedAnswer, Online)
                | (NeedAnswer, WaitOffer)
                | (Online, NeedOffer)
                | (Online, WaitOffer)
                | (Online, NeedAnswer)
        )
    }
}

/// Negotiation record of one transport. The stream id is the transport id.
#[derive(Debug, Clone, PartialEq)]
pub struct EndStreamRecord {
    pub id: String,
    pub call_id: String,
    pub peer_id: String,
    pub direction: TransportDirection,
    pub state: EndStreamState,
    pub seq: u64,
    /// Producer side: media-section id bound to each source. Once bound a
    /// source's mid never changes.
    pub source_mids: BTreeMap<SourceKind, String>,
    /// Consumer side: media-section id assigned to each consumer.
    pub consumer_mids: BTreeMap<String, String>,
    /// Media kind of each consumer with a mid; its section outlives the row.
    pub consumer_kinds: BTreeMap<String, MediaKind>,
    /// Consumer ids in the order their sections were first offered. Sections
    /// keep their position across renegotiations.
    pub section_order: Vec<String>,
    /// Consumers sent as active sections in the latest server offer.
    pub offered_consumers: BTreeSet<String>,
    pub next_mid: u32,
    /// Session version of the server-side SDP.
    pub sdp_version: u64,
    /// Latest SDP produced by the server (answer or offer).
    pub local_sdp: Option<String>,
    /// Latest SDP received from the client.
    pub remote_sdp: Option<String>,
    /// A consumer change arrived while waiting for an answer.
    pub renegotiate_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EndStreamRecord {
    pub fn new(
        transport_id: &str,
        call_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> Self {
        let now = Utc::now();
        let state = match direction {
            TransportDirection::Send => EndStreamState::WaitOffer,
            TransportDirection::Recv => EndStreamState::NeedOffer,
        };
        Self {
            id: transport_id.to_string(),
            call_id: call_id.to_string(),
            peer_id: peer_id.to_string(),
            direction,
            state,
            seq: 0,
            source_mids: BTreeMap::new(),
            consumer_mids: BTreeMap::new(),
            consumer_kinds: BTreeMap::new(),
            section_order: Vec::new(),
            offered_consumers: BTreeSet::new(),
            next_mid: 0,
            sdp_version: 0,
            local_sdp: None,
            remote_sdp: None,
            renegotiate_pending: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, bumping `seq`.
    pub fn transition(&mut self, next: EndStreamState) -> Result<(), SfuError> {
        if !self.state.allows(next) {
            return Err(SfuError::InvalidState(format!(
                "stream {} cannot go from {} to {}",
                self.id,
                self.state.as_str(),
                next.as_str()
            )));
        }
        self.state = next;
        self.seq = self.seq.saturating_add(1);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Server-initiated renegotiation of a consumer-side stream.
    ///
    /// Returns `true` if the stream now needs an offer. A request arriving
    /// while an offer is outstanding is remembered and replayed once the
    /// answer lands.
    pub fn request_renegotiation(&mut self) -> Result<bool, SfuError> {
        match self.state {
            EndStreamState::NeedOffer => Ok(true),
            EndStreamState::WaitAnswer => {
                self.renegotiate_pending = true;
                Ok(false)
            }
            EndStreamState::Online => {
                self.transition(EndStreamState::NeedOffer)?;
                Ok(true)
            }
            EndStreamState::WaitOffer | EndStreamState::NeedAnswer => Ok(false),
        }
    }

    /// Ask the client for a fresh offer on a producer-side stream.
    pub fn request_offer(&mut self) -> Result<(), SfuError> {
        match self.state {
            EndStreamState::WaitOffer => Ok(()),
            EndStreamState::NeedAnswer | EndStreamState::Online => {
                self.transition(EndStreamState::WaitOffer)
            }
            EndStreamState::NeedOffer | EndStreamState::WaitAnswer => {
                Err(SfuError::InvalidState(format!(
                    "stream {} is server-offered",
                    self.id
                )))
            }
        }
    }

    /// Allocate the next media-section id.
    pub fn allocate_mid(&mut self) -> String {
        let mid = self.next_mid.to_string();
        self.next_mid = self.next_mid.saturating_add(1);
        mid
    }

    /// Next SDP session version.
    pub fn bump_sdp_version(&mut self) -> u64 {
        self.sdp_version = self.sdp_version.saturating_add(1);
        self.sdp_version
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn consumer_stream() -> EndStreamRecord {
        EndStreamRecord::new("t1", "c1", "p1", TransportDirection::Recv)
    }

    fn producer_stream() -> EndStreamRecord {
        EndStreamRecord::new("t2", "c1", "p1", TransportDirection::Send)
    }

    #[test]
    fn test_initial_states() {
        assert_eq!(consumer_stream().state, EndStreamState::NeedOffer);
        assert_eq!(producer_stream().state, EndStreamState::WaitOffer);
    }

    #[test]
    fn test_offer_answer_paths_bump_seq() {
        let mut stream = consumer_stream();
        stream.transition(EndStreamState::WaitAnswer).unwrap();
        stream.transition(EndStreamState::Online).unwrap();
        assert_eq!(stream.seq, 2);

        let mut stream = producer_stream();
        stream.transition(EndStreamState::NeedAnswer).unwrap();
        stream.transition(EndStreamState::Online).unwrap();
        assert_eq!(stream.seq, 2);
    }

    #[test]
    fn test_wrong_order_is_invalid_state() {
        let mut stream = consumer_stream();
        let err = stream.transition(EndStreamState::Online).unwrap_err();
        assert!(matches!(err, SfuError::InvalidState(_)));
        assert_eq!(stream.seq, 0);
        assert_eq!(stream.state, EndStreamState::NeedOffer);
    }

    #[test]
    fn test_renegotiation_deferred_while_waiting_for_answer() {
        let mut stream = consumer_stream();
        stream.transition(EndStreamState::WaitAnswer).unwrap();

        assert!(!stream.request_renegotiation().unwrap());
        assert!(stream.renegotiate_pending);
        assert_eq!(stream.state, EndStreamState::WaitAnswer);

        stream.transition(EndStreamState::Online).unwrap();
        assert!(stream.request_renegotiation().unwrap());
        assert_eq!(stream.state, EndStreamState::NeedOffer);
    }

    #[test]
    fn test_request_offer() {
        let mut stream = producer_stream();
        stream.request_offer().unwrap();
        assert_eq!(stream.seq, 0);

        stream.transition(EndStreamState::NeedAnswer).unwrap();
        stream.transition(EndStreamState::Online).unwrap();
        stream.request_offer().unwrap();
        assert_eq!(stream.state, EndStreamState::WaitOffer);

        assert!(consumer_stream().request_offer().is_err());
    }

    #[test]
    fn test_mid_allocation_is_sequential() {
        let mut stream = consumer_stream();
        assert_eq!(stream.allocate_mid(), "0");
        assert_eq!(stream.allocate_mid(), "1");
    }
}
