//! SDP negotiation: codec, RTP conversion, per-transport state machine and
//! the adapter between client SDP and media resources.

pub mod adapter;
pub mod convert;
pub mod end_stream;
pub mod sdp;

pub use adapter::{NegotiationAdapter, OfferOutcome, StreamHint};
pub use end_stream::{EndStreamRecord, EndStreamState};
pub use sdp::{MediaDirection, SdpError, SessionDescription};
