//! HTTP request handlers for the SFU controller.

pub mod calls;
pub mod metrics;
pub mod workers;

pub use calls::{
    add_peer, list_streams, remove_peer, stream_answer, stream_candidate, stream_failed,
    stream_offer, update_consumes, update_role, update_sources,
};
pub use metrics::metrics_handler;
pub use workers::report_worker_status;
