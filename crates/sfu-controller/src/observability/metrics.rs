//! Metrics definitions for the SFU controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `queue`: one value per [`crate::queue::QueueKind`] (11 values)
//! - `outcome`: success, retry, dropped, no_op
//! - `entity`: router, transport, stream
//! - `state`: bounded by the lifecycle enums
//! - `operation`: peer_added, offer, answer, candidate, ... (scheduler calls);
//!   offer, answer, producer_answer, consumer_offer (negotiations)
//!
//! Resource ids are never used as labels.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ============================================================================
// Work queue metrics
// ============================================================================

/// Record the outcome of one work item invocation.
///
/// Metric: `sfu_work_items_total`, `sfu_work_item_duration_seconds`
/// Labels: `queue`, `outcome`
pub fn record_work_item(queue: &'static str, outcome: &'static str, duration: Duration) {
    histogram!("sfu_work_item_duration_seconds", "queue" => queue).record(duration.as_secs_f64());

    counter!("sfu_work_items_total", "queue" => queue, "outcome" => outcome).increment(1);
}

// ============================================================================
// Placement metrics
// ============================================================================

/// Record a placement decision.
///
/// Metric: `sfu_placements_total`
/// Labels: `outcome` (nearest, fallback, no_workers)
pub fn record_placement(outcome: &'static str) {
    counter!("sfu_placements_total", "outcome" => outcome).increment(1);
}

/// Set the number of active (healthy, non-deleted) workers.
///
/// Metric: `sfu_workers_active`
pub fn set_workers_active(count: usize) {
    gauge!("sfu_workers_active").set(count as f64);
}

// ============================================================================
// Lifecycle metrics
// ============================================================================

/// Record a successful guarded state transition.
///
/// Metric: `sfu_state_transitions_total`
/// Labels: `entity`, `state`
pub fn record_state_transition(entity: &'static str, state: &'static str) {
    counter!("sfu_state_transitions_total", "entity" => entity, "state" => state).increment(1);
}

// ============================================================================
// Scheduler and negotiation metrics
// ============================================================================

/// Record a scheduler façade call.
///
/// Metric: `sfu_scheduler_calls_total`
/// Labels: `operation`, `outcome` (success or the error kind)
pub fn record_scheduler_call(operation: &'static str, outcome: &'static str) {
    counter!("sfu_scheduler_calls_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
}

/// Record an SDP offer/answer step: a client offer or answer, or a server
/// answer or offer being built.
///
/// Metric: `sfu_negotiations_total`
/// Labels: `operation`, `outcome`
pub fn record_negotiation(operation: &'static str, outcome: &'static str) {
    counter!("sfu_negotiations_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
}
