//! Lifecycle states for media-plane resources.
//!
//! Every state enum has a total order; [`advance`] only ever moves forward,
//! so an entity can never re-enter `creating` or leave `deleted`.

use crate::observability::metrics;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shared behaviour of the per-entity state enums.
pub trait Lifecycle: Copy + Eq + fmt::Debug {
    /// Entity label used in logs and metrics.
    const ENTITY: &'static str;

    /// Position in the state machine order.
    fn order(self) -> u8;

    fn as_str(self) -> &'static str;

    /// `deleting` or `deleted`.
    fn is_removing(self) -> bool;

    /// `deleted`.
    fn is_terminal(self) -> bool;
}

/// Move `state` to `next` if that is a forward transition.
///
/// Returns `false` and leaves the state untouched otherwise, which is how
/// racing reconciliation workers resolve: the first guarded transition wins
/// and the rest become no-ops.
pub fn advance<S: Lifecycle>(state: &mut S, next: S) -> bool {
    if next.order() <= state.order() {
        return false;
    }
    *state = next;
    metrics::record_state_transition(S::ENTITY, next.as_str());
    true
}

/// Router states: `creating → created → deleting → deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterState {
    Creating,
    Created,
    Deleting,
    Deleted,
}

impl Lifecycle for RouterState {
    const ENTITY: &'static str = "router";

    fn order(self) -> u8 {
        match self {
            RouterState::Creating => 0,
            RouterState::Created => 1,
            RouterState::Deleting => 2,
            RouterState::Deleted => 3,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RouterState::Creating => "creating",
            RouterState::Created => "created",
            RouterState::Deleting => "deleting",
            RouterState::Deleted => "deleted",
        }
    }

    fn is_removing(self) -> bool {
        matches!(self, RouterState::Deleting | RouterState::Deleted)
    }

    fn is_terminal(self) -> bool {
        self == RouterState::Deleted
    }
}

/// Transport states: `creating → created → connecting → connected`, and
/// from any of those `→ deleting → deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Creating,
    Created,
    Connecting,
    Connected,
    Deleting,
    Deleted,
}

impl TransportState {
    /// The remote transport exists (created and not being removed).
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            TransportState::Created | TransportState::Connecting | TransportState::Connected
        )
    }
}

impl Lifecycle for TransportState {
    const ENTITY: &'static str = "transport";

    fn order(self) -> u8 {
        match self {
            TransportState::Creating => 0,
            TransportState::Created => 1,
            TransportState::Connecting => 2,
            TransportState::Connected => 3,
            TransportState::Deleting => 4,
            TransportState::Deleted => 5,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            TransportState::Creating => "creating",
            TransportState::Created => "created",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Deleting => "deleting",
            TransportState::Deleted => "deleted",
        }
    }

    fn is_removing(self) -> bool {
        matches!(self, TransportState::Deleting | TransportState::Deleted)
    }

    fn is_terminal(self) -> bool {
        self == TransportState::Deleted
    }
}

/// Producer and consumer states: `creating → created → deleting → deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Creating,
    Created,
    Deleting,
    Deleted,
}

impl Lifecycle for StreamState {
    const ENTITY: &'static str = "stream";

    fn order(self) -> u8 {
        match self {
            StreamState::Creating => 0,
            StreamState::Created => 1,
            StreamState::Deleting => 2,
            StreamState::Deleted => 3,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            StreamState::Creating => "creating",
            StreamState::Created => "created",
            StreamState::Deleting => "deleting",
            StreamState::Deleted => "deleted",
        }
    }

    fn is_removing(self) -> bool {
        matches!(self, StreamState::Deleting | StreamState::Deleted)
    }

    fn is_terminal(self) -> bool {
        self == StreamState::Deleted
    }
}
