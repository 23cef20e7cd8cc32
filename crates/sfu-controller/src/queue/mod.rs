//! Work queue for reconciliation workers.
//!
//! One FIFO lane per [`QueueKind`]. Items are pushed by the resource store
//! only when the transaction that produced them commits, and are pulled by
//! a bounded worker pool per lane (see [`pool`]). Delivery is at-least-once:
//! a failed invocation is pushed back with an incremented attempt counter
//! while the lane's [`RetryPolicy`] allows it.

pub mod events;
pub mod pool;

pub use events::{EventBus, LifecycleEvent};
pub use pool::{run_pool, PoolOptions, WorkHandler};

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// A unit of reconciliation work. Carries ids only; the worker re-reads
/// current state from the store before acting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    RouterCreate {
        router_id: String,
        ip: Option<String>,
    },
    RouterDelete {
        router_id: String,
    },
    TransportCreate {
        transport_id: String,
    },
    TransportConnect {
        transport_id: String,
    },
    TransportDelete {
        transport_id: String,
    },
    ProducerCreate {
        producer_id: String,
    },
    ProducerDelete {
        producer_id: String,
    },
    ConsumerCreate {
        consumer_id: String,
    },
    ConsumerDelete {
        consumer_id: String,
    },
    ConsumerUnpause {
        consumer_id: String,
    },
    WorkerCleanup {
        worker_id: String,
    },
}

impl WorkItem {
    pub fn kind(&self) -> QueueKind {
        match self {
            WorkItem::RouterCreate { .. } => QueueKind::RouterCreate,
            WorkItem::RouterDelete { .. } => QueueKind::RouterDelete,
            WorkItem::TransportCreate { .. } => QueueKind::TransportCreate,
            WorkItem::TransportConnect { .. } => QueueKind::TransportConnect,
            WorkItem::TransportDelete { .. } => QueueKind::TransportDelete,
            WorkItem::ProducerCreate { .. } => QueueKind::ProducerCreate,
            WorkItem::ProducerDelete { .. } => QueueKind::ProducerDelete,
            WorkItem::ConsumerCreate { .. } => QueueKind::ConsumerCreate,
            WorkItem::ConsumerDelete { .. } => QueueKind::ConsumerDelete,
            WorkItem::ConsumerUnpause { .. } => QueueKind::ConsumerUnpause,
            WorkItem::WorkerCleanup { .. } => QueueKind::WorkerCleanup,
        }
    }

    /// Id of the entity the item operates on.
    pub fn entity_id(&self) -> &str {
        match self {
            WorkItem::RouterCreate { router_id, .. } | WorkItem::RouterDelete { router_id } => {
                router_id
            }
            WorkItem::TransportCreate { transport_id }
            | WorkItem::TransportConnect { transport_id }
            | WorkItem::TransportDelete { transport_id } => transport_id,
            WorkItem::ProducerCreate { producer_id } | WorkItem::ProducerDelete { producer_id } => {
                producer_id
            }
            WorkItem::ConsumerCreate { consumer_id }
            | WorkItem::ConsumerDelete { consumer_id }
            | WorkItem::ConsumerUnpause { consumer_id } => consumer_id,
            WorkItem::WorkerCleanup { worker_id } => worker_id,
        }
    }
}

/// One lane (and one worker pool) per reconciliation operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    RouterCreate,
    RouterDelete,
    TransportCreate,
    TransportConnect,
    TransportDelete,
    ProducerCreate,
    ProducerDelete,
    ConsumerCreate,
    ConsumerDelete,
    ConsumerUnpause,
    WorkerCleanup,
}

impl QueueKind {
    pub const ALL: [QueueKind; 11] = [
        QueueKind::RouterCreate,
        QueueKind::RouterDelete,
        QueueKind::TransportCreate,
        QueueKind::TransportConnect,
        QueueKind::TransportDelete,
        QueueKind::ProducerCreate,
        QueueKind::ProducerDelete,
        QueueKind::ConsumerCreate,
        QueueKind::ConsumerDelete,
        QueueKind::ConsumerUnpause,
        QueueKind::WorkerCleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::RouterCreate => "router_create",
            QueueKind::RouterDelete => "router_delete",
            QueueKind::TransportCreate => "transport_create",
            QueueKind::TransportConnect => "transport_connect",
            QueueKind::TransportDelete => "transport_delete",
            QueueKind::ProducerCreate => "producer_create",
            QueueKind::ProducerDelete => "producer_delete",
            QueueKind::ConsumerCreate => "consumer_create",
            QueueKind::ConsumerDelete => "consumer_delete",
            QueueKind::ConsumerUnpause => "consumer_unpause",
            QueueKind::WorkerCleanup => "worker_cleanup",
        }
    }

    /// Retry policy of the lane.
    ///
    /// Background reconciliation converges only once the worker (or its
    /// replacement) is reachable again, so it retries forever. Unpause is a
    /// client-facing nicety and gives up after a few attempts.
    pub fn retry_policy(self) -> RetryPolicy {
        match self {
            QueueKind::ConsumerUnpause => RetryPolicy::Finite(5),
            _ => RetryPolicy::Infinite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// At most this many attempts in total.
    Finite(u32),
    Infinite,
}

impl RetryPolicy {
    /// Whether another attempt may follow failed attempt number `attempt`
    /// (zero-based).
    pub fn allows_retry(self, attempt: u32) -> bool {
        match self {
            RetryPolicy::Finite(max) => attempt.saturating_add(1) < max,
            RetryPolicy::Infinite => true,
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// A queued item plus its delivery attempt (zero-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub item: WorkItem,
    pub attempt: u32,
}

#[derive(Debug, Default)]
struct Lane {
    items: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

/// In-process work queue with one lane per [`QueueKind`].
#[derive(Debug)]
pub struct WorkQueue {
    lanes: HashMap<QueueKind, Lane>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            lanes: QueueKind::ALL
                .into_iter()
                .map(|kind| (kind, Lane::default()))
                .collect(),
        }
    }

    /// Push a fresh item (attempt 0).
    pub fn push(&self, item: WorkItem) {
        self.push_envelope(Envelope { item, attempt: 0 });
    }

    pub fn push_envelope(&self, envelope: Envelope) {
        let kind = envelope.item.kind();
        let Some(lane) = self.lanes.get(&kind) else {
            return;
        };
        match lane.items.lock() {
            Ok(mut items) => items.push_back(envelope),
            Err(poisoned) => poisoned.into_inner().push_back(envelope),
        }
        lane.notify.notify_one();
    }

    /// Take the next item of a lane without waiting.
    pub fn try_pop(&self, kind: QueueKind) -> Option<Envelope> {
        let lane = self.lanes.get(&kind)?;
        match lane.items.lock() {
            Ok(mut items) => items.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    /// Wait for the next item of a lane.
    pub async fn pop(&self, kind: QueueKind) -> Option<Envelope> {
        let lane = self.lanes.get(&kind)?;
        loop {
            let notified = lane.notify.notified();
            if let Some(envelope) = self.try_pop(kind) {
                return Some(envelope);
            }
            notified.await;
        }
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.lanes.get(&kind).map_or(0, |lane| match lane.items.lock() {
            Ok(items) => items.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        })
    }

    /// No items pending on any lane.
    pub fn is_empty(&self) -> bool {
        QueueKind::ALL.into_iter().all(|kind| self.len(kind) == 0)
    }

    /// Pending items of one lane, oldest first.
    pub fn pending(&self, kind: QueueKind) -> Vec<WorkItem> {
        self.lanes.get(&kind).map_or_else(Vec::new, |lane| {
            let items = match lane.items.lock() {
                Ok(items) => items.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            items.into_iter().map(|e| e.item).collect()
        })
    }
}
