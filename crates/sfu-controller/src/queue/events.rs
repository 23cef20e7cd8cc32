//! Lifecycle notifications.
//!
//! Reconcilers publish these through the store's commit-time outbox; the
//! scheduler consumes them to advance negotiation. Delivery is best-effort:
//! the bus is in-memory and events are never retried. Anything that must
//! happen reliably is done as queued work inside the committing transaction.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    RouterCreated { router_id: String },
    RouterRemoved { router_id: String },
    TransportCreated { transport_id: String },
    TransportConnected { transport_id: String },
    TransportRemoved { transport_id: String },
    ProducerCreated { producer_id: String, transport_id: String },
    ProducerRemoved { producer_id: String, transport_id: String },
    ConsumerCreated { consumer_id: String, transport_id: String },
    ConsumerRemoved { consumer_id: String, transport_id: String },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::RouterCreated { .. } => "router_created",
            LifecycleEvent::RouterRemoved { .. } => "router_removed",
            LifecycleEvent::TransportCreated { .. } => "transport_created",
            LifecycleEvent::TransportConnected { .. } => "transport_connected",
            LifecycleEvent::TransportRemoved { .. } => "transport_removed",
            LifecycleEvent::ProducerCreated { .. } => "producer_created",
            LifecycleEvent::ProducerRemoved { .. } => "producer_removed",
            LifecycleEvent::ConsumerCreated { .. } => "consumer_created",
            LifecycleEvent::ConsumerRemoved { .. } => "consumer_removed",
        }
    }
}

/// Unbounded in-memory event queue with a single logical consumer.
#[derive(Debug, Default)]
pub struct EventBus {
    events: Mutex<VecDeque<LifecycleEvent>>,
    notify: Notify,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: LifecycleEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push_back(event),
            Err(poisoned) => poisoned.into_inner().push_back(event),
        }
        self.notify.notify_one();
    }

    pub fn try_next(&self) -> Option<LifecycleEvent> {
        match self.events.lock() {
            Ok(mut events) => events.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    pub async fn next(&self) -> LifecycleEvent {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_next() {
                return event;
            }
            notified.await;
        }
    }

    pub fn is_empty(&self) -> bool {
        match self.events.lock() {
            Ok(events) => events.is_empty(),
            Err(poisoned) => poisoned.into_inner().is_empty(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_events_delivered_in_order() {
        let bus = EventBus::new();
        bus.publish(LifecycleEvent::RouterCreated {
            router_id: "r1".to_string(),
        });
        bus.publish(LifecycleEvent::TransportCreated {
            transport_id: "t1".to_string(),
        });

        assert_eq!(bus.try_next().unwrap().name(), "router_created");
        assert_eq!(bus.try_next().unwrap().name(), "transport_created");
        assert!(bus.try_next().is_none());
        assert!(bus.is_empty());
    }
}
