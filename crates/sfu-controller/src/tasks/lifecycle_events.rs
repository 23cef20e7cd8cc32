//! Lifecycle event loop.
//!
//! Feeds committed lifecycle events to the scheduler so negotiation can move
//! forward once the resources it waits on change state.

use crate::context::RequestContext;
use crate::queue::EventBus;
use crate::scheduler::CallScheduler;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[instrument(skip_all, name = "sfu.task.lifecycle_events")]
pub async fn start_lifecycle_event_loop(
    events: Arc<EventBus>,
    scheduler: Arc<dyn CallScheduler>,
    cancel_token: CancellationToken,
) {
    info!(target: "sfu.task.lifecycle_events", "Starting lifecycle event loop");

    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = cancel_token.cancelled() => {
                info!(
                    target: "sfu.task.lifecycle_events",
                    "Lifecycle event loop received shutdown signal, exiting"
                );
                break;
            }
        };

        debug!(target: "sfu.task.lifecycle_events", event = event.name(), "Dispatching event");
        let ctx = RequestContext::new("lifecycle_event");
        if let Err(e) = scheduler.on_lifecycle_event(&ctx, &event).await {
            warn!(
                target: "sfu.task.lifecycle_events",
                event = event.name(),
                error = %e,
                "Failed to handle lifecycle event"
            );
        }
    }

    info!(target: "sfu.task.lifecycle_events", "Lifecycle event loop stopped");
}
