//! Bounded worker pools draining the queue lanes.

use super::{Backoff, Envelope, QueueKind, WorkItem, WorkQueue};
use crate::context::RequestContext;
use crate::errors::SfuError;
use crate::observability::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Body of a reconciliation worker.
///
/// Implementations must be idempotent: an item may be delivered more than
/// once, and a redelivery after success must be a no-op.
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &RequestContext, item: &WorkItem) -> Result<(), SfuError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Concurrent invocations per lane.
    pub concurrency: usize,
    pub backoff: Backoff,
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Succeeded,
    /// Failed with a retryable error and the lane allows another attempt.
    Retry(Envelope),
    /// Failed and will not be retried.
    Dropped(String),
}

/// Run a single delivery of `envelope` and classify the result.
pub async fn execute(handler: &dyn WorkHandler, envelope: Envelope) -> Execution {
    let kind = envelope.item.kind();
    let ctx = RequestContext::for_work(kind.as_str(), envelope.item.entity_id(), envelope.attempt);
    let start = Instant::now();

    let result = handler
        .handle(&ctx, &envelope.item)
        .instrument(ctx.span().clone())
        .await;

    match result {
        Ok(()) => {
            metrics::record_work_item(kind.as_str(), "success", start.elapsed());
            Execution::Succeeded
        }
        Err(e) if e.is_retryable() && kind.retry_policy().allows_retry(envelope.attempt) => {
            warn!(
                target: "sfu.queue",
                queue = kind.as_str(),
                entity_id = %envelope.item.entity_id(),
                attempt = envelope.attempt,
                error = %e,
                "Work item failed, will retry"
            );
            metrics::record_work_item(kind.as_str(), "retry", start.elapsed());
            Execution::Retry(Envelope {
                item: envelope.item,
                attempt: envelope.attempt.saturating_add(1),
            })
        }
        Err(e) => {
            error!(
                target: "sfu.queue",
                queue = kind.as_str(),
                entity_id = %envelope.item.entity_id(),
                attempt = envelope.attempt,
                error = %e,
                "Work item dropped"
            );
            metrics::record_work_item(kind.as_str(), "dropped", start.elapsed());
            Execution::Dropped(e.to_string())
        }
    }
}

/// Drain one lane with at most `options.concurrency` invocations in flight.
///
/// Returns once `cancel_token` fires and in-flight invocations finished.
pub async fn run_pool(
    queue: Arc<WorkQueue>,
    kind: QueueKind,
    handler: Arc<dyn WorkHandler>,
    options: PoolOptions,
    cancel_token: CancellationToken,
) {
    info!(
        target: "sfu.queue",
        queue = kind.as_str(),
        concurrency = options.concurrency,
        "Starting reconciliation pool"
    );

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = cancel_token.cancelled() => break,
        };

        let envelope = tokio::select! {
            envelope = queue.pop(kind) => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
            _ = cancel_token.cancelled() => break,
        };

        let handler = Arc::clone(&handler);
        let queue = Arc::clone(&queue);
        let cancel = cancel_token.clone();
        in_flight.spawn(async move {
            let execution = execute(handler.as_ref(), envelope).await;
            drop(permit);
            if let Execution::Retry(next) = execution {
                let delay = options.backoff.delay(next.attempt.saturating_sub(1));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
                queue.push_envelope(next);
            }
        });

        while in_flight.try_join_next().is_some() {}
    }

    debug!(
        target: "sfu.queue",
        queue = kind.as_str(),
        in_flight = in_flight.len(),
        "Reconciliation pool draining"
    );
    while in_flight.join_next().await.is_some() {}

    info!(
        target: "sfu.queue",
        queue = kind.as_str(),
        "Reconciliation pool stopped"
    );
}
