//! Logging and metrics around any [`CallScheduler`].

use super::{CallScheduler, PeerJoin, StreamView};
use crate::context::RequestContext;
use crate::errors::SfuError;
use crate::models::{Role, Sources};
use crate::negotiation::StreamHint;
use crate::observability::metrics;
use crate::queue::LifecycleEvent;
use async_trait::async_trait;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, warn, Instrument};

pub struct TracedScheduler<S> {
    inner: S,
}

impl<S: CallScheduler> TracedScheduler<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

/// Run `fut` inside the context's span and log its outcome. Client offers and
/// answers also count as negotiations.
async fn traced<T>(
    ctx: &RequestContext,
    operation: &'static str,
    fut: impl Future<Output = Result<T, SfuError>>,
) -> Result<T, SfuError> {
    let start = Instant::now();
    let result = fut.instrument(ctx.span().clone()).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let outcome = match &result {
        Ok(_) => {
            debug!(
                target: "sfu.scheduler",
                request_id = %ctx.request_id(),
                operation = operation,
                elapsed_ms = elapsed_ms,
                "Scheduler call completed"
            );
            "success"
        }
        Err(e) => {
            warn!(
                target: "sfu.scheduler",
                request_id = %ctx.request_id(),
                operation = operation,
                elapsed_ms = elapsed_ms,
                error = %e,
                "Scheduler call failed"
            );
            e.kind()
        }
    };
    metrics::record_scheduler_call(operation, outcome);
    if matches!(operation, "offer" | "answer") {
        metrics::record_negotiation(operation, outcome);
    }
    result
}

#[async_trait]
impl<S: CallScheduler> CallScheduler for TracedScheduler<S> {
    async fn on_peer_added(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer: PeerJoin,
    ) -> Result<Vec<StreamView>, SfuError> {
        traced(ctx, "peer_added", self.inner.on_peer_added(ctx, call_id, peer)).await
    }

    async fn on_peer_removed(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
    ) -> Result<(), SfuError> {
        traced(ctx, "peer_removed", self.inner.on_peer_removed(ctx, call_id, peer_id)).await
    }

    async fn on_peer_streams_changed(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        sources: Sources,
    ) -> Result<Vec<StreamView>, SfuError> {
        traced(
            ctx,
            "peer_streams_changed",
            self.inner
                .on_peer_streams_changed(ctx, call_id, peer_id, sources),
        )
        .await
    }

    async fn on_peer_role_changed(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        role: Role,
    ) -> Result<Vec<StreamView>, SfuError> {
        traced(
            ctx,
            "peer_role_changed",
            self.inner.on_peer_role_changed(ctx, call_id, peer_id, role),
        )
        .await
    }

    async fn on_stream_offer(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        stream_id: &str,
        offer: &str,
        hints: &[StreamHint],
    ) -> Result<StreamView, SfuError> {
        traced(
            ctx,
            "offer",
            self.inner
                .on_stream_offer(ctx, call_id, peer_id, stream_id, offer, hints),
        )
        .await
    }

    async fn on_stream_answer(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        stream_id: &str,
        answer: &str,
    ) -> Result<StreamView, SfuError> {
        traced(
            ctx,
            "answer",
            self.inner
                .on_stream_answer(ctx, call_id, peer_id, stream_id, answer),
        )
        .await
    }

    async fn on_stream_candidate(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        stream_id: &str,
        candidate: &str,
    ) -> Result<(), SfuError> {
        traced(
            ctx,
            "candidate",
            self.inner
                .on_stream_candidate(ctx, call_id, peer_id, stream_id, candidate),
        )
        .await
    }

    async fn on_stream_failed(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        stream_id: &str,
    ) -> Result<(), SfuError> {
        traced(
            ctx,
            "failed",
            self.inner.on_stream_failed(ctx, call_id, peer_id, stream_id),
        )
        .await
    }

    async fn update_consumes(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
        consumes: &[String],
    ) -> Result<(), SfuError> {
        traced(
            ctx,
            "update_consumes",
            self.inner.update_consumes(ctx, call_id, peer_id, consumes),
        )
        .await
    }

    async fn peer_streams(
        &self,
        ctx: &RequestContext,
        call_id: &str,
        peer_id: &str,
    ) -> Result<Vec<StreamView>, SfuError> {
        // Polled; not worth a metric.
        self.inner
            .peer_streams(ctx, call_id, peer_id)
            .instrument(ctx.span().clone())
            .await
    }

    async fn on_lifecycle_event(
        &self,
        ctx: &RequestContext,
        event: &LifecycleEvent,
    ) -> Result<(), SfuError> {
        traced(ctx, "lifecycle_event", self.inner.on_lifecycle_event(ctx, event)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    struct Rejecting;

    #[async_trait]
    impl CallScheduler for Rejecting {
        async fn on_peer_added(
            &self,
            _ctx: &RequestContext,
            _call_id: &str,
            _peer: PeerJoin,
        ) -> Result<Vec<StreamView>, SfuError> {
            Ok(Vec::new())
        }

        async fn on_peer_removed(
            &self,
            _ctx: &RequestContext,
            _call_id: &str,
            peer_id: &str,
        ) -> Result<(), SfuError> {
            Err(SfuError::NotFound(format!("peer {peer_id}")))
        }

        async fn on_peer_streams_changed(
            &self,
            _ctx: &RequestContext,
            _call_id: &str,
            _peer_id: &str,
            _sources: Sources,
        ) -> Result<Vec<StreamView>, SfuError> {
            Ok(Vec::new())
        }

        async fn on_peer_role_changed(
            &self,
            _ctx: &RequestContext,
            _call_id: &str,
            _peer_id: &str,
            _role: Role,
        ) -> Result<Vec<StreamView>, SfuError> {
            Ok(Vec::new())
        }

        async fn on_stream_offer(
            &self,
            _ctx: &RequestContext,
            _call_id: &str,
            _peer_id: &str,
            _stream_id: &str,
            _offer: &str,
            _hints: &[StreamHint],
        ) -> Result<StreamView, SfuError> {
            Err(SfuError::Negotiation("bad offer".to_string()))
        }

        async fn on_stream_answer(
            &self,
            _ctx: &RequestContext,
            _call_id: &str,
            _peer_id: &str,
            _stream_id: &str,
            _answer: &str,
        ) -> Result<StreamView, SfuError> {
            Err(SfuError::Negotiation("bad answer".to_string()))
        }

        async fn on_stream_candidate(
            &self,
            _ctx: &RequestContext,
            _call_id: &str,
            _peer_id: &str,
            _stream_id: &str,
            _candidate: &str,
        ) -> Result<(), SfuError> {
            Ok(())
        }

        async fn on_stream_failed(
            &self,
            _ctx: &RequestContext,
            _call_id: &str,
            _peer_id: &str,
            _stream_id: &str,
        ) -> Result<(), SfuError> {
            Ok(())
        }

        async fn update_consumes(
            &self,
            _ctx: &RequestContext,
            _call_id: &str,
            _peer_id: &str,
            _consumes: &[String],
        ) -> Result<(), SfuError> {
            Ok(())
        }

        async fn peer_streams(
            &self,
            _ctx: &RequestContext,
            _call_id: &str,
            _peer_id: &str,
        ) -> Result<Vec<StreamView>, SfuError> {
            Ok(Vec::new())
        }

        async fn on_lifecycle_event(
            &self,
            _ctx: &RequestContext,
            _event: &LifecycleEvent,
        ) -> Result<(), SfuError> {
            Ok(())
        }
    }

    fn counter_value(
        snapshot: &[(
            metrics_util::CompositeKey,
            Option<::metrics::Unit>,
            Option<::metrics::SharedString>,
            DebugValue,
        )],
        name: &str,
        operation: &str,
        outcome: &str,
    ) -> Option<u64> {
        snapshot.iter().find_map(|(key, _, _, value)| {
            let labels: Vec<(&str, &str)> = key
                .key()
                .labels()
                .map(|l| (l.key(), l.value()))
                .collect();
            let matches = key.key().name() == name
                && labels.contains(&("operation", operation))
                && labels.contains(&("outcome", outcome));
            match value {
                DebugValue::Counter(n) if matches => Some(*n),
                _ => None,
            }
        })
    }

    #[tokio::test]
    async fn test_errors_pass_through_and_are_counted() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let scheduler = TracedScheduler::new(Rejecting);

        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let ctx = RequestContext::new("offer");
        let result = scheduler
            .on_stream_offer(&ctx, "c1", "p1", "s1", "v=0", &[])
            .await;
        assert!(matches!(result, Err(SfuError::Negotiation(_))));

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(
            counter_value(&snapshot, "sfu_negotiations_total", "offer", "negotiation"),
            Some(1)
        );
        assert_eq!(
            counter_value(&snapshot, "sfu_scheduler_calls_total", "offer", "negotiation"),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_success_is_counted() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let scheduler = TracedScheduler::new(Rejecting);

        let ctx = RequestContext::new("peer_added");
        let join = PeerJoin {
            peer_id: "p1".to_string(),
            role: Role::Listener,
            sources: Sources::default(),
            capabilities: Default::default(),
            ip: None,
        };
        let _guard = ::metrics::set_default_local_recorder(&recorder);
        let result = scheduler.on_peer_added(&ctx, "c1", join).await;
        assert!(result.unwrap().is_empty());

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(
            counter_value(&snapshot, "sfu_scheduler_calls_total", "peer_added", "success"),
            Some(1)
        );
        // Membership changes are not negotiations.
        assert_eq!(
            counter_value(&snapshot, "sfu_negotiations_total", "peer_added", "success"),
            None
        );
    }
}
