//! HTTP routes for the SFU controller.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::handlers;
use crate::observability::{health_router, HealthState};
use crate::rpc::WorkerStatusBoard;
use crate::scheduler::CallScheduler;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<dyn CallScheduler>,

    /// Latest worker status reports, read by the health tracker.
    pub status_board: Arc<WorkerStatusBoard>,

    pub config: Config,
}

/// Build the application routes.
///
/// - `/health`, `/ready` - liveness and readiness
/// - `/metrics` - Prometheus scrape endpoint
/// - `/v1/workers/status` - worker status callbacks
/// - `/v1/calls/...` - scheduler façade
/// - TraceLayer for request logging
/// - 30 second request timeout
pub fn build_routes(
    state: Arc<AppState>,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let peer = "/v1/calls/:call_id/peers/:peer_id";
    let stream = "/v1/calls/:call_id/peers/:peer_id/streams/:stream_id";

    let api_routes = Router::new()
        .route("/v1/workers/status", post(handlers::report_worker_status))
        .route("/v1/calls/:call_id/peers", post(handlers::add_peer))
        .route(peer, delete(handlers::remove_peer))
        .route(&format!("{peer}/sources"), put(handlers::update_sources))
        .route(&format!("{peer}/role"), put(handlers::update_role))
        .route(&format!("{peer}/consumes"), put(handlers::update_consumes))
        .route(&format!("{peer}/streams"), get(handlers::list_streams))
        .route(&format!("{stream}/offer"), post(handlers::stream_offer))
        .route(&format!("{stream}/answer"), post(handlers::stream_answer))
        .route(&format!("{stream}/candidate"), post(handlers::stream_candidate))
        .route(&format!("{stream}/failed"), post(handlers::stream_failed))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    api_routes
        .merge(metrics_routes)
        .merge(health_router(health_state))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
