//! Liveness and readiness probes.
//!
//! - `GET /health` - the process is up
//! - `GET /ready` - reconciliation pools and the worker health tracker are
//!   running and the controller is not draining
//!
//! Readiness is reported per component so a failing probe says which part
//! is missing.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct HealthState {
    pools: AtomicBool,
    worker_tracker: AtomicBool,
    draining: AtomicBool,
}

/// Body of `GET /ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub pools: bool,
    pub worker_tracker: bool,
    pub draining: bool,
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_pools_started(&self) {
        self.pools.store(true, Ordering::SeqCst);
    }

    pub fn mark_worker_tracker_started(&self) {
        self.worker_tracker.store(true, Ordering::SeqCst);
    }

    /// Shutdown began; stop taking new traffic.
    pub fn start_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn readiness(&self) -> Readiness {
        let pools = self.pools.load(Ordering::SeqCst);
        let worker_tracker = self.worker_tracker.load(Ordering::SeqCst);
        let draining = self.draining.load(Ordering::SeqCst);
        Readiness {
            ready: pools && worker_tracker && !draining,
            pools,
            worker_tracker,
            draining,
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.readiness().ready
    }
}

pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler() -> &'static str {
    "OK"
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<Readiness>) {
    let readiness = state.readiness();
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}
