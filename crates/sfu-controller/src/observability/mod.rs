//! Observability for the SFU controller.
//!
//! - [`metrics`]: Prometheus metric recording functions.
//! - [`health`]: liveness/readiness state and probe router.

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
