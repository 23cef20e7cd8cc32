//! Worker status callback.
//!
//! - `POST /v1/workers/status` - a worker (or its supervisor) reports
//!   whether it is healthy, with the app data placement needs.

use crate::errors::SfuError;
use crate::models::WorkerAppData;
use crate::routes::AppState;
use crate::rpc::WorkerStatus;
use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerStatusRequest {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub app_data: WorkerAppData,
}

/// Handler for POST /v1/workers/status
///
/// # Response
///
/// - 202 Accepted: report recorded, reconciliation happens in the background
/// - 400 Bad Request: empty worker id or ip
#[instrument(skip_all, fields(worker_id = %request.worker_id))]
pub async fn report_worker_status(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WorkerStatusRequest>,
) -> Result<StatusCode, SfuError> {
    if request.worker_id.trim().is_empty() {
        return Err(SfuError::BadRequest("worker_id is required".to_string()));
    }
    if request.app_data.ip.trim().is_empty() {
        return Err(SfuError::BadRequest("app_data.ip is required".to_string()));
    }

    debug!(
        target: "sfu.handlers.workers",
        worker_id = %request.worker_id,
        status = ?request.status,
        "Worker status reported"
    );
    state
        .status_board
        .report(&request.worker_id, request.status, request.app_data);
    Ok(StatusCode::ACCEPTED)
}
