//! Call handlers: the signaling layer's entry into the scheduler.
//!
//! - `POST   /v1/calls/{call_id}/peers` - peer joins
//! - `DELETE /v1/calls/{call_id}/peers/{peer_id}` - peer leaves
//! - `PUT    /v1/calls/{call_id}/peers/{peer_id}/sources` - enabled sources changed
//! - `PUT    /v1/calls/{call_id}/peers/{peer_id}/role` - speaker/listener switch
//! - `PUT    /v1/calls/{call_id}/peers/{peer_id}/consumes` - consumed transports
//! - `GET    /v1/calls/{call_id}/peers/{peer_id}/streams` - end-stream views
//! - `POST   /v1/calls/{call_id}/peers/{peer_id}/streams/{stream_id}/offer`
//! - `POST   /v1/calls/{call_id}/peers/{peer_id}/streams/{stream_id}/answer`
//! - `POST   /v1/calls/{call_id}/peers/{peer_id}/streams/{stream_id}/candidate`
//! - `POST   /v1/calls/{call_id}/peers/{peer_id}/streams/{stream_id}/failed`

use crate::context::RequestContext;
use crate::errors::SfuError;
use crate::models::{Role, Sources};
use crate::negotiation::StreamHint;
use crate::routes::AppState;
use crate::scheduler::{PeerJoin, StreamView};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Clone, Deserialize)]
pub struct RoleRequest {
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumesRequest {
    pub consumes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(default)]
    pub hints: Vec<StreamHint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerRequest {
    pub sdp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandidateRequest {
    pub candidate: String,
}

fn require_sdp(sdp: &str) -> Result<(), SfuError> {
    if sdp.trim().is_empty() {
        return Err(SfuError::BadRequest("sdp is required".to_string()));
    }
    Ok(())
}

/// Handler for POST /v1/calls/{call_id}/peers
///
/// # Response
///
/// - 201 Created: the peer's end-streams
/// - 409 Conflict: peer already in the call
/// - 503 Service Unavailable: no worker can host the call
#[instrument(skip_all, fields(call_id = %call_id, peer_id = %request.peer_id))]
pub async fn add_peer(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
    Json(request): Json<PeerJoin>,
) -> Result<(StatusCode, Json<Vec<StreamView>>), SfuError> {
    if request.peer_id.trim().is_empty() {
        return Err(SfuError::BadRequest("peer_id is required".to_string()));
    }
    let ctx = RequestContext::new("peer_added");
    let views = state.scheduler.on_peer_added(&ctx, &call_id, request).await?;
    Ok((StatusCode::CREATED, Json(views)))
}

/// Handler for DELETE /v1/calls/{call_id}/peers/{peer_id}
#[instrument(skip_all, fields(call_id = %call_id, peer_id = %peer_id))]
pub async fn remove_peer(
    State(state): State<Arc<AppState>>,
    Path((call_id, peer_id)): Path<(String, String)>,
) -> Result<StatusCode, SfuError> {
    let ctx = RequestContext::new("peer_removed");
    state
        .scheduler
        .on_peer_removed(&ctx, &call_id, &peer_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for PUT /v1/calls/{call_id}/peers/{peer_id}/sources
#[instrument(skip_all, fields(call_id = %call_id, peer_id = %peer_id))]
pub async fn update_sources(
    State(state): State<Arc<AppState>>,
    Path((call_id, peer_id)): Path<(String, String)>,
    Json(sources): Json<Sources>,
) -> Result<Json<Vec<StreamView>>, SfuError> {
    let ctx = RequestContext::new("peer_streams_changed");
    let views = state
        .scheduler
        .on_peer_streams_changed(&ctx, &call_id, &peer_id, sources)
        .await?;
    Ok(Json(views))
}

/// Handler for PUT /v1/calls/{call_id}/peers/{peer_id}/role
#[instrument(skip_all, fields(call_id = %call_id, peer_id = %peer_id))]
pub async fn update_role(
    State(state): State<Arc<AppState>>,
    Path((call_id, peer_id)): Path<(String, String)>,
    Json(request): Json<RoleRequest>,
) -> Result<Json<Vec<StreamView>>, SfuError> {
    let ctx = RequestContext::new("peer_role_changed");
    let views = state
        .scheduler
        .on_peer_role_changed(&ctx, &call_id, &peer_id, request.role)
        .await?;
    Ok(Json(views))
}

/// Handler for PUT /v1/calls/{call_id}/peers/{peer_id}/consumes
///
/// # Response
///
/// - 501 Not Implemented: the SFU strategy derives consumption from roles
#[instrument(skip_all, fields(call_id = %call_id, peer_id = %peer_id))]
pub async fn update_consumes(
    State(state): State<Arc<AppState>>,
    Path((call_id, peer_id)): Path<(String, String)>,
    Json(request): Json<ConsumesRequest>,
) -> Result<StatusCode, SfuError> {
    let ctx = RequestContext::new("update_consumes");
    state
        .scheduler
        .update_consumes(&ctx, &call_id, &peer_id, &request.consumes)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for GET /v1/calls/{call_id}/peers/{peer_id}/streams
#[instrument(skip_all, fields(call_id = %call_id, peer_id = %peer_id))]
pub async fn list_streams(
    State(state): State<Arc<AppState>>,
    Path((call_id, peer_id)): Path<(String, String)>,
) -> Result<Json<Vec<StreamView>>, SfuError> {
    let ctx = RequestContext::new("peer_streams");
    let views = state.scheduler.peer_streams(&ctx, &call_id, &peer_id).await?;
    Ok(Json(views))
}

/// Handler for POST .../streams/{stream_id}/offer
///
/// # Response
///
/// - 200 OK: stream view; carries the answer once it is ready
/// - 400 Bad Request: malformed SDP or hints
/// - 409 Conflict: stream is not waiting for an offer
#[instrument(skip_all, fields(call_id = %call_id, peer_id = %peer_id, stream_id = %stream_id))]
pub async fn stream_offer(
    State(state): State<Arc<AppState>>,
    Path((call_id, peer_id, stream_id)): Path<(String, String, String)>,
    Json(request): Json<OfferRequest>,
) -> Result<Json<StreamView>, SfuError> {
    require_sdp(&request.sdp)?;
    let ctx = RequestContext::new("offer");
    let view = state
        .scheduler
        .on_stream_offer(
            &ctx,
            &call_id,
            &peer_id,
            &stream_id,
            &request.sdp,
            &request.hints,
        )
        .await?;
    Ok(Json(view))
}

/// Handler for POST .../streams/{stream_id}/answer
#[instrument(skip_all, fields(call_id = %call_id, peer_id = %peer_id, stream_id = %stream_id))]
pub async fn stream_answer(
    State(state): State<Arc<AppState>>,
    Path((call_id, peer_id, stream_id)): Path<(String, String, String)>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<StreamView>, SfuError> {
    require_sdp(&request.sdp)?;
    let ctx = RequestContext::new("answer");
    let view = state
        .scheduler
        .on_stream_answer(&ctx, &call_id, &peer_id, &stream_id, &request.sdp)
        .await?;
    Ok(Json(view))
}

/// Handler for POST .../streams/{stream_id}/candidate
#[instrument(skip_all, fields(call_id = %call_id, peer_id = %peer_id, stream_id = %stream_id))]
pub async fn stream_candidate(
    State(state): State<Arc<AppState>>,
    Path((call_id, peer_id, stream_id)): Path<(String, String, String)>,
    Json(request): Json<CandidateRequest>,
) -> Result<StatusCode, SfuError> {
    let ctx = RequestContext::new("candidate");
    state
        .scheduler
        .on_stream_candidate(&ctx, &call_id, &peer_id, &stream_id, &request.candidate)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for POST .../streams/{stream_id}/failed
#[instrument(skip_all, fields(call_id = %call_id, peer_id = %peer_id, stream_id = %stream_id))]
pub async fn stream_failed(
    State(state): State<Arc<AppState>>,
    Path((call_id, peer_id, stream_id)): Path<(String, String, String)>,
) -> Result<StatusCode, SfuError> {
    let ctx = RequestContext::new("failed");
    state
        .scheduler
        .on_stream_failed(&ctx, &call_id, &peer_id, &stream_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
