//! SFU controller error types.
//!
//! Errors map to HTTP status codes for the internal API via the `IntoResponse`
//! impl, and classify themselves for the work queue retry policy via
//! [`SfuError::is_retryable`]. Messages returned to callers are generic for
//! RPC and store failures; the detail is logged server-side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// SFU controller error type.
///
/// Maps to HTTP status codes:
/// - NotFound: 404 Not Found
/// - InvalidState: 409 Conflict
/// - Negotiation, BadRequest: 400 Bad Request
/// - NotSupported: 501 Not Implemented
/// - Rpc, NoWorkersAvailable: 503 Service Unavailable
/// - Store, Internal: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum SfuError {
    /// A referenced router/transport/producer/consumer/call does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not valid for the entity's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// SDP offer/answer or hint processing failed.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Remote media worker call failed (unreachable, timeout, rejected).
    #[error("Worker RPC error: {0}")]
    Rpc(String),

    /// No healthy media worker can host a router.
    #[error("No workers available")]
    NoWorkersAvailable,

    /// Resource store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Operation is not supported by this scheduling strategy.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Malformed caller input.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error")]
    Internal,
}

impl SfuError {
    /// Whether the queue framework should retry a work item that failed with
    /// this error.
    ///
    /// Caller misuse (invalid state, negotiation, unsupported, bad input) is
    /// never retried blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SfuError::Rpc(_)
                | SfuError::NoWorkersAvailable
                | SfuError::Store(_)
                | SfuError::NotFound(_)
                | SfuError::Internal
        )
    }

    /// Returns the HTTP status code for this error (for metrics recording).
    pub fn status_code(&self) -> u16 {
        match self {
            SfuError::NotFound(_) => 404,
            SfuError::InvalidState(_) => 409,
            SfuError::Negotiation(_) | SfuError::BadRequest(_) => 400,
            SfuError::NotSupported(_) => 501,
            SfuError::Rpc(_) | SfuError::NoWorkersAvailable => 503,
            SfuError::Store(_) | SfuError::Internal => 500,
        }
    }

    /// Short bounded label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SfuError::NotFound(_) => "not_found",
            SfuError::InvalidState(_) => "invalid_state",
            SfuError::Negotiation(_) => "negotiation",
            SfuError::Rpc(_) => "rpc",
            SfuError::NoWorkersAvailable => "no_workers",
            SfuError::Store(_) => "store",
            SfuError::NotSupported(_) => "not_supported",
            SfuError::BadRequest(_) => "bad_request",
            SfuError::Internal => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for SfuError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            SfuError::NotFound(resource) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", resource.clone())
            }
            SfuError::InvalidState(reason) => {
                (StatusCode::CONFLICT, "INVALID_STATE", reason.clone())
            }
            SfuError::Negotiation(reason) => (
                StatusCode::BAD_REQUEST,
                "NEGOTIATION_FAILED",
                reason.clone(),
            ),
            SfuError::BadRequest(reason) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", reason.clone())
            }
            SfuError::NotSupported(what) => (
                StatusCode::NOT_IMPLEMENTED,
                "NOT_SUPPORTED",
                format!("{what} is not supported"),
            ),
            SfuError::Rpc(err) => {
                tracing::warn!(target: "sfu.rpc", error = %err, "Worker RPC failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Media service temporarily unavailable".to_string(),
                )
            }
            SfuError::NoWorkersAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                "Media service temporarily unavailable".to_string(),
            ),
            SfuError::Store(err) => {
                tracing::error!(target: "sfu.store", error = %err, "Store operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORE_ERROR",
                    "An internal store error occurred".to_string(),
                )
            }
            SfuError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}
