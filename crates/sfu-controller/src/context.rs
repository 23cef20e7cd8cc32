//! Request-scoped context.
//!
//! Every scheduler façade call and every work item invocation gets its own
//! [`RequestContext`]. It carries a correlation id and the tracing span the
//! operation runs in, so logging is attached to the operation rather than
//! to module-level state.

use std::fmt;
use tracing::{info_span, Span};
use uuid::Uuid;

/// Correlation id of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    operation: &'static str,
    span: Span,
}

impl RequestContext {
    /// Context for a façade or HTTP operation.
    pub fn new(operation: &'static str) -> Self {
        let request_id = RequestId::new();
        let span = info_span!(
            "sfu.request",
            request_id = %request_id,
            operation = operation
        );
        Self {
            request_id,
            operation,
            span,
        }
    }

    /// Context for one work item invocation.
    pub fn for_work(queue: &'static str, entity_id: &str, attempt: u32) -> Self {
        let request_id = RequestId::new();
        let span = info_span!(
            "sfu.work",
            request_id = %request_id,
            queue = queue,
            entity_id = %entity_id,
            attempt = attempt
        );
        Self {
            request_id,
            operation: queue,
            span,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
