//! SFU Controller Library
//!
//! Control plane for a clustered selective forwarding unit. Media workers
//! move the packets; this crate decides where calls live and keeps the
//! workers' routers, transports, producers and consumers in line with what
//! the signaling layer asked for:
//!
//! - Worker registry and geo-aware router placement
//! - Resource lifecycle with cascading deletes and forward-only states
//! - Per-kind work queues drained by reconcilers calling the workers
//! - SDP offer/answer negotiation for send and receive end-streams
//! - A scheduler façade (`on_peer_added`, `on_stream_offer`, ...) over HTTP
//!
//! # Flow
//!
//! ```text
//! HTTP handler -> CallScheduler -> ResourceStore transaction
//!                                    ├── WorkQueue  -> Reconciler -> MediaWorkerClient
//!                                    └── EventBus   -> CallScheduler::on_lifecycle_event
//! ```
//!
//! State changes and the work they imply commit together; worker RPCs run
//! outside transactions and commit their result in a second, guarded one.

pub mod config;
pub mod context;
pub mod errors;
pub mod geo;
pub mod handlers;
pub mod models;
pub mod negotiation;
pub mod observability;
pub mod queue;
pub mod reconcilers;
pub mod repositories;
pub mod routes;
pub mod rpc;
pub mod scheduler;
pub mod services;
pub mod tasks;
