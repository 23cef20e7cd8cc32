//! # SFU Test Utilities
//!
//! Mocks and fixtures for exercising the SFU controller without media
//! workers.
//!
//! - [`mock_worker`] - in-memory [`MediaWorkerClient`](sfu_controller::rpc::MediaWorkerClient)
//!   with call counting and failure injection
//! - [`fixtures`] - SDP builders, capabilities, geo tables
//! - [`cluster`] - [`TestCluster`], a deterministic controller that drains
//!   queues and events on demand
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let cluster = TestCluster::builder()
//!         .worker("w1", "10.0.0.1")
//!         .build()
//!         .await;
//!
//!     let streams = cluster.join("call-1", "alice", Role::Speaker, audio_only()).await;
//!     cluster.settle().await;
//! }
//! ```

pub mod cluster;
pub mod fixtures;
pub mod mock_worker;

pub use cluster::{TestCluster, TestClusterBuilder};
pub use fixtures::*;
pub use mock_worker::{MockMediaWorker, WorkerOp};
