//! Remote media worker RPC.
//!
//! [`MediaWorkerClient`] is the contract the reconcilers call. Every remote
//! object is addressed by ids the controller chose itself, so a handle can
//! be re-derived at any time from durable records and every call is
//! idempotent on the worker side: creating something that already exists
//! returns the existing object, closing something already gone succeeds.

pub mod http;
pub mod status;

pub use http::HttpWorkerClient;
pub use status::{LiveWorker, WorkerStatus, WorkerStatusBoard};

use crate::errors::SfuError;
use crate::models::rtp::RtpCodecCapability;
use crate::models::transport::WebRtcTransportOptions;
use crate::models::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, ServerParameters, WorkerRecord,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Address of a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRef {
    pub worker_id: String,
    pub endpoint: Option<String>,
}

impl From<&WorkerRecord> for WorkerRef {
    fn from(worker: &WorkerRecord) -> Self {
        Self {
            worker_id: worker.id.clone(),
            endpoint: worker.app_data.endpoint.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterHandle {
    pub worker: WorkerRef,
    pub router_id: String,
}

impl RouterHandle {
    pub fn transport(&self, transport_id: &str) -> TransportHandle {
        TransportHandle {
            router: self.clone(),
            transport_id: transport_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    pub router: RouterHandle,
    pub transport_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceOptions {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    /// Worker-side producer id.
    pub raw_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeOptions {
    /// Worker-side id of the producer to consume.
    pub producer_raw_id: String,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub raw_id: String,
    /// Parameters the worker will send with.
    pub rtp_parameters: RtpParameters,
}

#[async_trait]
pub trait MediaWorkerClient: Send + Sync {
    async fn create_router(
        &self,
        worker: &WorkerRef,
        router_id: &str,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterHandle, SfuError>;

    async fn close_router(&self, router: &RouterHandle) -> Result<(), SfuError>;

    async fn create_webrtc_transport(
        &self,
        router: &RouterHandle,
        transport_id: &str,
        options: &WebRtcTransportOptions,
    ) -> Result<ServerParameters, SfuError>;

    async fn connect_transport(
        &self,
        transport: &TransportHandle,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), SfuError>;

    async fn close_transport(&self, transport: &TransportHandle) -> Result<(), SfuError>;

    async fn produce(
        &self,
        transport: &TransportHandle,
        producer_id: &str,
        options: &ProduceOptions,
    ) -> Result<ProducerInfo, SfuError>;

    async fn close_producer(
        &self,
        transport: &TransportHandle,
        producer_id: &str,
    ) -> Result<(), SfuError>;

    async fn consume(
        &self,
        transport: &TransportHandle,
        consumer_id: &str,
        options: &ConsumeOptions,
    ) -> Result<ConsumerInfo, SfuError>;

    async fn resume_consumer(
        &self,
        transport: &TransportHandle,
        consumer_id: &str,
    ) -> Result<(), SfuError>;

    async fn close_consumer(
        &self,
        transport: &TransportHandle,
        consumer_id: &str,
    ) -> Result<(), SfuError>;

    /// Terminate a worker process the registry no longer trusts.
    async fn kill_worker(&self, worker: &WorkerRef) -> Result<(), SfuError>;

    /// Drop any per-worker client state (connections, caches).
    async fn release_worker(&self, worker: &WorkerRef) -> Result<(), SfuError>;
}
