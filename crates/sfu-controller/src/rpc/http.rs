//! HTTP adapter for the media worker RPC contract.
//!
//! Each worker advertises its base URL in `appData.endpoint`. Requests are
//! JSON; `404` on a close is treated as "already closed".

use super::{
    ConsumeOptions, ConsumerInfo, MediaWorkerClient, ProduceOptions, ProducerInfo, RouterHandle,
    TransportHandle, WorkerRef,
};
use crate::errors::SfuError;
use crate::models::rtp::RtpCodecCapability;
use crate::models::transport::WebRtcTransportOptions;
use crate::models::{DtlsParameters, ServerParameters};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, instrument, warn};

/// Default timeout for worker requests in seconds.
const WORKER_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Clone)]
pub struct HttpWorkerClient {
    client: Client,
}

impl HttpWorkerClient {
    /// # Errors
    ///
    /// Returns `SfuError::Internal` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, SfuError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(WORKER_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "sfu.rpc.http", error = %e, "Failed to build HTTP client");
                SfuError::Internal
            })?;
        Ok(Self { client })
    }

    fn url(worker: &WorkerRef, path: &str) -> Result<String, SfuError> {
        let base = worker.endpoint.as_deref().ok_or_else(|| {
            SfuError::Rpc(format!("worker {} has no RPC endpoint", worker.worker_id))
        })?;
        Ok(format!("{}{path}", base.trim_end_matches('/')))
    }

    fn router_path(router: &RouterHandle) -> String {
        format!("/routers/{}", router.router_id)
    }

    fn transport_path(transport: &TransportHandle) -> String {
        format!(
            "{}/transports/{}",
            Self::router_path(&transport.router),
            transport.transport_id
        )
    }

    async fn send(
        &self,
        method: Method,
        worker: &WorkerRef,
        path: &str,
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<reqwest::Response, SfuError> {
        let url = Self::url(worker, path)?;
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(|e| {
            warn!(
                target: "sfu.rpc.http",
                worker_id = %worker.worker_id,
                error = %e,
                "Worker request failed"
            );
            SfuError::Rpc(format!("worker {} unreachable", worker.worker_id))
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        worker: &WorkerRef,
        path: &str,
        body: &(impl Serialize + Sync),
    ) -> Result<T, SfuError> {
        let response = self.send(Method::POST, worker, path, Some(body)).await?;
        let response = Self::check(worker, response)?;
        response.json().await.map_err(|e| {
            error!(
                target: "sfu.rpc.http",
                worker_id = %worker.worker_id,
                error = %e,
                "Failed to parse worker response"
            );
            SfuError::Rpc("malformed worker response".to_string())
        })
    }

    async fn command(
        &self,
        worker: &WorkerRef,
        path: &str,
        body: &(impl Serialize + Sync),
    ) -> Result<(), SfuError> {
        let response = self.send(Method::POST, worker, path, Some(body)).await?;
        Self::check(worker, response).map(|_| ())
    }

    async fn close(&self, worker: &WorkerRef, path: &str) -> Result<(), SfuError> {
        let response = self
            .send(Method::DELETE, worker, path, None::<&()>)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(worker, response).map(|_| ())
    }

    fn check(
        worker: &WorkerRef,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, SfuError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            warn!(
                target: "sfu.rpc.http",
                worker_id = %worker.worker_id,
                status = %status,
                "Worker rejected request"
            );
            Err(SfuError::Rpc(format!(
                "worker {} returned {status}",
                worker.worker_id
            )))
        }
    }
}

#[async_trait]
impl MediaWorkerClient for HttpWorkerClient {
    #[instrument(skip(self, media_codecs), fields(worker_id = %worker.worker_id))]
    async fn create_router(
        &self,
        worker: &WorkerRef,
        router_id: &str,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterHandle, SfuError> {
        let handle = RouterHandle {
            worker: worker.clone(),
            router_id: router_id.to_string(),
        };
        self.command(
            worker,
            &Self::router_path(&handle),
            &json!({ "mediaCodecs": media_codecs }),
        )
        .await?;
        Ok(handle)
    }

    async fn close_router(&self, router: &RouterHandle) -> Result<(), SfuError> {
        self.close(&router.worker, &Self::router_path(router)).await
    }

    #[instrument(skip(self, router, options), fields(router_id = %router.router_id))]
    async fn create_webrtc_transport(
        &self,
        router: &RouterHandle,
        transport_id: &str,
        options: &WebRtcTransportOptions,
    ) -> Result<ServerParameters, SfuError> {
        let handle = router.transport(transport_id);
        self.call(&router.worker, &Self::transport_path(&handle), options)
            .await
    }

    async fn connect_transport(
        &self,
        transport: &TransportHandle,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), SfuError> {
        let path = format!("{}/connect", Self::transport_path(transport));
        self.command(
            &transport.router.worker,
            &path,
            &json!({ "dtlsParameters": dtls_parameters }),
        )
        .await
    }

    async fn close_transport(&self, transport: &TransportHandle) -> Result<(), SfuError> {
        self.close(&transport.router.worker, &Self::transport_path(transport))
            .await
    }

    async fn produce(
        &self,
        transport: &TransportHandle,
        producer_id: &str,
        options: &ProduceOptions,
    ) -> Result<ProducerInfo, SfuError> {
        let path = format!(
            "{}/producers/{producer_id}",
            Self::transport_path(transport)
        );
        self.call(&transport.router.worker, &path, options).await
    }

    async fn close_producer(
        &self,
        transport: &TransportHandle,
        producer_id: &str,
    ) -> Result<(), SfuError> {
        let path = format!(
            "{}/producers/{producer_id}",
            Self::transport_path(transport)
        );
        self.close(&transport.router.worker, &path).await
    }

    async fn consume(
        &self,
        transport: &TransportHandle,
        consumer_id: &str,
        options: &ConsumeOptions,
    ) -> Result<ConsumerInfo, SfuError> {
        let path = format!(
            "{}/consumers/{consumer_id}",
            Self::transport_path(transport)
        );
        self.call(&transport.router.worker, &path, options).await
    }

    async fn resume_consumer(
        &self,
        transport: &TransportHandle,
        consumer_id: &str,
    ) -> Result<(), SfuError> {
        let path = format!(
            "{}/consumers/{consumer_id}/resume",
            Self::transport_path(transport)
        );
        self.command(&transport.router.worker, &path, &json!({}))
            .await
    }

    async fn close_consumer(
        &self,
        transport: &TransportHandle,
        consumer_id: &str,
    ) -> Result<(), SfuError> {
        let path = format!(
            "{}/consumers/{consumer_id}",
            Self::transport_path(transport)
        );
        self.close(&transport.router.worker, &path).await
    }

    #[instrument(skip(self), fields(worker_id = %worker.worker_id))]
    async fn kill_worker(&self, worker: &WorkerRef) -> Result<(), SfuError> {
        self.command(worker, "/kill", &json!({})).await
    }

    async fn release_worker(&self, _worker: &WorkerRef) -> Result<(), SfuError> {
        // Connections are pooled by reqwest; nothing is held per worker.
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::models::rtp::default_router_codecs;
    use crate::models::transport::DtlsFingerprint;
    use crate::models::{DtlsRole, MediaKind, RtpCapabilities, RtpParameters};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn worker(server: &MockServer) -> WorkerRef {
        WorkerRef {
            worker_id: "w1".to_string(),
            endpoint: Some(format!("{}/", server.uri())),
        }
    }

    fn router(server: &MockServer) -> RouterHandle {
        RouterHandle {
            worker: worker(server),
            router_id: "r1".to_string(),
        }
    }

    fn server_parameters_json() -> serde_json::Value {
        json!({
            "iceParameters": { "usernameFragment": "ufrag", "password": "pwd", "iceLite": true },
            "iceCandidates": [
                { "foundation": "udpcandidate", "priority": 1076302079, "ip": "198.51.100.1", "port": 40000, "protocol": "udp" }
            ],
            "fingerprints": [ { "algorithm": "sha-256", "value": "AA:BB" } ]
        })
    }

    #[tokio::test]
    async fn test_create_router_posts_codecs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routers/r1"))
            .and(body_string_contains("mediaCodecs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new().unwrap();
        let handle = client
            .create_router(&worker(&server), "r1", &default_router_codecs())
            .await
            .unwrap();

        assert_eq!(handle.router_id, "r1");
        assert_eq!(handle.worker.worker_id, "w1");
    }

    #[tokio::test]
    async fn test_create_transport_returns_server_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routers/r1/transports/t1"))
            .and(body_string_contains("enableUdp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(server_parameters_json()))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new().unwrap();
        let parameters = client
            .create_webrtc_transport(&router(&server), "t1", &WebRtcTransportOptions::new(None))
            .await
            .unwrap();

        assert_eq!(parameters.ice_parameters.username_fragment, "ufrag");
        assert!(parameters.ice_parameters.ice_lite);
        assert_eq!(parameters.ice_candidates.len(), 1);
        assert_eq!(parameters.fingerprints.first().unwrap().value, "AA:BB");
    }

    #[tokio::test]
    async fn test_connect_sends_dtls_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routers/r1/transports/t1/connect"))
            .and(body_string_contains("dtlsParameters"))
            .and(body_string_contains("\"client\""))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new().unwrap();
        let dtls = DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "0A:1B".to_string(),
            }],
        };
        client
            .connect_transport(&router(&server).transport("t1"), &dtls)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_produce_and_consume_parse_worker_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routers/r1/transports/t1/producers/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rawId": "raw-p1" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/routers/r1/transports/t2/consumers/c1"))
            .and(body_string_contains("\"producerRawId\":\"raw-p1\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rawId": "raw-c1",
                "rtpParameters": { "mid": "0", "codecs": [] }
            })))
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new().unwrap();
        let router = router(&server);
        let producer = client
            .produce(
                &router.transport("t1"),
                "p1",
                &ProduceOptions {
                    kind: MediaKind::Audio,
                    rtp_parameters: RtpParameters::default(),
                    paused: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(producer.raw_id, "raw-p1");

        let consumer = client
            .consume(
                &router.transport("t2"),
                "c1",
                &ConsumeOptions {
                    producer_raw_id: producer.raw_id,
                    rtp_capabilities: RtpCapabilities::default(),
                    paused: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(consumer.raw_id, "raw-c1");
        assert_eq!(consumer.rtp_parameters.mid.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_resume_consumer_posts_to_resume() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routers/r1/transports/t2/consumers/c1/resume"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new().unwrap();
        client
            .resume_consumer(&router(&server).transport("t2"), "c1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_treats_404_as_closed() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/routers/r1/transports/t1/producers/p1"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/routers/r1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new().unwrap();
        let router = router(&server);
        client
            .close_producer(&router.transport("t1"), "p1")
            .await
            .unwrap();
        client.close_router(&router).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_server_error_is_rpc_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/routers/r1/transports/t1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new().unwrap();
        let result = client.close_transport(&router(&server).transport("t1")).await;

        assert!(matches!(result, Err(SfuError::Rpc(_))));
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_rejected_create_is_rpc_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routers/r1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new().unwrap();
        let result = client
            .create_router(&worker(&server), "r1", &default_router_codecs())
            .await;

        assert!(matches!(result, Err(SfuError::Rpc(_))));
    }

    #[tokio::test]
    async fn test_malformed_response_is_rpc_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routers/r1/transports/t1/producers/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new().unwrap();
        let result = client
            .produce(
                &router(&server).transport("t1"),
                "p1",
                &ProduceOptions {
                    kind: MediaKind::Video,
                    rtp_parameters: RtpParameters::default(),
                    paused: false,
                },
            )
            .await;

        assert!(matches!(result, Err(SfuError::Rpc(_))));
    }

    #[tokio::test]
    async fn test_kill_worker_posts_kill() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/kill"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new().unwrap();
        client.kill_worker(&worker(&server)).await.unwrap();
        client.release_worker(&worker(&server)).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_without_endpoint_is_rpc_error() {
        let client = HttpWorkerClient::new().unwrap();
        let worker = WorkerRef {
            worker_id: "w9".to_string(),
            endpoint: None,
        };

        let result = client.kill_worker(&worker).await;

        match result {
            Err(SfuError::Rpc(message)) => assert!(message.contains("w9")),
            other => panic!("expected an RPC error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_rpc_error() {
        let client = HttpWorkerClient::new().unwrap();
        let worker = WorkerRef {
            worker_id: "w1".to_string(),
            // Reserved port, nothing listens on it.
            endpoint: Some("http://127.0.0.1:9".to_string()),
        };

        let result = client
            .close_router(&RouterHandle {
                worker,
                router_id: "r1".to_string(),
            })
            .await;

        assert!(matches!(result, Err(SfuError::Rpc(_))));
    }
}
