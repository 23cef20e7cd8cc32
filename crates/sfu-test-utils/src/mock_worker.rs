//! Mock media worker.
//!
//! Keeps routers, transports, producers and consumers in memory and behaves
//! like a real worker where the controller relies on it: every call is
//! idempotent by id, closing cascades to children, and consuming needs a
//! live producer the consumer can decode.
//!
//! # Example
//!
//! ```rust,ignore
//! let worker = MockMediaWorker::new();
//! worker.fail_next(WorkerOp::CreateRouter, 2);
//!
//! // ...drive the controller...
//!
//! assert_eq!(worker.calls(WorkerOp::CreateRouter), 3);
//! assert_eq!(worker.open_routers().len(), 1);
//! ```
//!
//! [`MockMediaWorker::during_next`] runs a callback while a create call is in
//! flight, after the controller has read its state and before it commits.

use async_trait::async_trait;
use sfu_controller::errors::SfuError;
use sfu_controller::models::rtp::RtpCodecCapability;
use sfu_controller::models::transport::{
    DtlsFingerprint, IceCandidate, IceParameters, IceProtocol, WebRtcTransportOptions,
};
use sfu_controller::models::{DtlsParameters, RtpParameters, ServerParameters};
use sfu_controller::rpc::{
    ConsumeOptions, ConsumerInfo, MediaWorkerClient, ProduceOptions, ProducerInfo, RouterHandle,
    TransportHandle, WorkerRef,
};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;

/// Callback run inside a worker call; receives the id of the entity being
/// created.
type Hook = Box<dyn FnOnce(&str) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerOp {
    CreateRouter,
    CloseRouter,
    CreateTransport,
    ConnectTransport,
    CloseTransport,
    Produce,
    CloseProducer,
    Consume,
    ResumeConsumer,
    CloseConsumer,
    KillWorker,
    ReleaseWorker,
}

#[derive(Debug, Clone)]
struct TransportEntry {
    router_id: String,
    dtls: Option<DtlsParameters>,
}

#[derive(Debug, Clone)]
struct ProducerEntry {
    transport_id: String,
    raw_id: String,
    rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone)]
struct ConsumerEntry {
    transport_id: String,
    producer_raw_id: String,
    paused: bool,
}

#[derive(Debug, Default)]
struct State {
    routers: HashMap<String, String>,
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
    calls: HashMap<WorkerOp, usize>,
    failures: HashMap<WorkerOp, u32>,
    killed: Vec<String>,
    released: Vec<String>,
    next_ssrc: u32,
}

impl State {
    fn close_transport(&mut self, transport_id: &str) {
        self.transports.remove(transport_id);
        self.producers.retain(|_, p| p.transport_id != transport_id);
        self.consumers.retain(|_, c| c.transport_id != transport_id);
        // Consumers of producers that just went away are closed too.
        let raw_ids: BTreeSet<String> = self.producers.values().map(|p| p.raw_id.clone()).collect();
        self.consumers
            .retain(|_, c| raw_ids.contains(&c.producer_raw_id));
    }
}

/// In-memory [`MediaWorkerClient`].
#[derive(Default)]
pub struct MockMediaWorker {
    state: Mutex<State>,
    hooks: Mutex<HashMap<WorkerOp, Hook>>,
}

impl fmt::Debug for MockMediaWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockMediaWorker")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl MockMediaWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` during the next call of `op`. Only the create calls
    /// (`CreateRouter`, `CreateTransport`, `Produce`, `Consume`) run hooks.
    pub fn during_next(&self, op: WorkerOp, hook: impl FnOnce(&str) + Send + 'static) {
        self.hooks.lock().unwrap().insert(op, Box::new(hook));
    }

    fn run_hook(&self, op: WorkerOp, id: &str) {
        let hook = self.hooks.lock().unwrap().remove(&op);
        if let Some(hook) = hook {
            hook(id);
        }
    }

    /// Make the next `times` calls of `op` fail with a retryable RPC error.
    pub fn fail_next(&self, op: WorkerOp, times: u32) {
        self.state.lock().unwrap().failures.insert(op, times);
    }

    /// Number of calls of `op` so far, failed ones included.
    pub fn calls(&self, op: WorkerOp) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&op)
            .copied()
            .unwrap_or_default()
    }

    pub fn open_routers(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().routers.keys().cloned().collect()
    }

    /// Worker hosting `router_id`, if the router is open.
    pub fn router_worker(&self, router_id: &str) -> Option<String> {
        self.state.lock().unwrap().routers.get(router_id).cloned()
    }

    pub fn open_transports(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().transports.keys().cloned().collect()
    }

    pub fn open_producers(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().producers.keys().cloned().collect()
    }

    pub fn open_consumers(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().consumers.keys().cloned().collect()
    }

    /// DTLS parameters a transport was connected with.
    pub fn transport_dtls(&self, transport_id: &str) -> Option<DtlsParameters> {
        self.state
            .lock()
            .unwrap()
            .transports
            .get(transport_id)
            .and_then(|t| t.dtls.clone())
    }

    pub fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.state
            .lock()
            .unwrap()
            .consumers
            .get(consumer_id)
            .map(|c| c.paused)
    }

    pub fn killed_workers(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn released_workers(&self) -> Vec<String> {
        self.state.lock().unwrap().released.clone()
    }

    /// Count the call and consume one injected failure, if any.
    fn enter(&self, op: WorkerOp) -> Result<std::sync::MutexGuard<'_, State>, SfuError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_default() += 1;
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SfuError::Rpc(format!("injected {op:?} failure")));
            }
        }
        Ok(state)
    }
}

/// Server parameters every mock transport reports.
pub fn mock_server_parameters(transport_id: &str, announced_ip: Option<&str>) -> ServerParameters {
    ServerParameters {
        ice_parameters: IceParameters {
            username_fragment: format!("ufrag-{transport_id}"),
            password: format!("pwd-{transport_id}"),
            ice_lite: true,
        },
        ice_candidates: vec![IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: 1_076_302_079,
            ip: announced_ip.unwrap_or("203.0.113.10").to_string(),
            port: 40_000,
            protocol: IceProtocol::Udp,
            tcp_type: None,
        }],
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "5F:1D:9A:33:0C:E2:7B:48".to_string(),
        }],
    }
}

#[async_trait]
impl MediaWorkerClient for MockMediaWorker {
    async fn create_router(
        &self,
        worker: &WorkerRef,
        router_id: &str,
        _media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterHandle, SfuError> {
        self.run_hook(WorkerOp::CreateRouter, router_id);
        let mut state = self.enter(WorkerOp::CreateRouter)?;
        state
            .routers
            .entry(router_id.to_string())
            .or_insert_with(|| worker.worker_id.clone());
        Ok(RouterHandle {
            worker: worker.clone(),
            router_id: router_id.to_string(),
        })
    }

    async fn close_router(&self, router: &RouterHandle) -> Result<(), SfuError> {
        let mut state = self.enter(WorkerOp::CloseRouter)?;
        state.routers.remove(&router.router_id);
        let transports: Vec<String> = state
            .transports
            .iter()
            .filter(|(_, t)| t.router_id == router.router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in transports {
            state.close_transport(&transport_id);
        }
        Ok(())
    }

    async fn create_webrtc_transport(
        &self,
        router: &RouterHandle,
        transport_id: &str,
        options: &WebRtcTransportOptions,
    ) -> Result<ServerParameters, SfuError> {
        self.run_hook(WorkerOp::CreateTransport, transport_id);
        let mut state = self.enter(WorkerOp::CreateTransport)?;
        if !state.routers.contains_key(&router.router_id) {
            return Err(SfuError::Rpc(format!("router {} not found", router.router_id)));
        }
        state
            .transports
            .entry(transport_id.to_string())
            .or_insert_with(|| TransportEntry {
                router_id: router.router_id.clone(),
                dtls: None,
            });
        Ok(mock_server_parameters(
            transport_id,
            options.announced_ip.as_deref(),
        ))
    }

    async fn connect_transport(
        &self,
        transport: &TransportHandle,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), SfuError> {
        let mut state = self.enter(WorkerOp::ConnectTransport)?;
        let entry = state
            .transports
            .get_mut(&transport.transport_id)
            .ok_or_else(|| SfuError::Rpc(format!("transport {} not found", transport.transport_id)))?;
        entry.dtls.get_or_insert_with(|| dtls_parameters.clone());
        Ok(())
    }

    async fn close_transport(&self, transport: &TransportHandle) -> Result<(), SfuError> {
        let mut state = self.enter(WorkerOp::CloseTransport)?;
        state.close_transport(&transport.transport_id);
        Ok(())
    }

    async fn produce(
        &self,
        transport: &TransportHandle,
        producer_id: &str,
        options: &ProduceOptions,
    ) -> Result<ProducerInfo, SfuError> {
        self.run_hook(WorkerOp::Produce, producer_id);
        let mut state = self.enter(WorkerOp::Produce)?;
        if !state.transports.contains_key(&transport.transport_id) {
            return Err(SfuError::Rpc(format!(
                "transport {} not found",
                transport.transport_id
            )));
        }
        let raw_id = format!("raw-{producer_id}");
        state
            .producers
            .entry(producer_id.to_string())
            .or_insert_with(|| ProducerEntry {
                transport_id: transport.transport_id.clone(),
                raw_id: raw_id.clone(),
                rtp_parameters: options.rtp_parameters.clone(),
            });
        Ok(ProducerInfo { raw_id })
    }

    async fn close_producer(
        &self,
        _transport: &TransportHandle,
        producer_id: &str,
    ) -> Result<(), SfuError> {
        let mut state = self.enter(WorkerOp::CloseProducer)?;
        if let Some(producer) = state.producers.remove(producer_id) {
            state
                .consumers
                .retain(|_, c| c.producer_raw_id != producer.raw_id);
        }
        Ok(())
    }

    async fn consume(
        &self,
        transport: &TransportHandle,
        consumer_id: &str,
        options: &ConsumeOptions,
    ) -> Result<ConsumerInfo, SfuError> {
        self.run_hook(WorkerOp::Consume, consumer_id);
        let mut state = self.enter(WorkerOp::Consume)?;
        if !state.transports.contains_key(&transport.transport_id) {
            return Err(SfuError::Rpc(format!(
                "transport {} not found",
                transport.transport_id
            )));
        }
        let producer = state
            .producers
            .values()
            .find(|p| p.raw_id == options.producer_raw_id)
            .cloned()
            .ok_or_else(|| {
                SfuError::Rpc(format!("producer {} not found", options.producer_raw_id))
            })?;

        let mut rtp_parameters = producer.rtp_parameters;
        rtp_parameters.mid = None;
        rtp_parameters
            .codecs
            .retain(|c| c.is_rtx() || options.rtp_capabilities.supports(c));
        if rtp_parameters.media_codecs().next().is_none() {
            return Err(SfuError::Rpc(format!(
                "consumer {consumer_id} cannot decode producer {}",
                options.producer_raw_id
            )));
        }
        state.next_ssrc += 1;
        let ssrc = 100_000 + state.next_ssrc;
        for encoding in &mut rtp_parameters.encodings {
            encoding.ssrc = Some(ssrc);
            encoding.rtx = None;
        }

        state
            .consumers
            .entry(consumer_id.to_string())
            .or_insert_with(|| ConsumerEntry {
                transport_id: transport.transport_id.clone(),
                producer_raw_id: options.producer_raw_id.clone(),
                paused: options.paused,
            });
        Ok(ConsumerInfo {
            raw_id: format!("raw-{consumer_id}"),
            rtp_parameters,
        })
    }

    async fn resume_consumer(
        &self,
        _transport: &TransportHandle,
        consumer_id: &str,
    ) -> Result<(), SfuError> {
        let mut state = self.enter(WorkerOp::ResumeConsumer)?;
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SfuError::Rpc(format!("consumer {consumer_id} not found")))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_consumer(
        &self,
        _transport: &TransportHandle,
        consumer_id: &str,
    ) -> Result<(), SfuError> {
        let mut state = self.enter(WorkerOp::CloseConsumer)?;
        state.consumers.remove(consumer_id);
        Ok(())
    }

    async fn kill_worker(&self, worker: &WorkerRef) -> Result<(), SfuError> {
        let mut state = self.enter(WorkerOp::KillWorker)?;
        state.killed.push(worker.worker_id.clone());
        Ok(())
    }

    async fn release_worker(&self, worker: &WorkerRef) -> Result<(), SfuError> {
        let mut state = self.enter(WorkerOp::ReleaseWorker)?;
        state.released.push(worker.worker_id.clone());
        let routers: Vec<String> = state
            .routers
            .iter()
            .filter(|(_, w)| **w == worker.worker_id)
            .map(|(id, _)| id.clone())
            .collect();
        for router_id in routers {
            state.routers.remove(&router_id);
        }
        Ok(())
    }
}
