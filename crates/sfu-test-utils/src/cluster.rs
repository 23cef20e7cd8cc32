//! Deterministic in-process controller.
//!
//! `TestCluster` wires the real store, queue, event bus, reconciler and
//! scheduler to a [`MockMediaWorker`]. Nothing runs in the background:
//! [`TestCluster::settle`] drains the queue lanes and the event bus in
//! rounds until both are empty, so tests observe every intermediate state.

use crate::fixtures::{answer_for, full_capabilities, geo_table, worker_app_data, ClientOffer};
use crate::mock_worker::MockMediaWorker;
use sfu_controller::context::RequestContext;
use sfu_controller::errors::SfuError;
use sfu_controller::geo::{Coordinate, StaticGeoIp};
use sfu_controller::models::rtp::default_router_codecs;
use sfu_controller::models::transport::WebRtcTransportOptions;
use sfu_controller::models::{Role, Sources, TransportDirection};
use sfu_controller::queue::pool::{execute, Execution};
use sfu_controller::queue::{EventBus, QueueKind, WorkQueue};
use sfu_controller::reconcilers::Reconciler;
use sfu_controller::repositories::{ResourceStore, Tables};
use sfu_controller::rpc::{LiveWorker, MediaWorkerClient};
use sfu_controller::scheduler::{CallScheduler, PeerJoin, SfuScheduler, StreamView};
use sfu_controller::services::{NearestFirst, PlacementPolicy, WorkerDiff, WorkerPicker, WorkerRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Upper bound on drain rounds; a cluster that is still busy after this
/// many is retrying forever.
const MAX_SETTLE_ROUNDS: usize = 64;

pub struct TestClusterBuilder {
    workers: Vec<LiveWorker>,
    geo: HashMap<String, Coordinate>,
    policy: Arc<dyn PlacementPolicy>,
    fallback: Coordinate,
    tolerance_km: f64,
}

impl Default for TestClusterBuilder {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            geo: geo_table(),
            policy: Arc::new(NearestFirst),
            // Berlin
            fallback: Coordinate {
                lat: 52.52,
                long: 13.40,
            },
            tolerance_km: 100.0,
        }
    }
}

impl TestClusterBuilder {
    /// Add a healthy worker.
    pub fn worker(mut self, id: &str, ip: &str) -> Self {
        self.workers.push(LiveWorker {
            id: id.to_string(),
            healthy: true,
            app_data: worker_app_data(ip),
        });
        self
    }

    pub fn geo(mut self, geo: HashMap<String, Coordinate>) -> Self {
        self.geo = geo;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PlacementPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn tolerance_km(mut self, tolerance_km: f64) -> Self {
        self.tolerance_km = tolerance_km;
        self
    }

    pub fn fallback(mut self, fallback: Coordinate) -> Self {
        self.fallback = fallback;
        self
    }

    /// Build the cluster and register the configured workers.
    pub async fn build(self) -> TestCluster {
        let queue = Arc::new(WorkQueue::new());
        let events = Arc::new(EventBus::new());
        let store = Arc::new(ResourceStore::new(Arc::clone(&queue), Arc::clone(&events)));
        let worker = Arc::new(MockMediaWorker::new());
        let client: Arc<dyn MediaWorkerClient> = Arc::clone(&worker) as Arc<dyn MediaWorkerClient>;
        let picker = Arc::new(WorkerPicker::new(
            Arc::new(StaticGeoIp::new(self.geo)),
            self.policy,
            self.fallback,
            self.tolerance_km,
        ));
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&client),
            picker,
            default_router_codecs(),
            WebRtcTransportOptions::new(None),
        );
        let scheduler: Arc<dyn CallScheduler> =
            Arc::new(SfuScheduler::new(Arc::clone(&store), default_router_codecs()));

        let cluster = TestCluster {
            store,
            queue,
            events,
            worker,
            client,
            reconciler,
            scheduler,
            delivered: Mutex::new(Vec::new()),
        };
        if !self.workers.is_empty() {
            cluster
                .set_workers(&self.workers)
                .await
                .expect("initial worker registration failed");
        }
        cluster
    }
}

pub struct TestCluster {
    store: Arc<ResourceStore>,
    queue: Arc<WorkQueue>,
    events: Arc<EventBus>,
    worker: Arc<MockMediaWorker>,
    client: Arc<dyn MediaWorkerClient>,
    reconciler: Reconciler,
    scheduler: Arc<dyn CallScheduler>,
    delivered: Mutex<Vec<&'static str>>,
}

impl TestCluster {
    pub fn builder() -> TestClusterBuilder {
        TestClusterBuilder::default()
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn worker(&self) -> &MockMediaWorker {
        &self.worker
    }

    pub fn scheduler(&self) -> &Arc<dyn CallScheduler> {
        &self.scheduler
    }

    /// Committed tables.
    pub fn tables(&self) -> Tables {
        self.store
            .read(|tables| tables.clone())
            .expect("store lock poisoned")
    }

    /// Replace the observed worker set, as the health tracker would.
    pub async fn set_workers(&self, live: &[LiveWorker]) -> Result<WorkerDiff, SfuError> {
        WorkerRegistry::on_workers_changed(&self.store, self.client.as_ref(), live).await
    }

    /// Nothing queued and no undelivered events.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.events.is_empty()
    }

    /// Run queued work and deliver events until the cluster is idle.
    ///
    /// Each round takes a snapshot of every lane, executes those items
    /// (re-queuing retries for the next round), then hands every pending
    /// event to the scheduler. Returns the number of rounds run.
    pub async fn settle(&self) -> usize {
        let mut rounds = 0;
        while !self.is_idle() && rounds < MAX_SETTLE_ROUNDS {
            rounds += 1;
            self.run_queued().await;
            self.deliver_events().await;
        }
        rounds
    }

    /// One pass over every lane. Returns the executions in run order.
    pub async fn run_queued(&self) -> Vec<Execution> {
        let mut batch = Vec::new();
        for kind in QueueKind::ALL {
            while let Some(envelope) = self.queue.try_pop(kind) {
                batch.push(envelope);
            }
        }
        let mut executions = Vec::with_capacity(batch.len());
        for envelope in batch {
            let execution = execute(&self.reconciler, envelope).await;
            if let Execution::Retry(next) = &execution {
                self.queue.push_envelope(next.clone());
            }
            executions.push(execution);
        }
        executions
    }

    /// Hand every pending event to the scheduler.
    pub async fn deliver_events(&self) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.events.try_next() {
            let ctx = RequestContext::new("lifecycle_event");
            if let Err(e) = self.scheduler.on_lifecycle_event(&ctx, &event).await {
                tracing::warn!(event = event.name(), error = %e, "Test event handling failed");
            }
            self.delivered.lock().unwrap().push(event.name());
            delivered += 1;
        }
        delivered
    }

    /// Names of every event handed to the scheduler so far, in order.
    pub fn delivered_events(&self) -> Vec<&'static str> {
        self.delivered.lock().unwrap().clone()
    }

    pub async fn try_join(&self, call_id: &str, peer: PeerJoin) -> Result<Vec<StreamView>, SfuError> {
        let ctx = RequestContext::new("peer_added");
        self.scheduler.on_peer_added(&ctx, call_id, peer).await
    }

    /// Join with full capabilities and no placement hint.
    pub async fn join(
        &self,
        call_id: &str,
        peer_id: &str,
        role: Role,
        sources: Sources,
    ) -> Vec<StreamView> {
        self.try_join(
            call_id,
            PeerJoin {
                peer_id: peer_id.to_string(),
                role,
                sources,
                capabilities: full_capabilities(),
                ip: None,
            },
        )
        .await
        .expect("join failed")
    }

    pub async fn leave(&self, call_id: &str, peer_id: &str) -> Result<(), SfuError> {
        let ctx = RequestContext::new("peer_removed");
        self.scheduler.on_peer_removed(&ctx, call_id, peer_id).await
    }

    pub async fn streams(&self, call_id: &str, peer_id: &str) -> Result<Vec<StreamView>, SfuError> {
        let ctx = RequestContext::new("peer_streams");
        self.scheduler.peer_streams(&ctx, call_id, peer_id).await
    }

    /// The peer's live end-stream in `direction`.
    pub async fn stream(
        &self,
        call_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> Option<StreamView> {
        self.streams(call_id, peer_id)
            .await
            .ok()?
            .into_iter()
            .find(|s| s.direction == direction)
    }

    /// Offer on the peer's send stream.
    pub async fn offer(
        &self,
        call_id: &str,
        peer_id: &str,
        offer: &ClientOffer,
    ) -> Result<StreamView, SfuError> {
        let stream = self
            .stream(call_id, peer_id, TransportDirection::Send)
            .await
            .ok_or_else(|| SfuError::NotFound(format!("send stream of {peer_id}")))?;
        let (sdp, hints) = offer.build();
        let ctx = RequestContext::new("offer");
        self.scheduler
            .on_stream_offer(&ctx, call_id, peer_id, &stream.stream_id, &sdp, &hints)
            .await
    }

    /// Answer the server offer currently on the peer's receive stream.
    pub async fn answer(&self, call_id: &str, peer_id: &str) -> Result<StreamView, SfuError> {
        let stream = self
            .stream(call_id, peer_id, TransportDirection::Recv)
            .await
            .ok_or_else(|| SfuError::NotFound(format!("recv stream of {peer_id}")))?;
        let offer = stream
            .sdp
            .ok_or_else(|| SfuError::InvalidState(format!("no server offer for {peer_id}")))?;
        let ctx = RequestContext::new("answer");
        self.scheduler
            .on_stream_answer(&ctx, call_id, peer_id, &stream.stream_id, &answer_for(&offer))
            .await
    }
}
