//! Reconciliation workers.
//!
//! Each work item is handled in three steps:
//!
//! 1. a short transaction re-reads the entity and decides whether there is
//!    anything to do (an entity already past the expected state is a no-op),
//! 2. the worker RPC runs with no transaction open,
//! 3. a fresh transaction commits the result behind a state guard.
//!
//! If the entity was removed while its create RPC was in flight, the commit
//! leaves it alone and the freshly created remote object is closed again.

mod consumer;
mod producer;
mod router;
mod transport;
mod worker;

use crate::context::RequestContext;
use crate::errors::SfuError;
use crate::models::rtp::RtpCodecCapability;
use crate::models::transport::WebRtcTransportOptions;
use crate::models::{RouterRecord, TransportRecord};
use crate::queue::{run_pool, PoolOptions, QueueKind, WorkHandler, WorkItem, WorkQueue};
use crate::repositories::{ResourceStore, Tables};
use crate::rpc::{MediaWorkerClient, RouterHandle, TransportHandle, WorkerRef};
use crate::services::WorkerPicker;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handles every [`WorkItem`] kind against one store and worker client.
pub struct Reconciler {
    store: Arc<ResourceStore>,
    client: Arc<dyn MediaWorkerClient>,
    picker: Arc<WorkerPicker>,
    router_codecs: Vec<RtpCodecCapability>,
    transport_options: WebRtcTransportOptions,
}

impl Reconciler {
    pub fn new(
        store: Arc<ResourceStore>,
        client: Arc<dyn MediaWorkerClient>,
        picker: Arc<WorkerPicker>,
        router_codecs: Vec<RtpCodecCapability>,
        transport_options: WebRtcTransportOptions,
    ) -> Self {
        Self {
            store,
            client,
            picker,
            router_codecs,
            transport_options,
        }
    }
}

#[async_trait]
impl WorkHandler for Reconciler {
    async fn handle(&self, _ctx: &RequestContext, item: &WorkItem) -> Result<(), SfuError> {
        match item {
            WorkItem::RouterCreate { router_id, ip } => {
                self.create_router(router_id, ip.as_deref()).await
            }
            WorkItem::RouterDelete { router_id } => self.delete_router(router_id).await,
            WorkItem::TransportCreate { transport_id } => self.create_transport(transport_id).await,
            WorkItem::TransportConnect { transport_id } => {
                self.connect_transport(transport_id).await
            }
            WorkItem::TransportDelete { transport_id } => self.delete_transport(transport_id).await,
            WorkItem::ProducerCreate { producer_id } => self.create_producer(producer_id).await,
            WorkItem::ProducerDelete { producer_id } => self.delete_producer(producer_id).await,
            WorkItem::ConsumerCreate { consumer_id } => self.create_consumer(consumer_id).await,
            WorkItem::ConsumerDelete { consumer_id } => self.delete_consumer(consumer_id).await,
            WorkItem::ConsumerUnpause { consumer_id } => self.unpause_consumer(consumer_id).await,
            WorkItem::WorkerCleanup { worker_id } => self.cleanup_worker(worker_id).await,
        }
    }
}

/// Remote handle of `router`, if it is placed on a live worker.
fn router_handle(tables: &Tables, router: &RouterRecord) -> Option<RouterHandle> {
    let worker = tables.workers.find(router.worker_id.as_deref()?)?;
    if worker.deleted {
        return None;
    }
    Some(RouterHandle {
        worker: WorkerRef::from(worker),
        router_id: router.id.clone(),
    })
}

fn transport_handle(
    tables: &Tables,
    transport: &TransportRecord,
) -> Result<Option<TransportHandle>, SfuError> {
    let router = tables.routers.get(&transport.router_id)?;
    Ok(router_handle(tables, router).map(|handle| handle.transport(&transport.id)))
}

/// Spawn one pool per queue lane.
pub fn spawn_pools(
    queue: &Arc<WorkQueue>,
    handler: Arc<dyn WorkHandler>,
    options: PoolOptions,
    cancel_token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    QueueKind::ALL
        .into_iter()
        .map(|kind| {
            tokio::spawn(run_pool(
                Arc::clone(queue),
                kind,
                Arc::clone(&handler),
                options,
                cancel_token.clone(),
            ))
        })
        .collect()
}
