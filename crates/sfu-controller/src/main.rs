//! SFU Controller
//!
//! Control plane for a cluster of SFU media workers.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Build the resource store, work queue and event bus
//! 4. Spawn one reconciler pool per work queue kind
//! 5. Spawn the worker health tracker, the lifecycle event loop and store
//!    compaction
//! 6. Serve the HTTP API until a shutdown signal arrives
//! 7. Drain, then cancel background tasks

use sfu_controller::config::Config;
use sfu_controller::geo::StaticGeoIp;
use sfu_controller::models::rtp::default_router_codecs;
use sfu_controller::models::transport::WebRtcTransportOptions;
use sfu_controller::observability::HealthState;
use sfu_controller::queue::{Backoff, EventBus, PoolOptions, WorkQueue};
use sfu_controller::reconcilers::{spawn_pools, Reconciler};
use sfu_controller::repositories::ResourceStore;
use sfu_controller::routes::{self, AppState};
use sfu_controller::rpc::{HttpWorkerClient, MediaWorkerClient, WorkerStatusBoard};
use sfu_controller::scheduler::{CallScheduler, SfuScheduler, TracedScheduler};
use sfu_controller::services::{RandomWithinTolerance, WorkerPicker};
use sfu_controller::tasks::{
    start_lifecycle_event_loop, start_store_compaction, start_worker_health_tracker,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_controller=debug,sfu=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU Controller");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        queue_concurrency = config.queue_concurrency,
        worker_staleness_seconds = config.worker_staleness_seconds,
        placement_tolerance_km = config.placement_tolerance_km,
        geoip_entries = config.geoip_table.len(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        format!("Failed to install Prometheus metrics recorder: {e}")
    })?;

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    let queue = Arc::new(WorkQueue::new());
    let events = Arc::new(EventBus::new());
    let store = Arc::new(ResourceStore::new(Arc::clone(&queue), Arc::clone(&events)));
    let client: Arc<dyn MediaWorkerClient> = Arc::new(HttpWorkerClient::new()?);
    let picker = Arc::new(WorkerPicker::new(
        Arc::new(StaticGeoIp::new(config.geoip_table.clone())),
        Arc::new(RandomWithinTolerance),
        config.fallback_coordinate,
        config.placement_tolerance_km,
    ));
    let router_codecs = default_router_codecs();

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&client),
        picker,
        router_codecs.clone(),
        WebRtcTransportOptions::new(config.announced_ip.clone()),
    ));
    let pool_options = PoolOptions {
        concurrency: config.queue_concurrency,
        backoff: Backoff {
            base: Duration::from_millis(config.retry_base_ms),
            max: Duration::from_millis(config.retry_max_ms),
        },
    };
    let mut tasks = spawn_pools(&queue, reconciler, pool_options, &shutdown_token);
    health_state.mark_pools_started();
    info!(pools = tasks.len(), "Reconciler pools started");

    let scheduler: Arc<dyn CallScheduler> = Arc::new(TracedScheduler::new(SfuScheduler::new(
        Arc::clone(&store),
        router_codecs,
    )));
    let status_board = Arc::new(WorkerStatusBoard::new());

    tasks.push(tokio::spawn(start_worker_health_tracker(
        Arc::clone(&store),
        client,
        Arc::clone(&status_board),
        Duration::from_secs(config.health_check_interval_seconds),
        Duration::from_secs(config.worker_staleness_seconds),
        shutdown_token.child_token(),
    )));
    health_state.mark_worker_tracker_started();
    tasks.push(tokio::spawn(start_lifecycle_event_loop(
        events,
        Arc::clone(&scheduler),
        shutdown_token.child_token(),
    )));
    tasks.push(tokio::spawn(start_store_compaction(
        Arc::clone(&store),
        Duration::from_secs(config.purge_interval_seconds),
        Duration::from_secs(config.purge_retention_seconds),
        shutdown_token.child_token(),
    )));

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        e
    })?;
    let drain = Duration::from_secs(config.drain_seconds);

    let state = Arc::new(AppState {
        scheduler,
        status_board,
        config,
    });
    let app = routes::build_routes(state, Arc::clone(&health_state), prometheus_handle);

    // Bind before reporting ready to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind HTTP server");
        e
    })?;
    info!(addr = %addr, "SFU Controller listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&health_state), drain))
        .await?;

    shutdown_token.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("SFU Controller shutdown complete");
    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
///
/// Flips readiness off first so load balancers stop routing here, then
/// waits out the drain period.
async fn shutdown_signal(health_state: Arc<HealthState>, drain: Duration) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    health_state.start_draining();

    if drain.is_zero() {
        info!("Skipping drain period");
    } else {
        warn!("Draining connections for {} seconds...", drain.as_secs());
        tokio::time::sleep(drain).await;
        info!("Drain period complete");
    }
}
