//! HTTP API tests.
//!
//! Drives the full router (façade handlers, worker status, health and
//! metrics) in-process with `tower::ServiceExt::oneshot`, backed by a
//! [`TestCluster`].

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use sfu_controller::config::Config;
use sfu_controller::observability::HealthState;
use sfu_controller::routes::{build_routes, AppState};
use sfu_controller::rpc::WorkerStatusBoard;
use sfu_test_utils::*;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

const PEERS: &str = "/v1/calls/call-1/peers";

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    health: Arc<HealthState>,
    cluster: TestCluster,
}

impl TestApp {
    async fn spawn() -> Self {
        let cluster = TestCluster::builder()
            .worker("w1", "198.51.100.1")
            .build()
            .await;
        let state = Arc::new(AppState {
            scheduler: Arc::clone(cluster.scheduler()),
            status_board: Arc::new(WorkerStatusBoard::new()),
            config: Config::default(),
        });
        let health = Arc::new(HealthState::new());
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let router = build_routes(Arc::clone(&state), Arc::clone(&health), handle);
        Self {
            router,
            state,
            health,
            cluster,
        }
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value), anyhow::Error> {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => builder.body(Body::empty())?,
        };
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        Ok((status, value))
    }

    async fn join(&self, peer_id: &str, role: &str) -> Result<Value, anyhow::Error> {
        let (status, body) = self
            .send(
                Method::POST,
                PEERS,
                Some(json!({
                    "peer_id": peer_id,
                    "role": role,
                    "sources": { "audio": true },
                    "capabilities": full_capabilities(),
                })),
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "join failed: {body}");
        Ok(body)
    }
}

fn stream_of<'a>(views: &'a Value, direction: &str) -> &'a Value {
    views
        .as_array()
        .expect("stream list")
        .iter()
        .find(|v| v["direction"] == direction)
        .expect("missing stream")
}

// ============================================================================
// Peers
// ============================================================================

#[tokio::test]
async fn test_add_peer_returns_201_with_streams() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;

    let views = app.join("alice", "speaker").await?;

    assert_eq!(views.as_array().map(Vec::len), Some(2));
    let send = stream_of(&views, "send");
    assert_eq!(send["state"], "wait-offer");
    assert_eq!(send["seq"], 0);
    assert!(send.get("sdp").is_none());
    assert_eq!(stream_of(&views, "recv")["state"], "need-offer");
    Ok(())
}

#[tokio::test]
async fn test_add_peer_twice_returns_409() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;
    app.join("alice", "listener").await?;

    let (status, body) = app
        .send(
            Method::POST,
            PEERS,
            Some(json!({ "peer_id": "alice", "role": "listener" })),
        )
        .await?;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INVALID_STATE");
    Ok(())
}

#[tokio::test]
async fn test_add_peer_requires_peer_id() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;

    let (status, body) = app
        .send(
            Method::POST,
            PEERS,
            Some(json!({ "peer_id": "  ", "role": "speaker" })),
        )
        .await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
    Ok(())
}

#[tokio::test]
async fn test_add_peer_rejects_unknown_role() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;

    let (status, _) = app
        .send(
            Method::POST,
            PEERS,
            Some(json!({ "peer_id": "alice", "role": "moderator" })),
        )
        .await?;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    Ok(())
}

#[tokio::test]
async fn test_remove_peer_returns_204_then_404() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;
    app.join("alice", "speaker").await?;

    let uri = format!("{PEERS}/alice");
    let (status, _) = app.send(Method::DELETE, &uri, None).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = app.send(Method::DELETE, &uri, None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn test_list_streams() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;
    let joined = app.join("alice", "speaker").await?;

    let (status, listed) = app
        .send(Method::GET, &format!("{PEERS}/alice/streams"), None)
        .await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed, joined);

    let (status, _) = app
        .send(Method::GET, &format!("{PEERS}/nobody/streams"), None)
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_role_switch_changes_streams() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;
    app.join("alice", "speaker").await?;

    let (status, views) = app
        .send(
            Method::PUT,
            &format!("{PEERS}/alice/role"),
            Some(json!({ "role": "listener" })),
        )
        .await?;

    assert_eq!(status, StatusCode::OK);
    let views = views.as_array().expect("stream list");
    assert_eq!(views.len(), 1);
    assert_eq!(views[0]["direction"], "recv");
    Ok(())
}

#[tokio::test]
async fn test_update_sources_returns_streams() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;
    app.join("alice", "speaker").await?;

    let (status, views) = app
        .send(
            Method::PUT,
            &format!("{PEERS}/alice/sources"),
            Some(json!({ "audio": true, "video": true })),
        )
        .await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(views.as_array().map(Vec::len), Some(2));
    Ok(())
}

// ============================================================================
// Negotiation
// ============================================================================

#[tokio::test]
async fn test_offer_and_answer_over_http() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;
    let alice = app.join("alice", "speaker").await?;
    let bob = app.join("bob", "listener").await?;
    app.cluster.settle().await;

    let send_id = stream_of(&alice, "send")["stream_id"]
        .as_str()
        .expect("stream id")
        .to_string();
    let (sdp, hints) = ClientOffer::new().audio("0").build();
    let (status, view) = app
        .send(
            Method::POST,
            &format!("{PEERS}/alice/streams/{send_id}/offer"),
            Some(json!({ "sdp": sdp, "hints": hints })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "offer failed: {view}");
    assert_eq!(view["stream_id"], send_id.as_str());
    app.cluster.settle().await;

    let (_, streams) = app
        .send(Method::GET, &format!("{PEERS}/alice/streams"), None)
        .await?;
    let send = stream_of(&streams, "send");
    assert_eq!(send["state"], "online");
    assert!(send["sdp"].as_str().is_some_and(|s| s.contains("a=ice-lite")));

    let recv_id = stream_of(&bob, "recv")["stream_id"]
        .as_str()
        .expect("stream id")
        .to_string();
    let (_, streams) = app
        .send(Method::GET, &format!("{PEERS}/bob/streams"), None)
        .await?;
    let offer = stream_of(&streams, "recv")["sdp"]
        .as_str()
        .expect("server offer")
        .to_string();
    let (status, view) = app
        .send(
            Method::POST,
            &format!("{PEERS}/bob/streams/{recv_id}/answer"),
            Some(json!({ "sdp": answer_for(&offer) })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "answer failed: {view}");
    assert_eq!(view["state"], "online");
    Ok(())
}

#[tokio::test]
async fn test_empty_sdp_is_bad_request() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;
    let alice = app.join("alice", "speaker").await?;
    let send_id = stream_of(&alice, "send")["stream_id"]
        .as_str()
        .expect("stream id")
        .to_string();

    for action in ["offer", "answer"] {
        let (status, body) = app
            .send(
                Method::POST,
                &format!("{PEERS}/alice/streams/{send_id}/{action}"),
                Some(json!({ "sdp": "" })),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{action}");
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }
    Ok(())
}

#[tokio::test]
async fn test_malformed_sdp_is_negotiation_failure() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;
    let alice = app.join("alice", "speaker").await?;
    app.cluster.settle().await;
    let send_id = stream_of(&alice, "send")["stream_id"]
        .as_str()
        .expect("stream id")
        .to_string();

    let (status, body) = app
        .send(
            Method::POST,
            &format!("{PEERS}/alice/streams/{send_id}/offer"),
            Some(json!({ "sdp": "this is not sdp" })),
        )
        .await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "NEGOTIATION_FAILED");
    Ok(())
}

#[tokio::test]
async fn test_unsupported_operations_return_501() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;
    let alice = app.join("alice", "speaker").await?;
    let send_id = stream_of(&alice, "send")["stream_id"]
        .as_str()
        .expect("stream id")
        .to_string();
    let stream = format!("{PEERS}/alice/streams/{send_id}");

    let requests = [
        (
            Method::POST,
            format!("{stream}/candidate"),
            Some(json!({ "candidate": "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host" })),
        ),
        (Method::POST, format!("{stream}/failed"), None),
        (
            Method::PUT,
            format!("{PEERS}/alice/consumes"),
            Some(json!({ "consumes": [] })),
        ),
    ];
    for (method, uri, body) in requests {
        let (status, response) = app.send(method, &uri, body).await?;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED, "{uri}");
        assert_eq!(response["error"]["code"], "NOT_SUPPORTED");
    }
    Ok(())
}

// ============================================================================
// Workers, health, metrics
// ============================================================================

#[tokio::test]
async fn test_worker_status_is_recorded() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;

    let (status, _) = app
        .send(
            Method::POST,
            "/v1/workers/status",
            Some(json!({
                "worker_id": "w2",
                "status": "healthy",
                "app_data": { "ip": "198.51.100.2" },
            })),
        )
        .await?;

    assert_eq!(status, StatusCode::ACCEPTED);
    let snapshot = app.state.status_board.snapshot(Duration::from_secs(60));
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, "w2");
    assert!(snapshot[0].healthy);
    assert_eq!(snapshot[0].app_data.ip, "198.51.100.2");
    Ok(())
}

#[tokio::test]
async fn test_worker_status_validates_input() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;

    for body in [
        json!({ "worker_id": "", "status": "healthy", "app_data": { "ip": "198.51.100.2" } }),
        json!({ "worker_id": "w2", "status": "healthy", "app_data": { "ip": " " } }),
    ] {
        let (status, _) = app
            .send(Method::POST, "/v1/workers/status", Some(body))
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
    assert!(app
        .state
        .status_board
        .snapshot(Duration::from_secs(60))
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_health_and_readiness() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;

    let (status, _) = app.send(Method::GET, "/health", None).await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.send(Method::GET, "/ready", None).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    app.health.mark_pools_started();
    app.health.mark_worker_tracker_started();
    let (status, _) = app.send(Method::GET, "/ready", None).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_responds() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())?;
    let response = app.router.clone().oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_unknown_route_returns_404() -> Result<(), anyhow::Error> {
    let app = TestApp::spawn().await;
    let (status, _) = app.send(Method::GET, "/v1/nonexistent", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}
