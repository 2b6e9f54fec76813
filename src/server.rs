//! HTTP server for health and metrics endpoints

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::metrics::Metrics;

/// Watcher statistics shared between the watcher loop and HTTP server
#[derive(Debug, Default, Clone, Serialize)]
pub struct WatcherStats {
    pub watcher_id: String,
    /// Current state machine state, for operators
    pub state: String,
    pub chain_head: u64,
    pub last_scanned_height: u64,
    pub processed_keys: usize,
    pub events_dispatched: u64,
    pub events_rejected: u64,
    pub events_unresolved: u64,
    pub consecutive_failures: u32,
    /// Set once the cursor has a starting point on the chain
    pub anchored: bool,
}

/// Shared state for the HTTP server
pub type SharedStats = Arc<RwLock<WatcherStats>>;
pub type SharedMetrics = Arc<Metrics>;

/// Combined app state
#[derive(Clone)]
pub struct AppState {
    pub stats: SharedStats,
    pub metrics: SharedMetrics,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(flatten)]
    pub stats: WatcherStats,
}

/// Health check endpoint handler
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.stats.read().await.clone();
    Json(HealthResponse {
        status: "healthy".to_string(),
        stats,
    })
}

/// Liveness check (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Readiness check: ready once the cursor is anchored on the chain
async fn readiness(State(state): State<AppState>) -> Response {
    if state.stats.read().await.anchored {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY").into_response()
    }
}

/// Prometheus metrics endpoint
async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let stats = state.stats.read().await;
    state.metrics.chain_head.set(stats.chain_head as i64);
    state
        .metrics
        .last_scanned_height
        .set(stats.last_scanned_height as i64);
    state.metrics.processed_keys.set(stats.processed_keys as i64);
    drop(stats);

    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(stats: SharedStats, metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(AppState { stats, metrics })
}

/// Start the HTTP server for health and metrics
pub async fn start_server(
    bind_address: &str,
    port: u16,
    stats: SharedStats,
    metrics: SharedMetrics,
) -> eyre::Result<()> {
    let app = router(stats, metrics);

    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        %addr,
        routes = "/health /healthz /readyz /metrics",
        "Health server listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}
