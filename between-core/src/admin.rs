use crate::Result;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::net::TcpListener;
use tracing::info;

/// Shared state for metrics
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub active_connections: AtomicU64,
    // Advisory failures; the exchange still completes
    pub hook_errors: AtomicU64,
    pub transport_errors: AtomicU64,
    pub responses_relayed: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            hook_errors: self.hook_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            responses_relayed: self.responses_relayed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub active_connections: u64,
    pub hook_errors: u64,
    pub transport_errors: u64,
    pub responses_relayed: u64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

pub async fn start_admin_server(addr: SocketAddr, metrics: Arc<Metrics>) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        crate::error::ProxyError::Network(format!("Failed to bind admin port {}: {}", addr, e))
    })?;
    serve_admin(listener, metrics).await
}

/// Serve the admin API on an already bound listener.
pub async fn serve_admin(listener: TcpListener, metrics: Arc<Metrics>) -> Result<()> {
    let app = router(metrics);
    info!("Starting Admin API on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::ProxyError::Network(format!("Admin server failed: {}", e)))?;

    Ok(())
}

fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(move || metrics_handler(metrics)))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(metrics: Arc<Metrics>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}
