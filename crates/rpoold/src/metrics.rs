//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  — Prometheus text format
//!   GET /healthz  — Liveness probe (always 200 if process is running)
//!   GET /readyz   — Readiness probe (200 if the first remote is reachable)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use rpool_engine::PoolEngine;
use std::sync::Arc;

struct Gauges {
    uploads: Gauge,
    downloads: Gauge,
    bytes_uploaded: Gauge,
    bytes_downloaded: Gauge,
    chunk_cache_bytes: Gauge,
    chunk_cache_hits: Gauge,
    chunk_cache_misses: Gauge,
}

pub struct MetricsState {
    engine: Arc<PoolEngine>,
    registry: Registry,
    gauges: Gauges,
}

impl MetricsState {
    pub fn new(engine: Arc<PoolEngine>) -> Self {
        let mut registry = Registry::default();
        let gauges = Gauges {
            uploads: Gauge::default(),
            downloads: Gauge::default(),
            bytes_uploaded: Gauge::default(),
            bytes_downloaded: Gauge::default(),
            chunk_cache_bytes: Gauge::default(),
            chunk_cache_hits: Gauge::default(),
            chunk_cache_misses: Gauge::default(),
        };
        registry.register("rpool_uploads", "Completed uploads", gauges.uploads.clone());
        registry.register(
            "rpool_downloads",
            "Completed downloads",
            gauges.downloads.clone(),
        );
        registry.register(
            "rpool_bytes_uploaded",
            "Bytes written to remotes",
            gauges.bytes_uploaded.clone(),
        );
        registry.register(
            "rpool_bytes_downloaded",
            "Bytes read from remotes",
            gauges.bytes_downloaded.clone(),
        );
        registry.register(
            "rpool_chunk_cache_bytes",
            "Bytes resident in the chunk cache",
            gauges.chunk_cache_bytes.clone(),
        );
        registry.register(
            "rpool_chunk_cache_hits",
            "Chunk cache hits",
            gauges.chunk_cache_hits.clone(),
        );
        registry.register(
            "rpool_chunk_cache_misses",
            "Chunk cache misses",
            gauges.chunk_cache_misses.clone(),
        );
        MetricsState {
            engine,
            registry,
            gauges,
        }
    }

    fn refresh(&self) {
        let counters = self.engine.counters().snapshot();
        self.gauges.uploads.set(counters.uploads as i64);
        self.gauges.downloads.set(counters.downloads as i64);
        self.gauges.bytes_uploaded.set(counters.bytes_uploaded as i64);
        self.gauges
            .bytes_downloaded
            .set(counters.bytes_downloaded as i64);
        let cache = self.engine.chunk_cache().stats();
        self.gauges
            .chunk_cache_bytes
            .set(cache.current_size_bytes as i64);
        self.gauges.chunk_cache_hits.set(cache.hits as i64);
        self.gauges.chunk_cache_misses.set(cache.misses as i64);
    }
}

/// Serve metrics and health endpoints on `addr` (e.g. "127.0.0.1:9100").
pub async fn serve(addr: String, state: Arc<MetricsState>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    state.refresh();
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: 200 once at least the first remote answers.
async fn readyz_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    match state.engine.config().remotes.first() {
        Some(remote) => {
            if rpool_storage::is_healthy(state.engine.client().as_ref(), remote).await {
                (StatusCode::OK, "ready")
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, "remote unreachable")
            }
        }
        None => (StatusCode::SERVICE_UNAVAILABLE, "no remotes configured"),
    }
}
