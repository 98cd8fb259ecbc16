//! Read-only HTTP surface.
//!
//! - `GET /network-interfaces`: latest interface snapshot as JSON
//! - `GET /metrics`: every live counter in Prometheus text format
//! - `GET /healthz`: liveness

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
};
use log::info;
use tokio::net::TcpListener;

use crate::probes::{Shutdown, interfaces::SnapshotBuffer};
use crate::telemetry::MetricRegistry;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

struct AppState {
    snapshots: Arc<SnapshotBuffer>,
    registry: Arc<MetricRegistry>,
}

async fn handle_network_interfaces(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        state.snapshots.read(),
    )
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.registry.render_prometheus(),
    )
}

async fn handle_healthz() -> &'static str {
    "ok"
}

fn build_router(snapshots: Arc<SnapshotBuffer>, registry: Arc<MetricRegistry>) -> Router {
    let state = Arc::new(AppState {
        snapshots,
        registry,
    });

    Router::new()
        .route("/network-interfaces", get(handle_network_interfaces))
        .route("/metrics", get(handle_metrics))
        .route("/healthz", get(handle_healthz))
        .with_state(state)
}

pub struct HttpServer {
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    pub async fn bind(
        addr: &str,
        snapshots: Arc<SnapshotBuffer>,
        registry: Arc<MetricRegistry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
        info!("HTTP server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            router: build_router(snapshots, registry),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until shutdown; in-flight requests are allowed to finish.
    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.requested().await })
            .await
            .context("HTTP server failed")?;
        info!("HTTP server stopped");
        Ok(())
    }
}
