// src/server/metrics_server.rs

//! A small HTTP server exposing `/metrics` in Prometheus text format. Runs as
//! its own background task; has no access to `ReactorState`, since all the
//! gauges it serves are the global registrations in `core::metrics`.

use crate::core::metrics::gather_metrics;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use tracing::{error, info};

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

/// Binds and serves the metrics endpoint until the process exits. Spawned as
/// a detached task; a bind failure is logged and the task simply exits,
/// since a metrics outage should never take down the allocation daemon.
pub async fn run(port: u16) {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind metrics server");
            return;
        }
    };
    info!(%addr, "metrics server listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "metrics server exited unexpectedly");
    }
}
