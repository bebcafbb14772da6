//! Local control surface
//!
//! Loopback-only HTTP endpoints for operating the agent:
//! pause/unpause/restart/shutdown signals, on-demand log rotation,
//! liveness, and the Prometheus exposition.

use crate::logfile::RotatingLogSink;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Signals the supervisor loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Pause,
    Unpause,
    Restart,
    Shutdown,
}

#[derive(Clone)]
pub struct ControlState {
    pub control_tx: mpsc::Sender<ControlSignal>,
    pub log_sink: Arc<RotatingLogSink>,
    pub metrics: PrometheusHandle,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/metrics", get(metrics))
        .route("/control/pause", post(pause))
        .route("/control/unpause", post(unpause))
        .route("/control/restart", post(restart))
        .route("/control/shutdown", post(shutdown))
        .route("/control/logfile", post(logfile))
        .with_state(state)
}

/// Serve the control surface on 127.0.0.1 only.
pub async fn serve(port: u16, state: ControlState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control surface listening");
    axum::serve(listener, router(state))
        .await
        .map_err(std::io::Error::other)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<ControlState>) -> impl IntoResponse {
    state.metrics.render()
}

async fn signal(state: &ControlState, signal: ControlSignal) -> StatusCode {
    match state.control_tx.send(signal).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn pause(State(state): State<ControlState>) -> StatusCode {
    signal(&state, ControlSignal::Pause).await
}

async fn unpause(State(state): State<ControlState>) -> StatusCode {
    signal(&state, ControlSignal::Unpause).await
}

async fn restart(State(state): State<ControlState>) -> StatusCode {
    signal(&state, ControlSignal::Restart).await
}

async fn shutdown(State(state): State<ControlState>) -> StatusCode {
    signal(&state, ControlSignal::Shutdown).await
}

async fn logfile(State(state): State<ControlState>) -> impl IntoResponse {
    match state.log_sink.rotate() {
        Ok(old) => (StatusCode::OK, old),
        Err(err) => {
            error!(error = %err, "error rotating log file");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
