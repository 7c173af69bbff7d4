//! Run status and self-metrics over HTTP
//!
//! - `GET /healthz`: full run status, 503 once a measurement failed
//! - `GET /readyz`: 503 until every measurement was asked to start
//! - `GET /metrics`: harness metrics in the Prometheus text format

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use harness_lib::{HarnessMetrics, StatusRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub status: StatusRegistry,
    pub metrics: HarnessMetrics,
}

impl AppState {
    pub fn new(status: StatusRegistry, metrics: HarnessMetrics) -> Self {
        Self { status, metrics }
    }
}

fn available(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn run_status(State(state): State<Arc<AppState>>) -> Response {
    let status = state.status.status().await;
    (available(status.healthy), Json(status)).into_response()
}

async fn readiness(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.status.readiness().await;
    (available(readiness.ready), Json(readiness)).into_response()
}

async fn self_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, state.metrics.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Encoding harness metrics failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(run_status))
        .route("/readyz", get(readiness))
        .route("/metrics", get(self_metrics))
        .with_state(state)
}

/// Serve the API until the task is aborted
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Status API listening");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
