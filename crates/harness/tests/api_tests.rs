//! Integration tests for the harness API endpoints

#[path = "../src/api.rs"]
#[allow(dead_code)]
mod api;

use api::{create_router, AppState};
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use harness_lib::{HarnessMetrics, MeasurementState, RunPhase, StatusRegistry};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let status = StatusRegistry::new();
    status.register("throughput").await;
    status.register("usage").await;

    let metrics = HarnessMetrics::new();
    let state = Arc::new(AppState::new(status, metrics));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let (status, _content_type, body) = get_with_type(app, uri).await;
    (status, body)
}

async fn get_with_type(app: Router, uri: &str) -> (StatusCode, String, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string())
        .unwrap_or_default();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["healthy"], true);
    assert_eq!(health["phase"], "initializing");
    assert_eq!(health["measurements"]["usage"]["state"], "pending");
}

#[tokio::test]
async fn test_healthz_returns_unavailable_after_failure() {
    let (app, state) = setup_test_app().await;

    state
        .status
        .set_measurement(
            "usage",
            MeasurementState::Failed("no usage source".to_string()),
        )
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["healthy"], false);
    assert_eq!(health["measurements"]["usage"]["state"], "failed");
    assert_eq!(health["measurements"]["usage"]["message"], "no usage source");
}

#[tokio::test]
async fn test_violation_keeps_service_healthy() {
    let (app, state) = setup_test_app().await;

    state
        .status
        .set_measurement(
            "throughput",
            MeasurementState::Violated("too slow".to_string()),
        )
        .await;

    let (status, _body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_readyz_follows_run_phase() {
    let (app, state) = setup_test_app().await;

    let (status, body) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);
    assert!(readiness["reason"].is_string());

    state.status.set_phase(RunPhase::Running).await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
    assert!(readiness.get("reason").is_none());
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_harness_metrics() {
    let (app, state) = setup_test_app().await;
    state.metrics.record_chaos_round(2, 1);

    let (status, content_type, body) = get_with_type(app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("text/plain"));

    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("load_harness_chaos_rounds_total"));
    assert!(text.contains("load_harness_nodes_killed_total"));
}
