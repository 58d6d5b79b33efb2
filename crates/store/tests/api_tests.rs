//! Integration tests for the store API endpoints

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use k8s_openapi::api::core::v1::Event;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use store_lib::{
    cluster::{ClusterClient, ClusterObject},
    health::{components, ComponentStatus, HealthRegistry},
    AppRuntimeStore, Listers, LoggingApplier, MemoryPersistence, ObjectKind, Result,
    StoreConfig, StoreDeps, StoreMetrics,
};
use tower::ServiceExt;

struct NoopCluster;

#[async_trait]
impl ClusterClient for NoopCluster {
    async fn delete(&self, _: ObjectKind, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _: ObjectKind, _: &str, _: &str) -> Result<Option<ClusterObject>> {
        Ok(None)
    }

    async fn list_pod_events(&self, _: &str, _: &str) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub store: Arc<AppRuntimeStore>,
    pub metrics: StoreMetrics,
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .health_registry
        .set_pending_kinds(state.store.pending_kinds())
        .await;
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .metrics
        .set_cached_services(state.store.get_all_app_services().len());
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

fn create_test_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::WATCHERS).await;
    health_registry.register(components::STORE).await;
    health_registry.register(components::PERSISTENCE).await;

    let (store, _receivers) = AppRuntimeStore::new(
        StoreDeps {
            persistence: Arc::new(MemoryPersistence::new()),
            cluster: Arc::new(NoopCluster),
            applier: Arc::new(LoggingApplier),
            listers: Arc::new(Listers::new()),
        },
        StoreConfig::default(),
    );

    let state = Arc::new(AppState {
        health_registry,
        store,
        metrics: StoreMetrics::new(),
    });
    let router = create_test_router(state.clone());

    (router, state)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["watchers"].is_object());
    assert!(health["components"]["persistence"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::PERSISTENCE, "Declared state reload failed")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::STORE, "Failed to start store")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_until_watches_sync() {
    let (app, _state) = setup_test_app().await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
    let pending = readiness["pending_kinds"].as_array().unwrap();
    assert_eq!(pending.len(), ObjectKind::ALL.len());
    assert!(pending.contains(&serde_json::json!("Pod")));
}

#[tokio::test]
async fn test_readyz_returns_ok_once_synced() {
    let (app, state) = setup_test_app().await;

    state.store.listers().mark_all_synced();

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
    assert!(readiness.get("pending_kinds").is_none());
}

#[tokio::test]
async fn test_readyz_returns_503_when_synced_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.store.listers().mark_all_synced();
    state
        .health_registry
        .set_unhealthy(components::WATCHERS, "Watch stream ended")
        .await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "Critical component unhealthy");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    // Record a status query
    state.store.get_service_status("svc-A").await.unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("app_runtime_store_cached_services"));
    assert!(metrics_text.contains("app_runtime_store_status_latency_seconds_bucket"));
    assert!(metrics_text.contains("app_runtime_store_status_latency_seconds_count"));
}
