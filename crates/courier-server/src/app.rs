//! HTTP surface of the worker process.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use courier_config::AppConfig;
use courier_jobs::{Lifecycle, LifecycleState};
use courier_monitor::MonitorOptions;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::trace::TraceLayer;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub lifecycle: LifecycleState,
}

/// Builds the router: health probes, optional `/metrics`, optional monitor.
///
/// Mounting the monitor starts the worker pool.
pub async fn build_router(lifecycle: &Lifecycle, config: &AppConfig, metrics: Option<PrometheusHandle>) -> anyhow::Result<Router> {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(lifecycle.clone());

    if let Some(handle) = metrics {
        router = router.route("/metrics", get(move || async move { handle.render() }));
    }

    if config.monitor.enabled {
        router = courier_monitor::mount(
            router,
            &config.monitor.path,
            lifecycle,
            MonitorOptions::from(&config.monitor),
        )
        .await?;
    }

    Ok(router.layer(TraceLayer::new_for_http()))
}

async fn health_check(State(lifecycle): State<Lifecycle>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        lifecycle: lifecycle.state(),
    })
}

/// Ready while the pool is processing tasks.
async fn readiness_check(State(lifecycle): State<Lifecycle>) -> StatusCode {
    if lifecycle.state() == LifecycleState::Started {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use courier_jobs::MemoryBroker;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn lifecycle() -> Lifecycle {
        let mut config = AppConfig::default();
        config.worker.concurrency = 1;
        config.worker.handle_signals = false;
        Lifecycle::new(config, Arc::new(MemoryBroker::new()))
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health_and_ready_without_monitor() {
        let lifecycle = lifecycle();
        let mut config = AppConfig::default();
        config.monitor.enabled = false;

        let app = build_router(&lifecycle, &config, None).await.unwrap();

        let (status, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["lifecycle"], "uninitialized");

        let (status, _) = get(&app, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = get(&app, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_monitor_mount_starts_pool() {
        let lifecycle = lifecycle();
        let config = AppConfig::default();

        let app = build_router(&lifecycle, &config, None).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Started);

        let (status, _) = get(&app, "/ready").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get(&app, "/monitor/pool").await;
        assert_eq!(status, StatusCode::OK);

        lifecycle.shutdown().await;
    }
}
