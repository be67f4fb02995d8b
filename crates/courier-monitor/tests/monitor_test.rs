//! Integration tests for the monitor endpoints.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use courier_config::AppConfig;
use courier_jobs::{EnqueueOptions, Lifecycle, LifecycleState, MemoryBroker, Task, TaskInfo};
use courier_monitor::{mount, MonitorOptions};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Queue the pool does not process, so tasks stay where the test puts them.
const PARKED: &str = "parked";

fn lifecycle() -> Lifecycle {
    let mut config = AppConfig::default();
    config.worker.concurrency = 1;
    config.worker.poll_interval_ms = 10;
    config.worker.handle_signals = false;
    Lifecycle::new(config, Arc::new(MemoryBroker::new()))
}

async fn app(lifecycle: &Lifecycle, readonly: bool) -> Router {
    mount(Router::new(), "/monitor", lifecycle, MonitorOptions { readonly })
        .await
        .expect("Failed to mount monitor")
}

async fn park(lifecycle: &Lifecycle) -> TaskInfo {
    lifecycle
        .client()
        .enqueue(
            Task::new("report:build", "{}"),
            EnqueueOptions::new()
                .queue(PARKED)
                .process_in(Duration::from_secs(3600)),
        )
        .await
        .expect("Failed to enqueue")
}

async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_mount_starts_pool() {
    let lifecycle = lifecycle();
    assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);

    let app = app(&lifecycle, false).await;
    assert_eq!(lifecycle.state(), LifecycleState::Started);

    let (status, body) = send(&app, Method::GET, "/monitor/pool").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "started");
    assert_eq!(body["concurrency"], 1);

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn test_dashboard_and_queues() {
    let lifecycle = lifecycle();
    let app = app(&lifecycle, false).await;
    park(&lifecycle).await;

    let (status, body) = send(&app, Method::GET, "/monitor").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["broker"]["total_scheduled"], 1);

    let (status, body) = send(&app, Method::GET, "/monitor/queues").await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["queues"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|q| q["queue"].as_str())
        .collect();
    assert!(names.contains(&PARKED));
    assert!(names.contains(&"critical"));

    let (status, body) = send(&app, Method::GET, "/monitor/queues/parked").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scheduled"], 1);

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn test_list_tasks_by_state() {
    let lifecycle = lifecycle();
    let app = app(&lifecycle, false).await;
    let info = park(&lifecycle).await;

    let (status, body) = send(&app, Method::GET, "/monitor/queues/parked/tasks?state=scheduled&limit=10").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["tasks"][0]["id"], info.id.as_str());

    let (status, body) = send(&app, Method::GET, "/monitor/queues/parked/tasks").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "pending");
    assert_eq!(body["tasks"].as_array().unwrap().len(), 0);

    let (status, body) = send(&app, Method::GET, "/monitor/queues/parked/tasks?state=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn test_get_task_and_not_found() {
    let lifecycle = lifecycle();
    let app = app(&lifecycle, false).await;
    let info = park(&lifecycle).await;

    let uri = format!("/monitor/queues/parked/tasks/{}", info.id);
    let (status, body) = send(&app, Method::GET, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "report:build");
    assert_eq!(body["state"], "scheduled");

    let (status, body) = send(&app, Method::GET, "/monitor/queues/parked/tasks/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn test_run_and_delete_task() {
    let lifecycle = lifecycle();
    let app = app(&lifecycle, false).await;
    let info = park(&lifecycle).await;

    let uri = format!("/monitor/queues/parked/tasks/{}/run", info.id);
    let (status, body) = send(&app, Method::POST, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "pending");

    let uri = format!("/monitor/queues/parked/tasks/{}", info.id);
    let (status, _) = send(&app, Method::DELETE, &uri).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, Method::GET, &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn test_readonly_forbids_mutation() {
    let lifecycle = lifecycle();
    let app = app(&lifecycle, true).await;
    let info = park(&lifecycle).await;

    let uri = format!("/monitor/queues/parked/tasks/{}", info.id);
    let (status, body) = send(&app, Method::DELETE, &uri).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "READ_ONLY");

    let (status, body) = send(&app, Method::POST, &format!("{uri}/run")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "READ_ONLY");

    // Reads still work and nothing changed.
    let (status, body) = send(&app, Method::GET, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "scheduled");

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn test_mount_at_root() {
    let lifecycle = lifecycle();
    let app = mount(Router::new(), "/", &lifecycle, MonitorOptions::default())
        .await
        .unwrap();

    let (status, _) = send(&app, Method::GET, "/queues").await;
    assert_eq!(status, StatusCode::OK);

    lifecycle.shutdown().await;
}

#[tokio::test]
async fn test_broker_unavailable_after_shutdown() {
    let lifecycle = lifecycle();
    let app = app(&lifecycle, false).await;
    lifecycle.shutdown().await;

    let (status, body) = send(&app, Method::GET, "/monitor/queues").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "BROKER_UNAVAILABLE");
}
