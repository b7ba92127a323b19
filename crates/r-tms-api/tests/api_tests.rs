//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Admin API routes against a running monitor."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use r_tms_api::{router, ApiState};
use r_tms_common::AppConfig;
use r_tms_core::{MonitorHandle, MonitorService};
use r_tms_ingest::RecordingNotifier;
use r_tms_msg::{InMemoryBroker, ProtocolVersion};
use r_tms_persistence::{AnomalyKind, AnomalyRecord, InMemoryStore, TelemetryStore};
use serde_json::{json, Value};
use tower::ServiceExt;

struct Harness {
    config: AppConfig,
    broker: InMemoryBroker,
    store: Arc<InMemoryStore>,
    handle: MonitorHandle,
    app: Router,
}

async fn harness() -> Harness {
    let config = AppConfig::default();
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryStore::new());
    let handle = MonitorService::new(config.clone(), store.clone(), Arc::new(broker.clone()))
        .with_notifier(Arc::new(RecordingNotifier::new()))
        .start()
        .await
        .unwrap();
    let app = router(Arc::new(ApiState::new(handle.context())));
    Harness {
        config,
        broker,
        store,
        handle,
        app,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::get(uri).body(Body::empty()).unwrap();
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_and_devices_reflect_the_running_service() {
    let h = harness().await;

    let (status, health) = get_json(&h.app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["ok"], true);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connected"], true);
    assert!(health["time"].as_f64().unwrap() > 0.0);

    let (status, devices) = get_json(&h.app, "/api/devices").await;
    assert_eq!(status, StatusCode::OK);
    let devices = devices.as_array().unwrap();
    assert_eq!(devices.len(), 3);
    assert_eq!(devices[0]["device_id"], "dev001");
    assert_eq!(devices[0]["location"], "Library");
    assert_eq!(devices[0]["connectivity"], "UNKNOWN");
    assert_eq!(devices[0]["active_alert"], "NONE");

    h.handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn schedules_are_validated_and_listed() {
    let h = harness().await;

    let (status, body) = post_json(&h.app, "/api/schedule", json!({"device_id": "dev001"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing device_id or action");

    let (status, body) = post_json(
        &h.app,
        "/api/schedule",
        json!({"device_id": "dev003", "action": "pause", "start_in": 600, "duration": 30}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "success");
    assert_eq!(body["schedule"]["device_id"], "dev003");

    let (status, body) = post_json(
        &h.app,
        "/api/schedule",
        json!({"device_id": "dev001", "action": "pause", "start_in": 1e16}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "start_in or duration out of range");

    let (status, list) = get_json(&h.app, "/api/schedule").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(h.store.schedules().unwrap()[0].action, "pause");

    h.handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_commands_reach_the_device_topic() {
    let h = harness().await;

    let (status, _) = post_json(&h.app, "/api/control", json!({"action": "pause"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post_json(
        &h.app,
        "/api/control",
        json!({"device_id": "dev002", "action": "reconfig", "version": 3, "qos": 1}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let sent = h.broker.history(&h.config.topics.control_for("dev002"));
    assert_eq!(sent.len(), 1);
    let payload: Value = serde_json::from_slice(&sent[0].payload).unwrap();
    assert_eq!(payload["device_id"], "dev002");
    assert_eq!(payload["action"], "reconfig");
    assert_eq!(payload["version"], 3);
    assert_eq!(payload["qos"], 1);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broker_settings_rebuild_the_session() {
    let h = harness().await;

    let (status, _) = post_json(&h.app, "/api/mqttconfig", json!({"qos": 1})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) =
        post_json(&h.app, "/api/mqttconfig", json!({"version": 3, "qos": 1})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["version"], 3);
    assert_eq!(
        h.broker.session_protocol(&h.config.broker.client_id),
        Some(ProtocolVersion::V311)
    );

    h.broker.set_reachable(false);
    let (status, body) =
        post_json(&h.app, "/api/mqttconfig", json!({"version": 5, "qos": 0})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    let (protocol, _) = h.handle.link().settings().await;
    assert_eq!(protocol, ProtocolVersion::V5);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn anomaly_reports_in_json_and_csv() {
    let h = harness().await;
    h.store
        .append_anomaly(AnomalyRecord::new("dev001", AnomalyKind::Wild, "value 75 held"))
        .unwrap();
    h.store
        .append_anomaly(AnomalyRecord::new("dev002", AnomalyKind::NoData, "silent"))
        .unwrap();

    let (status, rows) = get_json(&h.app, "/api/anomalies?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rows.as_array().unwrap().len(), 1);

    let request = Request::get("/api/anomalies.csv").body(Body::empty()).unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/csv");
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_owned();
    assert!(disposition.starts_with("attachment; filename=anomalies-"));
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "device_id,timestamp,anomaly_type,message");
    assert_eq!(lines.len(), 3);
    assert!(text.contains(",NO_DATA,silent"));

    let (status, stats) = get_json(&h.app, "/api/stats?device_id=dev001").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["count"], 0);

    h.handle.shutdown().await.unwrap();
}
