//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Device publisher behaviour against the in-process broker."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_tms_common::AppConfig;
use r_tms_msg::{ConnectivityStatus, InMemoryBroker, ProtocolVersion, StatusPayload};
use r_tms_sim::{publisher_client_id, CycleOutcome, DevicePublisher, SkipReason};
use serde_json::json;

fn quiet_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.timing.publish_interval = Duration::from_secs(3600);
    config.publisher.miss_rate = 0.0;
    config.publisher.blackout.chance = 0.0;
    config
}

fn retained_status(broker: &InMemoryBroker, config: &AppConfig, device: &str) -> ConnectivityStatus {
    let payload = broker
        .retained(&config.topics.status_for(device))
        .expect("retained status");
    serde_json::from_slice::<StatusPayload>(&payload)
        .expect("status payload")
        .status()
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publishes_numbered_packets_while_running() {
    let config = quiet_config();
    let broker = InMemoryBroker::new();
    let publisher = DevicePublisher::new(&config, "dev001", Arc::new(broker.clone())).unwrap();

    assert_eq!(
        publisher.publish_cycle().await,
        CycleOutcome::Skipped(SkipReason::Stopped)
    );
    publisher.start().await;
    assert_eq!(
        publisher.publish_cycle().await,
        CycleOutcome::Skipped(SkipReason::NotConnected)
    );

    publisher.connect().await;
    assert_eq!(retained_status(&broker, &config, "dev001"), ConnectivityStatus::Online);
    for _ in 0..3 {
        assert!(matches!(publisher.publish_cycle().await, CycleOutcome::Published { .. }));
    }

    let history = broker.history(&config.topics.data);
    let ids: Vec<String> = history
        .iter()
        .map(|m| serde_json::from_slice::<serde_json::Value>(&m.payload).unwrap()["packet_id"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(ids, vec!["dev001-1", "dev001-2", "dev001-3"]);
    assert_eq!(publisher.published(), 3);

    publisher.stop().await;
    assert_eq!(retained_status(&broker, &config, "dev001"), ConnectivityStatus::Stopped);
    assert!(publisher.link().is_connected().await);

    let report = publisher.shutdown().await;
    assert!(report.is_clean());
    assert_eq!(retained_status(&broker, &config, "dev001"), ConnectivityStatus::Offline);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_topic_pauses_resumes_and_reconfigures() {
    let config = quiet_config();
    let broker = InMemoryBroker::new();
    let publisher = DevicePublisher::new(&config, "dev002", Arc::new(broker.clone())).unwrap();
    publisher.connect().await;
    publisher.start().await;

    let control = config.topics.control_for("dev002");
    broker.publish_raw(&control, json!({"device_id": "dev002", "action": "pause"}).to_string(), false);
    assert!(eventually(|| !publisher.is_running()).await);
    assert!(eventually(|| {
        broker
            .retained(&config.topics.status_for("dev002"))
            .map(|p| serde_json::from_slice::<StatusPayload>(&p).unwrap().status() == ConnectivityStatus::Stopped)
            .unwrap_or(false)
    })
    .await);

    broker.publish_raw(&control, json!({"device_id": "dev003", "action": "resume"}).to_string(), false);
    broker.publish_raw(&control, json!({"device_id": "dev002", "action": "resume"}).to_string(), false);
    assert!(eventually(|| publisher.is_running()).await);

    broker.publish_raw(
        &control,
        json!({"device_id": "dev002", "action": "reconfig", "version": 3, "qos": 0}).to_string(),
        false,
    );
    let client = publisher_client_id("dev002");
    assert!(eventually(|| broker.session_protocol(&client) == Some(ProtocolVersion::V311)).await);

    publisher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_shutdown_takes_the_device_offline() {
    let config = quiet_config();
    let broker = InMemoryBroker::new();
    let publisher = DevicePublisher::new(&config, "dev003", Arc::new(broker.clone())).unwrap();
    publisher.connect().await;
    publisher.start().await;

    broker.publish_raw(
        &config.topics.control_for("dev003"),
        json!({"device_id": "dev003", "action": "shutdown"}).to_string(),
        false,
    );
    assert!(eventually(|| !broker.is_connected(&publisher_client_id("dev003"))).await);
    assert!(!publisher.is_running());
    assert_eq!(retained_status(&broker, &config, "dev003"), ConnectivityStatus::Offline);

    publisher.go_online().await.unwrap();
    assert!(broker.is_connected(&publisher_client_id("dev003")));
    publisher.shutdown().await;
}

#[test]
fn unknown_devices_are_rejected() {
    let broker = InMemoryBroker::new();
    let err = DevicePublisher::new(&AppConfig::default(), "dev999", Arc::new(broker)).unwrap_err();
    assert!(err.to_string().contains("dev999"));
}
