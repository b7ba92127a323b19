//! ---
//! ems_section: "04-telemetry-ingestion"
//! ems_subsection: "tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "End-to-end ingestion scenarios."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_tms_common::{AppConfig, ValidationConfig};
use r_tms_ingest::{
    EntryKind, EventKind, IngestPipeline, MessageValidator, NotificationKind, RecordingNotifier,
    SequenceReconstructor, DeviceRegistry, TimelineUpdate,
};
use r_tms_msg::{ConnectivityStatus, InboundMessage, QosLevel, StatusPayload};
use r_tms_persistence::{AnomalyKind, InMemoryStore, RecordFilter, TelemetryStore};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn reading(device: &str, seq: u64, ts: f64, value: f64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "packet_id": format!("{device}-{seq}"),
        "timestamp": ts,
        "device_id": device,
        "location": "Library",
        "sensor_data": {"value": value, "units": "celsius", "reading_type": "temperature"}
    }))
    .unwrap()
}

fn data(config: &AppConfig, payload: Vec<u8>) -> InboundMessage {
    InboundMessage {
        topic: config.topics.data.clone(),
        payload,
        qos: QosLevel::AtLeastOnce,
        retained: false,
    }
}

fn status(config: &AppConfig, device: &str, value: ConnectivityStatus) -> InboundMessage {
    InboundMessage {
        topic: config.topics.status_for(device),
        payload: StatusPayload::new(device, "Library", value).to_bytes().unwrap(),
        qos: QosLevel::AtLeastOnce,
        retained: true,
    }
}

const SERIES: [(u64, f64, f64); 4] = [
    (1, 1_700_000_000.0, 22.1),
    (2, 1_700_000_002.0, 23.0),
    (3, 1_700_000_004.0, 999.9),
    (4, 1_700_000_006.0, 23.4),
];

#[test]
fn wild_reading_is_bridged_between_valid_neighbours() {
    let validator = MessageValidator::new(ValidationConfig::default());
    let registry = Arc::new(DeviceRegistry::new());
    let mut reconstructor = SequenceReconstructor::new(Duration::from_millis(1200), registry);

    let outcomes: Vec<_> = SERIES
        .iter()
        .map(|(seq, ts, value)| {
            let event = validator.classify(&reading("d1", *seq, *ts, *value));
            reconstructor.ingest("d1", &event)
        })
        .collect();

    let kinds: Vec<_> = outcomes.iter().map(|o| o.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Valid, EventKind::Valid, EventKind::Wild, EventKind::Valid]
    );
    assert!(outcomes[2].bridge_opened);
    let bridge = outcomes[3].bridge_completed.as_ref().expect("bridge completed");
    assert_eq!(bridge.from.map(|p| p.value), Some(23.0));
    assert_eq!(bridge.to.value, 23.4);
    assert!(outcomes.iter().all(|o| o.gap.is_none()));
}

#[tokio::test]
async fn pipeline_persists_valid_readings_and_one_wild_anomaly() {
    let config = AppConfig::default();
    let store = Arc::new(InMemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let pipeline = IngestPipeline::new(&config, store.clone(), notifier.clone(), None);
    let mut timeline = pipeline.subscribe_timeline();

    let (tx, rx) = mpsc::channel(64);
    let handle = pipeline.spawn(rx, CancellationToken::new());

    tx.send(status(&config, "d1", ConnectivityStatus::Online)).await.unwrap();
    for (seq, ts, value) in SERIES {
        tx.send(data(&config, reading("d1", seq, ts, value))).await.unwrap();
    }
    tx.send(data(&config, b"{broken".to_vec())).await.unwrap();
    drop(tx);

    let report = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("pipeline stops when input closes");
    assert!(report.is_clean());

    let messages = store.messages(&RecordFilter::device("d1")).unwrap();
    let mut values: Vec<f64> = messages.iter().map(|m| m.value).collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(values, vec![22.1, 23.0, 23.4]);

    let anomalies = store.anomalies(&RecordFilter::device("d1")).unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::Wild);
    assert!(anomalies[0].message.contains("EXTREME"));
    assert_eq!(notifier.count("d1", NotificationKind::ExtremeWild), 1);

    let unknown = store.anomalies(&RecordFilter::device("unknown")).unwrap();
    assert_eq!(unknown.len(), 1);
    assert_eq!(unknown[0].kind, AnomalyKind::Corrupt);

    assert_eq!(store.service_logs(100).unwrap().len(), 5);
    assert_eq!(store.latest_statuses().unwrap()[0].status, "ONLINE");

    let mut points = Vec::new();
    let mut bridges = 0;
    while let Ok(update) = timeline.try_recv() {
        match update {
            TimelineUpdate::Point(point) => points.push(point),
            TimelineUpdate::Bridge(_) => bridges += 1,
            TimelineUpdate::Liveness(_) => {}
        }
    }
    assert_eq!(bridges, 1);
    assert_eq!(points.len(), 4);
    assert_eq!(points[2].kind, EntryKind::WildBridge);
    assert!(points
        .windows(2)
        .all(|pair| pair[0].source_timestamp <= pair[1].source_timestamp));

    let registry = pipeline.registry();
    let device = registry.get("d1").expect("tracked");
    assert_eq!(device.lock().last_value, Some(23.4));
}

#[tokio::test]
async fn sequence_gap_is_reported_once() {
    let config = AppConfig::default();
    let store = Arc::new(InMemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let pipeline = IngestPipeline::new(&config, store.clone(), notifier.clone(), None);

    let (tx, rx) = mpsc::channel(16);
    let handle = pipeline.spawn(rx, CancellationToken::new());
    for (seq, ts) in [(1, 10.0), (2, 12.0), (5, 18.0)] {
        tx.send(data(&config, reading("d2", seq, ts, 21.0))).await.unwrap();
    }
    drop(tx);
    handle.join().await;

    let gaps: Vec<_> = store
        .anomalies(&RecordFilter::device("d2"))
        .unwrap()
        .into_iter()
        .filter(|a| a.kind == AnomalyKind::SequenceGap)
        .collect();
    assert_eq!(gaps.len(), 1);
    assert!(gaps[0].message.contains("from 2 to 5"));
    assert_eq!(notifier.count("d2", AnomalyKind::SequenceGap.into()), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_device_raises_no_data_from_the_watchdog_loop() {
    let config = AppConfig::default();
    let store = Arc::new(InMemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let pipeline = IngestPipeline::new(&config, store.clone(), notifier.clone(), None);
    let mut timeline = pipeline.subscribe_timeline();

    let token = CancellationToken::new();
    let (tx, rx) = mpsc::channel(16);
    let handle = pipeline.spawn(rx, token.clone());
    tx.send(status(&config, "d3", ConnectivityStatus::Online)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(8)).await;
    token.cancel();
    handle.join().await;

    let no_data = store
        .anomalies(&RecordFilter::device("d3"))
        .unwrap()
        .into_iter()
        .filter(|a| a.kind == AnomalyKind::NoData)
        .count();
    assert_eq!(no_data, 1);

    let mut saw_no_data = false;
    while let Ok(update) = timeline.try_recv() {
        if let TimelineUpdate::Liveness(r_tms_ingest::LivenessEvent::NoData { device_id, .. }) = update {
            assert_eq!(device_id, "d3");
            saw_no_data = true;
        }
    }
    assert!(saw_no_data);
}

#[tokio::test]
async fn readings_from_a_stopped_device_are_not_stored() {
    let config = AppConfig::default();
    let store = Arc::new(InMemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let pipeline = IngestPipeline::new(&config, store.clone(), notifier.clone(), None);

    let (tx, rx) = mpsc::channel(16);
    let handle = pipeline.spawn(rx, CancellationToken::new());
    tx.send(data(&config, reading("d4", 1, 10.0, 21.5))).await.unwrap();
    tx.send(status(&config, "d4", ConnectivityStatus::Stopped)).await.unwrap();
    tx.send(data(&config, reading("d4", 2, 12.0, 21.7))).await.unwrap();
    drop(tx);
    handle.join().await;

    let values: Vec<f64> = store
        .messages(&RecordFilter::device("d4"))
        .unwrap()
        .iter()
        .map(|m| m.value)
        .collect();
    assert_eq!(values, vec![21.5]);
}

#[tokio::test]
async fn restarted_sender_still_reports_gaps() {
    let config = AppConfig::default();
    let store = Arc::new(InMemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let pipeline = IngestPipeline::new(&config, store.clone(), notifier.clone(), None);

    let (tx, rx) = mpsc::channel(64);
    let handle = pipeline.spawn(rx, CancellationToken::new());
    for seq in 1..=20u64 {
        tx.send(data(&config, reading("d5", seq, seq as f64 * 2.0, 21.0))).await.unwrap();
    }
    tx.send(status(&config, "d5", ConnectivityStatus::Online)).await.unwrap();
    for (i, seq) in [1u64, 2, 5].into_iter().enumerate() {
        tx.send(data(&config, reading("d5", seq, 100.0 + i as f64 * 2.0, 21.0))).await.unwrap();
    }
    drop(tx);
    handle.join().await;

    let gaps: Vec<_> = store
        .anomalies(&RecordFilter::device("d5"))
        .unwrap()
        .into_iter()
        .filter(|a| a.kind == AnomalyKind::SequenceGap)
        .collect();
    assert_eq!(gaps.len(), 1);
    assert!(gaps[0].message.contains("from 2 to 5"));
}
