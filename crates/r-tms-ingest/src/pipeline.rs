//! ---
//! ems_section: "04-telemetry-ingestion"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry validation, reconstruction and liveness tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Router and partition workers.
//!
//! The router classifies each inbound message and hands it to the worker
//! that owns its device, so everything for one device is handled in arrival
//! order by a single task. A separate task drives the liveness watchdog.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use r_tms_common::{AppConfig, TopicConfig};
use r_tms_metrics::IngestMetrics;
use r_tms_msg::{ConnectivityStatus, InboundMessage, QosLevel, StatusPayload};
use r_tms_persistence::{
    AnomalyKind, AnomalyRecord, MessageRecord, ServiceLogRecord, StatusRecord, TelemetryStore,
};
use r_tms_rt::{RateLimiter, TaskGroup, TaskReport};

use crate::anomaly::{AnomalyRegistry, Notifier};
use crate::frame::ClassifiedEvent;
use crate::reconstructor::{BridgeSegment, SequenceReconstructor, TimelinePoint};
use crate::registry::DeviceRegistry;
use crate::validator::MessageValidator;
use crate::watchdog::{LivenessEvent, LivenessWatchdog};

const WORKER_QUEUE_DEPTH: usize = 256;
const TIMELINE_CAPACITY: usize = 1024;

/// Output published for timeline consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TimelineUpdate {
    Point(TimelinePoint),
    Bridge(BridgeSegment),
    Liveness(LivenessEvent),
}

#[derive(Debug)]
enum WorkItem {
    Data {
        event: ClassifiedEvent,
        topic: String,
        qos: QosLevel,
    },
    Status {
        payload: StatusPayload,
        received: Instant,
    },
}

impl WorkItem {
    fn device_id(&self) -> Option<&str> {
        match self {
            WorkItem::Data { event, .. } => event.device_id(),
            WorkItem::Status { payload, .. } => Some(payload.device_id.as_str()),
        }
    }
}

/// Monotonic clock reading that follows tokio's paused test clock.
fn monotonic_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn partition(device_id: Option<&str>, workers: usize) -> usize {
    let Some(device_id) = device_id else {
        return 0;
    };
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

struct Shared {
    validator: MessageValidator,
    registry: Arc<DeviceRegistry>,
    anomalies: Arc<AnomalyRegistry>,
    watchdog: Arc<LivenessWatchdog>,
    store: Arc<dyn TelemetryStore>,
    metrics: Option<IngestMetrics>,
    topics: TopicConfig,
    timeline: broadcast::Sender<TimelineUpdate>,
}

impl Shared {
    fn prepare(&self, message: InboundMessage) -> Option<WorkItem> {
        if self.topics.is_status(&message.topic) {
            if message.payload.is_empty() {
                return None;
            }
            return match serde_json::from_slice::<StatusPayload>(&message.payload) {
                Ok(payload) => Some(WorkItem::Status {
                    payload,
                    received: monotonic_now(),
                }),
                Err(err) => {
                    warn!(topic = %message.topic, error = %err, "unreadable status payload");
                    None
                }
            };
        }
        if self.topics.is_data(&message.topic) {
            let event =
                self.validator
                    .classify_at(&message.payload, Utc::now(), monotonic_now());
            return Some(WorkItem::Data {
                event,
                topic: message.topic,
                qos: message.qos,
            });
        }
        debug!(topic = %message.topic, "ignoring message on unrelated topic");
        None
    }

    fn handle(&self, reconstructor: &mut SequenceReconstructor, item: WorkItem) {
        match item {
            WorkItem::Data { event, topic, qos } => {
                self.handle_data(reconstructor, event, &topic, qos)
            }
            WorkItem::Status { payload, received } => {
                if payload.status() == ConnectivityStatus::Online {
                    reconstructor.reset_sequence(&payload.device_id);
                }
                self.handle_status(payload, received)
            }
        }
    }

    fn handle_data(
        &self,
        reconstructor: &mut SequenceReconstructor,
        event: ClassifiedEvent,
        topic: &str,
        qos: QosLevel,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.record_classified(event.kind.as_str());
        }
        self.validator.report(&event, &self.anomalies);

        if let Some(device_id) = event.device_id() {
            let outcome = reconstructor.ingest(device_id, &event);
            if let Some(gap) = &outcome.gap {
                let message = format!(
                    "sequence jumped from {} to {} ({} missing)",
                    gap.previous,
                    gap.current,
                    gap.missing()
                );
                self.anomalies.report_at(
                    AnomalyRecord::new(device_id, AnomalyKind::SequenceGap, message),
                    event.receipt_monotonic_time,
                );
            }
            if let Some(bridge) = outcome.bridge_completed {
                let _ = self.timeline.send(TimelineUpdate::Bridge(bridge));
            }
            self.publish_points(outcome.flushed);

            if event.is_valid() && !outcome.late && !outcome.stopped {
                self.persist_reading(&event, device_id, topic, qos);
            }
        }

        let log = ServiceLogRecord {
            timestamp: event.receipt_wall_time,
            device_id: event.frame.device_id.clone(),
            topic: topic.to_owned(),
            qos: qos.as_number(),
            schema_ok: event.schema_ok(),
            log_message: format!("{} {}", event.kind, event.describe()),
            anomaly_type: event.kind.anomaly(),
        };
        if let Err(err) = self.store.append_service_log(log) {
            warn!(error = %err, "failed to store service log row");
        }
    }

    fn persist_reading(&self, event: &ClassifiedEvent, device_id: &str, topic: &str, qos: QosLevel) {
        let Some(value) = event.frame.sensor_value else {
            return;
        };
        let record = MessageRecord {
            id: 0,
            received_at: event.receipt_wall_time,
            source_timestamp: event.frame.source_timestamp,
            device_id: device_id.to_owned(),
            location: event.frame.location.clone(),
            value,
            sequence: event.frame.sequence_id,
            topic: topic.to_owned(),
            qos: qos.as_number(),
            raw: event.frame.raw_text(),
        };
        if let Err(err) = self.store.append_message(record) {
            warn!(device = device_id, error = %err, "failed to store reading");
        }
    }

    fn handle_status(&self, payload: StatusPayload, received: Instant) {
        let status = payload.status();
        let event = self.watchdog.on_status(
            &payload.device_id,
            payload.location.as_deref(),
            status,
            received,
        );
        let record = StatusRecord {
            timestamp: Utc::now(),
            device_id: payload.device_id,
            location: payload.location,
            status: payload.status,
        };
        if let Err(err) = self.store.append_status(record) {
            warn!(error = %err, "failed to store status snapshot");
        }
        if let Some(event) = event {
            let _ = self.timeline.send(TimelineUpdate::Liveness(event));
        }
    }

    fn publish_points(&self, points: Vec<TimelinePoint>) {
        for point in points {
            if let Some(metrics) = &self.metrics {
                metrics.record_timeline_point(point.kind.as_str());
            }
            let _ = self.timeline.send(TimelineUpdate::Point(point));
        }
    }
}

/// Wiring for validator, reconstruction workers and the watchdog.
pub struct IngestPipeline {
    shared: Arc<Shared>,
    workers: usize,
    window: Duration,
    watchdog_tick: Duration,
}

impl IngestPipeline {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn TelemetryStore>,
        notifier: Arc<dyn Notifier>,
        metrics: Option<IngestMetrics>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let mut anomalies = AnomalyRegistry::new(store.clone(), notifier, config.notifier.cooldown);
        if let Some(metrics) = &metrics {
            anomalies = anomalies.with_metrics(metrics.clone());
        }
        let anomalies = Arc::new(anomalies);
        let watchdog = Arc::new(LivenessWatchdog::new(
            registry.clone(),
            anomalies.clone(),
            config.timing.liveness_threshold(),
        ));
        let (timeline, _) = broadcast::channel(TIMELINE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                validator: MessageValidator::new(config.validation.clone()),
                registry,
                anomalies,
                watchdog,
                store,
                metrics,
                topics: config.topics.clone(),
                timeline,
            }),
            workers: config.timing.pipeline_workers.max(1),
            window: config.timing.reorder_window(),
            watchdog_tick: config.timing.watchdog_tick,
        }
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.shared.registry.clone()
    }

    pub fn anomalies(&self) -> Arc<AnomalyRegistry> {
        self.shared.anomalies.clone()
    }

    pub fn watchdog(&self) -> Arc<LivenessWatchdog> {
        self.shared.watchdog.clone()
    }

    pub fn subscribe_timeline(&self) -> broadcast::Receiver<TimelineUpdate> {
        self.shared.timeline.subscribe()
    }

    /// Topic filters the monitor needs on its link.
    pub fn subscriptions(&self) -> Vec<String> {
        let topics = &self.shared.topics;
        vec![
            topics.data.clone(),
            topics.status.clone(),
            format!("{}/+", topics.status.trim_end_matches('/')),
        ]
    }

    /// Start the router, the partition workers and the watchdog loop.
    ///
    /// Workers drain their reorder buffers once the router stops, which
    /// happens when `inbound` closes or `token` is cancelled. The watchdog
    /// stops with the router.
    pub fn spawn(
        &self,
        inbound: mpsc::Receiver<InboundMessage>,
        token: CancellationToken,
    ) -> PipelineHandle {
        let mut group = TaskGroup::with_token(token.clone());
        let mut senders = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            senders.push(tx);
            let reconstructor =
                SequenceReconstructor::new(self.window, self.shared.registry.clone());
            group.spawn(
                format!("ingest-worker-{index}"),
                run_worker(index, self.shared.clone(), reconstructor, rx),
            );
        }
        let stopped = token.child_token();
        group.spawn(
            "ingest-router",
            run_router(self.shared.clone(), inbound, senders, token, stopped.clone()),
        );
        group.spawn(
            "liveness-watchdog",
            run_watchdog(self.shared.clone(), self.watchdog_tick, stopped),
        );
        info!(
            workers = self.workers,
            window_ms = self.window.as_millis() as u64,
            "ingest pipeline started"
        );
        PipelineHandle { group }
    }
}

impl std::fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("workers", &self.workers)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

/// Running pipeline tasks.
#[derive(Debug)]
pub struct PipelineHandle {
    group: TaskGroup,
}

impl PipelineHandle {
    /// Wait for the pipeline to stop on its own.
    pub async fn join(self) -> TaskReport {
        self.group.join().await
    }

    /// Cancel and wait, aborting tasks still busy after `grace`.
    pub async fn shutdown(self, grace: Duration) -> TaskReport {
        self.group.shutdown(grace).await
    }
}

async fn run_router(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    senders: Vec<mpsc::Sender<WorkItem>>,
    token: CancellationToken,
    stopped: CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let Some(item) = shared.prepare(message) else {
            continue;
        };
        let index = partition(item.device_id(), senders.len());
        if senders[index].send(item).await.is_err() {
            warn!(worker = index, "ingest worker stopped; dropping message");
        }
    }
    stopped.cancel();
    debug!("ingest router stopped");
    Ok(())
}

async fn run_worker(
    index: usize,
    shared: Arc<Shared>,
    mut reconstructor: SequenceReconstructor,
    mut rx: mpsc::Receiver<WorkItem>,
) -> Result<()> {
    while let Some(item) = rx.recv().await {
        shared.handle(&mut reconstructor, item);
    }
    let remaining = reconstructor.drain_all();
    debug!(worker = index, flushed = remaining.len(), "ingest worker drained");
    shared.publish_points(remaining);
    Ok(())
}

async fn run_watchdog(shared: Arc<Shared>, period: Duration, token: CancellationToken) -> Result<()> {
    let mut limiter = RateLimiter::new(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = limiter.tick() => {
                for event in shared.watchdog.tick(monotonic_now()) {
                    let _ = shared.timeline.send(TimelineUpdate::Liveness(event));
                }
                if let Some(metrics) = &shared.metrics {
                    metrics.set_device_count(shared.registry.len());
                }
            }
        }
    }
    debug!("liveness watchdog stopped");
    Ok(())
}
