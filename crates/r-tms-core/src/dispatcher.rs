//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Schedule firing and retention maintenance loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r_tms_common::config::{RetentionConfig, TopicConfig};
use r_tms_metrics::DispatcherMetrics;
use r_tms_msg::{ControlCommand, PublishOutcome, TransportLink};
use r_tms_persistence::{PurgeReport, ScheduleEntry, TelemetryStore};
use r_tms_rt::{CancellationToken, RateLimiter};
use tracing::{debug, info, warn};

/// Outbound path for control commands.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send_control(&self, topic: &str, payload: Vec<u8>) -> r_tms_msg::Result<PublishOutcome>;
}

#[async_trait]
impl ControlChannel for TransportLink {
    async fn send_control(&self, topic: &str, payload: Vec<u8>) -> r_tms_msg::Result<PublishOutcome> {
        self.publish(topic, payload, None).await
    }
}

/// What one dispatcher tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Schedule ids whose command was published.
    pub fired: Vec<u64>,
    /// Schedule ids that were due but could not be published.
    pub failed: Vec<u64>,
    /// Present when this tick ran a retention purge.
    pub purge: Option<PurgeReport>,
}

/// Fires windowed control actions and purges expired rows.
///
/// A fired schedule is pushed one debounce period (a year by default) into
/// the future, so each window fires once. A failed publish leaves the entry
/// untouched and it is retried on the next tick while the window is open.
pub struct ScheduleDispatcher {
    store: Arc<dyn TelemetryStore>,
    channel: Arc<dyn ControlChannel>,
    topics: TopicConfig,
    retention: RetentionConfig,
    debounce: chrono::Duration,
    horizon: chrono::Duration,
    last_purge: Option<Instant>,
    metrics: Option<DispatcherMetrics>,
}

impl ScheduleDispatcher {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        channel: Arc<dyn ControlChannel>,
        topics: TopicConfig,
        retention: RetentionConfig,
    ) -> Self {
        let debounce = chrono::Duration::from_std(retention.schedule_debounce)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let horizon = chrono::Duration::from_std(retention.horizon())
            .unwrap_or_else(|_| chrono::Duration::days(i64::from(retention.retention_days)));
        Self {
            store,
            channel,
            topics,
            retention,
            debounce,
            horizon,
            last_purge: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DispatcherMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fire due schedules, then purge when the purge interval has elapsed.
    pub async fn tick(&mut self, now: DateTime<Utc>, mono: Instant) -> TickReport {
        let mut report = TickReport::default();
        let schedules = match self.store.schedules() {
            Ok(schedules) => schedules,
            Err(err) => {
                warn!(error = %err, "failed to read schedules");
                Vec::new()
            }
        };
        for entry in schedules.iter().filter(|entry| entry.is_due(now)) {
            if self.fire(entry, now).await {
                report.fired.push(entry.id);
            } else {
                report.failed.push(entry.id);
            }
        }

        let purge_due = self
            .last_purge
            .map_or(true, |last| mono.duration_since(last) >= self.retention.purge_interval);
        if purge_due {
            self.last_purge = Some(mono);
            report.purge = self.purge(now);
        }
        report
    }

    async fn fire(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> bool {
        let topic = self.topics.control_for(&entry.device_id);
        let payload = match ControlCommand::new(&entry.device_id, &entry.action).to_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(schedule = entry.id, error = %err, "failed to encode control command");
                self.record("failed");
                return false;
            }
        };
        match self.channel.send_control(&topic, payload).await {
            Ok(outcome) => {
                let label = match outcome {
                    PublishOutcome::Acknowledged => "acknowledged",
                    PublishOutcome::Unacknowledged => "unacknowledged",
                };
                info!(
                    schedule = entry.id,
                    device = %entry.device_id,
                    action = %entry.action,
                    topic = %topic,
                    outcome = label,
                    "scheduled action fired"
                );
                self.record(label);
                if let Err(err) = self.store.set_schedule_start(entry.id, now + self.debounce) {
                    warn!(schedule = entry.id, error = %err, "failed to push schedule start");
                }
                true
            }
            Err(err) => {
                warn!(schedule = entry.id, device = %entry.device_id, error = %err, "scheduled publish failed");
                self.record("failed");
                false
            }
        }
    }

    fn purge(&self, now: DateTime<Utc>) -> Option<PurgeReport> {
        let cutoff = now - self.horizon;
        match self.store.purge_before(cutoff) {
            Ok(report) => {
                info!(
                    cutoff = %cutoff,
                    messages = report.messages,
                    anomalies = report.anomalies,
                    statuses = report.statuses,
                    service_logs = report.service_logs,
                    "retention purge complete"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_purge(report.total());
                }
                Some(report)
            }
            Err(err) => {
                warn!(cutoff = %cutoff, error = %err, "retention purge failed");
                None
            }
        }
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_fired(outcome);
        }
    }

    /// Tick at the configured period until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let mut limiter = RateLimiter::new(self.retention.schedule_tick);
        info!(period_ms = limiter.period().as_millis() as u64, "schedule dispatcher started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("schedule dispatcher shutdown");
                    break;
                }
                instant = limiter.tick() => {
                    self.tick(Utc::now(), instant.into_std()).await;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ScheduleDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleDispatcher")
            .field("topics", &self.topics)
            .field("retention", &self.retention)
            .field("last_purge", &self.last_purge)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use r_tms_msg::TransportError;
    use r_tms_persistence::{
        AnomalyKind, AnomalyRecord, InMemoryStore, NewSchedule, RecordFilter,
    };
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(String, serde_json::Value)>>,
        failing: Mutex<bool>,
    }

    #[async_trait]
    impl ControlChannel for RecordingChannel {
        async fn send_control(
            &self,
            topic: &str,
            payload: Vec<u8>,
        ) -> r_tms_msg::Result<PublishOutcome> {
            if *self.failing.lock() {
                return Err(TransportError::NotConnected);
            }
            let json = serde_json::from_slice(&payload)?;
            self.sent.lock().push((topic.to_owned(), json));
            Ok(PublishOutcome::Acknowledged)
        }
    }

    fn dispatcher(store: Arc<InMemoryStore>, channel: Arc<RecordingChannel>) -> ScheduleDispatcher {
        ScheduleDispatcher::new(
            store,
            channel,
            TopicConfig::default(),
            RetentionConfig::default(),
        )
    }

    fn schedule(store: &InMemoryStore, now: DateTime<Utc>, start_in: i64, duration: i64) -> u64 {
        store
            .create_schedule(NewSchedule {
                device_id: "dev002".into(),
                action: "pause".into(),
                start_ts: now + chrono::Duration::seconds(start_in),
                end_ts: now + chrono::Duration::seconds(start_in + duration),
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn due_schedule_fires_once_and_is_pushed_a_year() {
        let store = Arc::new(InMemoryStore::new());
        let channel = Arc::new(RecordingChannel::default());
        let mut dispatcher = dispatcher(store.clone(), channel.clone());
        let now = Utc::now();
        let mono = Instant::now();
        let id = schedule(&store, now, 0, 60);

        let first = dispatcher.tick(now, mono).await;
        assert_eq!(first.fired, vec![id]);
        let second = dispatcher
            .tick(now + chrono::Duration::seconds(1), mono + Duration::from_secs(1))
            .await;
        assert!(second.fired.is_empty());

        let sent = channel.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "group_1/control/dev002");
        assert_eq!(sent[0].1["device_id"], "dev002");
        assert_eq!(sent[0].1["action"], "pause");

        let entry = store.schedules().unwrap().into_iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.start_ts, now + chrono::Duration::days(365));
    }

    #[tokio::test]
    async fn schedules_outside_their_window_stay_quiet() {
        let store = Arc::new(InMemoryStore::new());
        let channel = Arc::new(RecordingChannel::default());
        let mut dispatcher = dispatcher(store.clone(), channel.clone());
        let now = Utc::now();
        schedule(&store, now, 30, 60);
        schedule(&store, now, -120, 60);

        let report = dispatcher.tick(now, Instant::now()).await;
        assert!(report.fired.is_empty());
        assert!(report.failed.is_empty());
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_publish_is_retried_while_the_window_is_open() {
        let store = Arc::new(InMemoryStore::new());
        let channel = Arc::new(RecordingChannel::default());
        let mut dispatcher = dispatcher(store.clone(), channel.clone());
        let now = Utc::now();
        let mono = Instant::now();
        let id = schedule(&store, now, 0, 60);

        *channel.failing.lock() = true;
        let report = dispatcher.tick(now, mono).await;
        assert_eq!(report.failed, vec![id]);

        *channel.failing.lock() = false;
        let report = dispatcher
            .tick(now + chrono::Duration::seconds(1), mono + Duration::from_secs(1))
            .await;
        assert_eq!(report.fired, vec![id]);
        assert_eq!(channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn first_tick_purges_then_waits_for_the_interval() {
        let store = Arc::new(InMemoryStore::new());
        let channel = Arc::new(RecordingChannel::default());
        let mut dispatcher = dispatcher(store.clone(), channel);
        let now = Utc::now();
        let mono = Instant::now();

        let mut stale = AnomalyRecord::new("dev001", AnomalyKind::Wild, "old");
        stale.timestamp = now - chrono::Duration::days(40);
        store.append_anomaly(stale).unwrap();
        store
            .append_anomaly(AnomalyRecord::new("dev001", AnomalyKind::Wild, "fresh"))
            .unwrap();

        let first = dispatcher.tick(now, mono).await;
        assert_eq!(first.purge.map(|p| p.anomalies), Some(1));
        assert_eq!(store.anomalies(&RecordFilter::default()).unwrap().len(), 1);

        let hour_later = dispatcher
            .tick(now, mono + Duration::from_secs(3600))
            .await;
        assert!(hour_later.purge.is_none());

        let six_hours = dispatcher
            .tick(now, mono + Duration::from_secs(6 * 3600))
            .await;
        assert!(six_hours.purge.is_some());
    }
}
