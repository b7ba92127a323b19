//! ---
//! ems_section: "04-telemetry-ingestion"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry validation, reconstruction and liveness tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use r_tms_metrics::IngestMetrics;
use r_tms_persistence::{AnomalyKind, AnomalyRecord, TelemetryStore};

use crate::NotifyError;

/// Cooldown key for notifications. Extreme readings get their own slot so
/// they are not muted by an ordinary WILD alert on the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Anomaly(AnomalyKind),
    ExtremeWild,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Anomaly(kind) => kind.as_str(),
            NotificationKind::ExtremeWild => "EXTREME_WILD",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for NotificationKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl From<AnomalyKind> for NotificationKind {
    fn from(kind: AnomalyKind) -> Self {
        NotificationKind::Anomaly(kind)
    }
}

/// Message handed to a [`Notifier`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub kind: NotificationKind,
    pub message: String,
}

/// External alert sink. Implementations must not block the caller.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Emits notifications as warnings in the service log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        warn!(
            device = %notification.device_id,
            kind = %notification.kind,
            message = %notification.message,
            "anomaly notification"
        );
        Ok(())
    }
}

/// Default depth of the webhook delivery queue.
pub const WEBHOOK_QUEUE_DEPTH: usize = 256;

/// Posts notifications as JSON to an HTTP endpoint from a background task.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    queue: mpsc::Sender<Notification>,
}

impl WebhookNotifier {
    /// Start the delivery task. It exits once every notifier clone is dropped.
    pub fn spawn(
        url: impl Into<String>,
        client: reqwest::Client,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let url = url.into();
        let (queue, mut rx) = mpsc::channel::<Notification>(capacity.max(1));
        let target = url.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let outcome = client
                    .post(&target)
                    .json(&notification)
                    .send()
                    .await
                    .and_then(|response| response.error_for_status());
                match outcome {
                    Ok(_) => debug!(url = %target, device = %notification.device_id, "webhook delivered"),
                    Err(err) => {
                        warn!(url = %target, device = %notification.device_id, error = %err, "webhook delivery failed")
                    }
                }
            }
            debug!(url = %target, "webhook notifier stopped");
        });
        (Self { url, queue }, task)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.queue
            .try_send(notification.clone())
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => NotifyError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
            })
    }
}

/// Keeps every notification in memory. Can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: std::sync::atomic::AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Notifications sent for one device and key.
    pub fn count(&self, device_id: &str, kind: NotificationKind) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.device_id == device_id && n.kind == kind)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotifyError::Rejected("recording notifier set to fail".into()));
        }
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

/// Result of a notification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Suppressed,
    Failed,
}

impl NotifyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyOutcome::Sent => "sent",
            NotifyOutcome::Suppressed => "suppressed",
            NotifyOutcome::Failed => "failed",
        }
    }
}

/// Routes anomalies to storage and rate-limited notification.
///
/// Storage and notification are independent: a failure in one never blocks
/// the other, and neither ever reaches the caller.
pub struct AnomalyRegistry {
    store: Arc<dyn TelemetryStore>,
    notifier: Arc<dyn Notifier>,
    cooldown: Duration,
    last_sent: Mutex<HashMap<(String, NotificationKind), Instant>>,
    metrics: Option<IngestMetrics>,
}

impl AnomalyRegistry {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        notifier: Arc<dyn Notifier>,
        cooldown: Duration,
    ) -> Self {
        info!(notifier = notifier.name(), cooldown_s = cooldown.as_secs(), "anomaly registry ready");
        Self {
            store,
            notifier,
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Append the record to storage.
    pub fn record(&self, record: AnomalyRecord) {
        if let Some(metrics) = &self.metrics {
            metrics.record_anomaly(record.kind.as_str());
        }
        let device = record.device_id.clone();
        let kind = record.kind;
        if let Err(err) = self.store.append_anomaly(record) {
            warn!(device = %device, kind = %kind, error = %err, "failed to store anomaly");
        }
    }

    /// Notify now, subject to the cooldown for `(device_id, kind)`.
    pub fn notify(&self, device_id: &str, kind: NotificationKind, message: &str) -> NotifyOutcome {
        self.notify_at(device_id, kind, message, Instant::now())
    }

    /// Notify with an explicit monotonic clock reading.
    pub fn notify_at(
        &self,
        device_id: &str,
        kind: NotificationKind,
        message: &str,
        now: Instant,
    ) -> NotifyOutcome {
        let key = (device_id.to_owned(), kind);
        let previous = {
            let mut last_sent = self.last_sent.lock();
            let cooling = last_sent
                .get(&key)
                .is_some_and(|at| now.saturating_duration_since(*at) < self.cooldown);
            if cooling {
                drop(last_sent);
                debug!(device = device_id, kind = %kind, "notification suppressed by cooldown");
                return self.count(NotifyOutcome::Suppressed);
            }
            last_sent.insert(key.clone(), now)
        };

        let notification = Notification {
            timestamp: Utc::now(),
            device_id: device_id.to_owned(),
            kind,
            message: message.to_owned(),
        };
        match self.notifier.notify(&notification) {
            Ok(()) => self.count(NotifyOutcome::Sent),
            Err(err) => {
                warn!(
                    device = device_id,
                    kind = %kind,
                    notifier = self.notifier.name(),
                    error = %err,
                    "notification failed"
                );
                // failed sends do not start a cooldown
                let mut last_sent = self.last_sent.lock();
                match previous {
                    Some(at) => last_sent.insert(key, at),
                    None => last_sent.remove(&key),
                };
                self.count(NotifyOutcome::Failed)
            }
        }
    }

    /// Record and notify under the anomaly's own kind.
    pub fn report(&self, record: AnomalyRecord) -> NotifyOutcome {
        self.report_at(record, Instant::now())
    }

    pub fn report_at(&self, record: AnomalyRecord, now: Instant) -> NotifyOutcome {
        let device = record.device_id.clone();
        let kind = NotificationKind::Anomaly(record.kind);
        let message = record.message.clone();
        self.record(record);
        self.notify_at(&device, kind, &message, now)
    }

    fn count(&self, outcome: NotifyOutcome) -> NotifyOutcome {
        if let Some(metrics) = &self.metrics {
            metrics.record_notification(outcome.as_str());
        }
        outcome
    }
}

impl fmt::Debug for AnomalyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnomalyRegistry")
            .field("notifier", &self.notifier.name())
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_tms_persistence::{InMemoryStore, RecordFilter};

    fn registry(notifier: Arc<RecordingNotifier>) -> (AnomalyRegistry, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let registry = AnomalyRegistry::new(store.clone(), notifier, Duration::from_secs(300));
        (registry, store)
    }

    #[test]
    fn cooldown_limits_notifications_not_records() {
        let notifier = Arc::new(RecordingNotifier::new());
        let (registry, store) = registry(notifier.clone());
        let start = Instant::now();

        let first = registry.report_at(AnomalyRecord::new("d1", AnomalyKind::Wild, "a"), start);
        let second = registry.report_at(
            AnomalyRecord::new("d1", AnomalyKind::Wild, "b"),
            start + Duration::from_secs(10),
        );
        assert_eq!(first, NotifyOutcome::Sent);
        assert_eq!(second, NotifyOutcome::Suppressed);
        assert_eq!(notifier.count("d1", AnomalyKind::Wild.into()), 1);
        assert_eq!(store.anomalies(&RecordFilter::device("d1")).unwrap().len(), 2);

        let later = registry.report_at(
            AnomalyRecord::new("d1", AnomalyKind::Wild, "c"),
            start + Duration::from_secs(301),
        );
        assert_eq!(later, NotifyOutcome::Sent);
    }

    #[test]
    fn keys_are_per_device_and_kind() {
        let notifier = Arc::new(RecordingNotifier::new());
        let (registry, _store) = registry(notifier.clone());
        let now = Instant::now();
        registry.notify_at("d1", AnomalyKind::Wild.into(), "x", now);
        registry.notify_at("d1", NotificationKind::ExtremeWild, "x", now);
        registry.notify_at("d2", AnomalyKind::Wild.into(), "x", now);
        registry.notify_at("d1", AnomalyKind::Corrupt.into(), "x", now);
        assert_eq!(notifier.sent().len(), 4);
    }

    #[test]
    fn failing_notifier_is_swallowed_and_retried() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.set_failing(true);
        let (registry, store) = registry(notifier.clone());
        let now = Instant::now();

        let outcome = registry.report_at(AnomalyRecord::new("d1", AnomalyKind::NoData, "quiet"), now);
        assert_eq!(outcome, NotifyOutcome::Failed);
        assert_eq!(store.anomalies(&RecordFilter::default()).unwrap().len(), 1);

        notifier.set_failing(false);
        let retry = registry.notify_at(
            "d1",
            AnomalyKind::NoData.into(),
            "quiet",
            now + Duration::from_secs(1),
        );
        assert_eq!(retry, NotifyOutcome::Sent);
    }

    #[test]
    fn notification_kind_serializes_as_label() {
        let notification = Notification {
            timestamp: Utc::now(),
            device_id: "d1".into(),
            kind: NotificationKind::ExtremeWild,
            message: "999.9".into(),
        };
        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["kind"], "EXTREME_WILD");
    }

    #[tokio::test]
    async fn webhook_reports_a_closed_queue() {
        let (notifier, task) =
            WebhookNotifier::spawn("http://127.0.0.1:1/hook", reqwest::Client::new(), 1);
        task.abort();
        let _ = task.await;
        let err = notifier
            .notify(&Notification {
                timestamp: Utc::now(),
                device_id: "d1".into(),
                kind: AnomalyKind::Wild.into(),
                message: "x".into(),
            })
            .unwrap_err();
        assert!(matches!(err, NotifyError::Closed));
    }
}
