//! ---
//! ems_section: "04-telemetry-ingestion"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry validation, reconstruction and liveness tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use r_tms_msg::ConnectivityStatus;
use r_tms_persistence::{AnomalyKind, AnomalyRecord};

use crate::anomaly::AnomalyRegistry;
use crate::registry::{ActiveAlert, DeviceRegistry};

/// Liveness transitions observed by the watchdog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LivenessEvent {
    NoData { device_id: String, silent_for_secs: f64 },
    Resumed { device_id: String },
    NetworkDrop { device_id: String },
    Stopped { device_id: String },
    Online { device_id: String },
}

impl LivenessEvent {
    pub fn device_id(&self) -> &str {
        match self {
            LivenessEvent::NoData { device_id, .. }
            | LivenessEvent::Resumed { device_id }
            | LivenessEvent::NetworkDrop { device_id }
            | LivenessEvent::Stopped { device_id }
            | LivenessEvent::Online { device_id } => device_id,
        }
    }
}

/// Tells a stalled data feed apart from a dropped connection.
///
/// Connection loss is only ever learned from status announcements (including
/// last-will); silence on an otherwise online device becomes NO_DATA.
#[derive(Debug)]
pub struct LivenessWatchdog {
    registry: Arc<DeviceRegistry>,
    anomalies: Arc<AnomalyRegistry>,
    threshold: Duration,
}

impl LivenessWatchdog {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        anomalies: Arc<AnomalyRegistry>,
        threshold: Duration,
    ) -> Self {
        Self {
            registry,
            anomalies,
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Apply a status announcement for a device.
    pub fn on_status(
        &self,
        device_id: &str,
        location: Option<&str>,
        status: ConnectivityStatus,
        now: Instant,
    ) -> Option<LivenessEvent> {
        let handle = self.registry.entry(device_id, status);
        let mut state = handle.lock();
        state.connectivity = status;
        if let Some(location) = location {
            state.location = Some(location.to_owned());
        }

        let (kind, message, event) = match status {
            ConnectivityStatus::Offline => {
                state.active_alert = ActiveAlert::NetworkDrop;
                (
                    AnomalyKind::NetworkDrop,
                    "device reported OFFLINE",
                    LivenessEvent::NetworkDrop {
                        device_id: device_id.to_owned(),
                    },
                )
            }
            ConnectivityStatus::Stopped => {
                state.active_alert = ActiveAlert::Stopped;
                state.stopped_by_peer = true;
                (
                    AnomalyKind::Stopped,
                    "device stopped publishing",
                    LivenessEvent::Stopped {
                        device_id: device_id.to_owned(),
                    },
                )
            }
            ConnectivityStatus::Online => {
                state.active_alert = ActiveAlert::None;
                state.stopped_by_peer = false;
                state.last_receipt = Some(now);
                info!(device = device_id, "device online");
                return Some(LivenessEvent::Online {
                    device_id: device_id.to_owned(),
                });
            }
            other => {
                debug!(device = device_id, status = %other, "connectivity updated");
                return None;
            }
        };
        drop(state);

        warn!(device = device_id, kind = %kind, "{message}");
        self.anomalies
            .report_at(AnomalyRecord::new(device_id, kind, message), now);
        Some(event)
    }

    /// Evaluate silence for every online device.
    pub fn tick(&self, now: Instant) -> Vec<LivenessEvent> {
        let mut events = Vec::new();
        for handle in self.registry.handles() {
            let mut state = handle.lock();
            if state.connectivity != ConnectivityStatus::Online {
                continue;
            }
            let Some(last) = state.last_receipt else {
                continue;
            };
            let silent = now.saturating_duration_since(last);
            let device_id = state.device_id.clone();

            if silent > self.threshold && state.active_alert != ActiveAlert::NoData {
                state.active_alert = ActiveAlert::NoData;
                drop(state);
                let message = format!(
                    "no data for {:.1}s (threshold {:.2}s)",
                    silent.as_secs_f64(),
                    self.threshold.as_secs_f64()
                );
                warn!(device = %device_id, silent_s = silent.as_secs_f64(), "data feed stalled");
                self.anomalies
                    .report_at(AnomalyRecord::new(&device_id, AnomalyKind::NoData, message), now);
                events.push(LivenessEvent::NoData {
                    device_id,
                    silent_for_secs: silent.as_secs_f64(),
                });
            } else if silent <= self.threshold && state.active_alert == ActiveAlert::NoData {
                state.active_alert = ActiveAlert::None;
                info!(device = %device_id, "data feed resumed");
                events.push(LivenessEvent::Resumed { device_id });
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::RecordingNotifier;
    use r_tms_persistence::{InMemoryStore, RecordFilter, TelemetryStore};

    struct Fixture {
        watchdog: LivenessWatchdog,
        registry: Arc<DeviceRegistry>,
        store: Arc<InMemoryStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(DeviceRegistry::new());
        let store = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let anomalies = Arc::new(AnomalyRegistry::new(
            store.clone(),
            notifier.clone(),
            Duration::from_secs(300),
        ));
        let watchdog =
            LivenessWatchdog::new(registry.clone(), anomalies, Duration::from_secs_f64(4.75));
        Fixture {
            watchdog,
            registry,
            store,
            notifier,
        }
    }

    fn count(store: &InMemoryStore, kind: AnomalyKind) -> usize {
        store
            .anomalies(&RecordFilter::default())
            .unwrap()
            .iter()
            .filter(|a| a.kind == kind)
            .count()
    }

    #[test]
    fn silence_raises_no_data_once_then_resumes_once() {
        let f = fixture();
        let start = Instant::now();
        f.watchdog.on_status("d1", Some("Library"), ConnectivityStatus::Online, start);

        assert!(f.watchdog.tick(start + Duration::from_secs(4)).is_empty());
        let stalled = f.watchdog.tick(start + Duration::from_secs(5));
        assert!(matches!(&stalled[..], [LivenessEvent::NoData { device_id, .. }] if device_id == "d1"));
        assert!(f.watchdog.tick(start + Duration::from_secs(7)).is_empty());
        assert!(f.watchdog.tick(start + Duration::from_secs(9)).is_empty());
        assert_eq!(count(&f.store, AnomalyKind::NoData), 1);

        f.registry.get("d1").unwrap().lock().last_receipt = Some(start + Duration::from_secs(10));
        let resumed = f.watchdog.tick(start + Duration::from_secs(11));
        assert_eq!(resumed, vec![LivenessEvent::Resumed { device_id: "d1".into() }]);
        assert!(f.watchdog.tick(start + Duration::from_secs(12)).is_empty());
    }

    #[test]
    fn offline_forces_network_drop_and_tick_never_does() {
        let f = fixture();
        let start = Instant::now();
        f.watchdog.on_status("d1", None, ConnectivityStatus::Online, start);
        f.watchdog.tick(start + Duration::from_secs(6));
        assert_eq!(
            f.registry.get("d1").unwrap().lock().active_alert,
            ActiveAlert::NoData
        );

        let event = f
            .watchdog
            .on_status("d1", None, ConnectivityStatus::Offline, start + Duration::from_secs(7));
        assert!(matches!(event, Some(LivenessEvent::NetworkDrop { .. })));
        assert_eq!(
            f.registry.get("d1").unwrap().lock().active_alert,
            ActiveAlert::NetworkDrop
        );
        assert_eq!(count(&f.store, AnomalyKind::NetworkDrop), 1);
        assert_eq!(f.notifier.count("d1", AnomalyKind::NetworkDrop.into()), 1);

        assert!(f.watchdog.tick(start + Duration::from_secs(60)).is_empty());
        assert_eq!(count(&f.store, AnomalyKind::NetworkDrop), 1);
    }

    #[test]
    fn stopped_and_online_toggle_the_peer_flag() {
        let f = fixture();
        let start = Instant::now();
        f.watchdog.on_status("d2", None, ConnectivityStatus::Stopped, start);
        {
            let handle = f.registry.get("d2").unwrap();
            let state = handle.lock();
            assert!(state.stopped_by_peer);
            assert_eq!(state.active_alert, ActiveAlert::Stopped);
        }
        assert_eq!(count(&f.store, AnomalyKind::Stopped), 1);
        assert!(f.watchdog.tick(start + Duration::from_secs(30)).is_empty());

        let later = start + Duration::from_secs(31);
        f.watchdog.on_status("d2", None, ConnectivityStatus::Online, later);
        let handle = f.registry.get("d2").unwrap();
        let state = handle.lock();
        assert!(!state.stopped_by_peer);
        assert_eq!(state.active_alert, ActiveAlert::None);
        assert_eq!(state.last_receipt, Some(later));
    }

    #[test]
    fn devices_never_heard_from_are_not_stalled() {
        let f = fixture();
        f.registry.entry("d3", ConnectivityStatus::Online);
        assert!(f
            .watchdog
            .tick(Instant::now() + Duration::from_secs(600))
            .is_empty());
    }
}
