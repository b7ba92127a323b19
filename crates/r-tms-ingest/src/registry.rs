//! ---
//! ems_section: "04-telemetry-ingestion"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry validation, reconstruction and liveness tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use r_tms_msg::ConnectivityStatus;

/// Alert currently raised for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActiveAlert {
    #[default]
    None,
    NoData,
    NetworkDrop,
    Wild,
    Corrupt,
    Stopped,
}

impl ActiveAlert {
    /// Alerts owned by the liveness side; data anomalies never overwrite them.
    pub fn is_liveness(&self) -> bool {
        matches!(
            self,
            ActiveAlert::NoData | ActiveAlert::NetworkDrop | ActiveAlert::Stopped
        )
    }
}

/// Mutable per-device view shared by the reconstructor and the watchdog.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub device_id: String,
    pub location: Option<String>,
    pub connectivity: ConnectivityStatus,
    pub last_value: Option<f64>,
    pub last_source_timestamp: Option<f64>,
    pub last_receipt: Option<Instant>,
    pub active_alert: ActiveAlert,
    pub stopped_by_peer: bool,
}

impl DeviceState {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_owned(),
            location: None,
            connectivity: ConnectivityStatus::Unknown,
            last_value: None,
            last_source_timestamp: None,
            last_receipt: None,
            active_alert: ActiveAlert::None,
            stopped_by_peer: false,
        }
    }

    /// Data arriving now is treated as a gap rather than a reading.
    pub fn is_stopped(&self) -> bool {
        self.stopped_by_peer || self.active_alert == ActiveAlert::Stopped
    }

    pub fn snapshot(&self, now: Instant) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            location: self.location.clone(),
            connectivity: self.connectivity,
            last_value: self.last_value,
            last_source_timestamp: self.last_source_timestamp,
            silent_for_secs: self
                .last_receipt
                .map(|at| now.saturating_duration_since(at).as_secs_f64()),
            active_alert: self.active_alert,
            stopped_by_peer: self.stopped_by_peer,
        }
    }
}

/// Serializable copy of a device's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub location: Option<String>,
    pub connectivity: ConnectivityStatus,
    pub last_value: Option<f64>,
    pub last_source_timestamp: Option<f64>,
    pub silent_for_secs: Option<f64>,
    pub active_alert: ActiveAlert,
    pub stopped_by_peer: bool,
}

/// Owned map of device states, each behind its own lock.
///
/// Entries are created on first sight and never removed.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<String, Arc<Mutex<DeviceState>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a device without creating it.
    pub fn get(&self, device_id: &str) -> Option<Arc<Mutex<DeviceState>>> {
        self.devices.read().get(device_id).cloned()
    }

    /// Fetch or create a device. `initial` applies only to a new entry.
    pub fn entry(
        &self,
        device_id: &str,
        initial: ConnectivityStatus,
    ) -> Arc<Mutex<DeviceState>> {
        if let Some(existing) = self.get(device_id) {
            return existing;
        }
        let mut devices = self.devices.write();
        devices
            .entry(device_id.to_owned())
            .or_insert_with(|| {
                debug!(device = device_id, status = %initial, "tracking new device");
                let mut state = DeviceState::new(device_id);
                state.connectivity = initial;
                Arc::new(Mutex::new(state))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    /// Handles for every device, ordered by id.
    pub fn handles(&self) -> Vec<Arc<Mutex<DeviceState>>> {
        self.devices.read().values().cloned().collect()
    }

    /// Snapshots for every device, ordered by id.
    pub fn snapshot(&self, now: Instant) -> Vec<DeviceSnapshot> {
        self.handles()
            .into_iter()
            .map(|handle| handle.lock().snapshot(now))
            .collect()
    }

    /// Time since the device last delivered a frame.
    pub fn silence(&self, device_id: &str, now: Instant) -> Option<Duration> {
        let handle = self.get(device_id)?;
        let state = handle.lock();
        state
            .last_receipt
            .map(|at| now.saturating_duration_since(at))
    }
}
