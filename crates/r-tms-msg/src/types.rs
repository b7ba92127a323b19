//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry wire types, broker transports and the resilient link."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::qos::{ProtocolVersion, QosLevel};

/// Units reported by the temperature probes.
pub const DEFAULT_UNITS: &str = "celsius";
/// Reading type reported by the temperature probes.
pub const DEFAULT_READING_TYPE: &str = "temperature";

/// Raw message handed from a broker session to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Undecoded payload bytes.
    pub payload: Vec<u8>,
    /// Delivery QoS granted by the broker.
    pub qos: QosLevel,
    /// Whether the broker replayed this as a retained message.
    pub retained: bool,
}

/// Device connectivity as announced on the status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityStatus {
    /// Connected and (normally) publishing.
    Online,
    /// Disconnected, either announced or via last-will.
    Offline,
    /// Connection attempt in progress.
    Connecting,
    /// Clean disconnect in progress.
    Disconnecting,
    /// Connected but deliberately not publishing.
    Stopped,
    /// Nothing known yet.
    #[default]
    Unknown,
}

impl ConnectivityStatus {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityStatus::Online => "ONLINE",
            ConnectivityStatus::Offline => "OFFLINE",
            ConnectivityStatus::Connecting => "CONNECTING",
            ConnectivityStatus::Disconnecting => "DISCONNECTING",
            ConnectivityStatus::Stopped => "STOPPED",
            ConnectivityStatus::Unknown => "UNKNOWN",
        }
    }

    /// Case-insensitive parse; unrecognised values map to `Unknown`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => ConnectivityStatus::Online,
            "OFFLINE" => ConnectivityStatus::Offline,
            "CONNECTING" => ConnectivityStatus::Connecting,
            "DISCONNECTING" => ConnectivityStatus::Disconnecting,
            "STOPPED" => ConnectivityStatus::Stopped,
            _ => ConnectivityStatus::Unknown,
        }
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retained liveness announcement published by devices (and their last-will).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Announcing device.
    pub device_id: String,
    /// Free-form installation location.
    #[serde(default)]
    pub location: Option<String>,
    /// Raw status string; see [`StatusPayload::status`].
    pub status: String,
}

impl StatusPayload {
    /// Build an announcement for a device.
    pub fn new(
        device_id: impl Into<String>,
        location: impl Into<String>,
        status: ConnectivityStatus,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            location: Some(location.into()),
            status: status.as_str().to_owned(),
        }
    }

    /// Decoded connectivity status.
    pub fn status(&self) -> ConnectivityStatus {
        ConnectivityStatus::parse_lenient(&self.status)
    }

    /// Serialize to the JSON bytes sent on the wire.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Sensor reading nested inside a data payload.
///
/// `value` stays untyped so that faulty devices can be represented on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Reported value, normally a number.
    pub value: JsonValue,
    /// Measurement units.
    #[serde(default)]
    pub units: Option<String>,
    /// Kind of measurement.
    #[serde(default)]
    pub reading_type: Option<String>,
}

/// Telemetry sample as published by a device on the data topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    /// `{device_id}-{counter}`; the counter is the per-device sequence number.
    pub packet_id: String,
    /// Source timestamp, unix seconds.
    pub timestamp: f64,
    /// Human readable local time of the sample.
    #[serde(default)]
    pub datetime: Option<String>,
    /// Publishing device.
    pub device_id: String,
    /// Device location.
    #[serde(default)]
    pub location: Option<String>,
    /// The measurement itself.
    pub sensor_data: SensorReading,
}

impl DataPayload {
    /// Serialize to the JSON bytes sent on the wire.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Recognised control actions. Unknown actions are still forwarded verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlAction {
    /// Stop publishing but stay connected.
    Pause,
    /// Resume publishing.
    Resume,
    /// Announce offline and disconnect.
    Shutdown,
    /// Rebuild the connection with new protocol settings.
    Reconfig,
}

impl ControlAction {
    /// Map an action string (and its common aliases) to a known action.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pause" | "stop" => Some(ControlAction::Pause),
            "resume" | "start" => Some(ControlAction::Resume),
            "shutdown" | "offline" => Some(ControlAction::Shutdown),
            "reconfig" | "reconfigure" => Some(ControlAction::Reconfig),
            _ => None,
        }
    }
}

/// Command published to `{control}/{device_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    /// Target device.
    pub device_id: String,
    /// Action string, see [`ControlAction`].
    pub action: String,
    /// Protocol version for `reconfig`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<ProtocolVersion>,
    /// QoS for `reconfig`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<QosLevel>,
}

impl ControlCommand {
    /// Command without reconfiguration parameters.
    pub fn new(device_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            action: action.into(),
            version: None,
            qos: None,
        }
    }

    /// Known action, if any.
    pub fn known_action(&self) -> Option<ControlAction> {
        ControlAction::parse(&self.action)
    }

    /// Serialize to the JSON bytes sent on the wire.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_are_case_insensitive() {
        let payload: StatusPayload =
            serde_json::from_str(r#"{"device_id":"dev001","status":"offline"}"#)
                .expect("valid status");
        assert_eq!(payload.status(), ConnectivityStatus::Offline);
        assert_eq!(payload.location, None);
        assert_eq!(
            ConnectivityStatus::parse_lenient("rebooting"),
            ConnectivityStatus::Unknown
        );
    }

    #[test]
    fn status_announcement_matches_device_wire_format() {
        let payload = StatusPayload::new("dev001", "Library", ConnectivityStatus::Stopped);
        let json: serde_json::Value =
            serde_json::from_slice(&payload.to_bytes().expect("encode")).expect("json");
        assert_eq!(json["status"], "STOPPED");
        assert_eq!(json["location"], "Library");
    }

    #[test]
    fn control_command_omits_absent_reconfig_fields() {
        let command = ControlCommand::new("dev002", "pause");
        let json = String::from_utf8(command.to_bytes().expect("encode")).expect("utf8");
        assert_eq!(json, r#"{"device_id":"dev002","action":"pause"}"#);
        assert_eq!(command.known_action(), Some(ControlAction::Pause));
    }

    #[test]
    fn control_command_normalises_reconfig_numbers() {
        let command: ControlCommand = serde_json::from_str(
            r#"{"device_id":"dev003","action":"reconfig","version":4,"qos":7}"#,
        )
        .expect("valid command");
        assert_eq!(command.version, Some(ProtocolVersion::V311));
        assert_eq!(command.qos, Some(QosLevel::AtMostOnce));
    }
}
