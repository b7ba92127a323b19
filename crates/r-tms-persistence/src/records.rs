//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry record storage and journaling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Categories of anomalies recorded by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    /// Reading outside the allowed range.
    Wild,
    /// Payload or value could not be interpreted.
    Corrupt,
    /// Well-formed JSON missing required fields.
    SchemaInvalid,
    /// Sequence numbers skipped two or more packets.
    SequenceGap,
    /// Device online but silent past the liveness threshold.
    NoData,
    /// Device announced OFFLINE or its last-will fired.
    NetworkDrop,
    /// Device stopped publishing on purpose.
    Stopped,
}

impl AnomalyKind {
    /// Every kind, in declaration order.
    pub const ALL: [AnomalyKind; 7] = [
        AnomalyKind::Wild,
        AnomalyKind::Corrupt,
        AnomalyKind::SchemaInvalid,
        AnomalyKind::SequenceGap,
        AnomalyKind::NoData,
        AnomalyKind::NetworkDrop,
        AnomalyKind::Stopped,
    ];

    /// Stable string used in storage, logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Wild => "WILD",
            AnomalyKind::Corrupt => "CORRUPT",
            AnomalyKind::SchemaInvalid => "SCHEMA_INVALID",
            AnomalyKind::SequenceGap => "SEQUENCE_GAP",
            AnomalyKind::NoData => "NO_DATA",
            AnomalyKind::NetworkDrop => "NETWORK_DROP",
            AnomalyKind::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only anomaly row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    /// When the anomaly was observed.
    pub timestamp: DateTime<Utc>,
    /// Affected device, `"unknown"` when the payload carried none.
    pub device_id: String,
    /// Anomaly category.
    pub kind: AnomalyKind,
    /// Human readable detail.
    pub message: String,
}

impl AnomalyRecord {
    /// Record stamped with the current time.
    pub fn new(device_id: impl Into<String>, kind: AnomalyKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            device_id: device_id.into(),
            kind,
            message: message.into(),
        }
    }
}

/// A valid reading accepted into the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Identifier assigned by the store; zero until appended.
    #[serde(default)]
    pub id: u64,
    /// Receipt time.
    pub received_at: DateTime<Utc>,
    /// Device timestamp, unix seconds.
    pub source_timestamp: f64,
    /// Publishing device.
    pub device_id: String,
    /// Device location, when reported.
    pub location: Option<String>,
    /// Reading value.
    pub value: f64,
    /// Sender sequence number.
    pub sequence: Option<u64>,
    /// Topic the reading arrived on.
    pub topic: String,
    /// Delivery QoS.
    pub qos: u8,
    /// Raw payload text.
    pub raw: String,
}

/// Snapshot of a status announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Receipt time.
    pub timestamp: DateTime<Utc>,
    /// Announcing device.
    pub device_id: String,
    /// Device location.
    pub location: Option<String>,
    /// Status string as announced.
    pub status: String,
}

/// One row per data message, describing how it was handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLogRecord {
    /// Receipt time.
    pub timestamp: DateTime<Utc>,
    /// Device, when one could be identified.
    pub device_id: Option<String>,
    /// Topic the message arrived on.
    pub topic: String,
    /// Delivery QoS.
    pub qos: u8,
    /// Whether the payload passed schema checks.
    pub schema_ok: bool,
    /// Summary line.
    pub log_message: String,
    /// Anomaly raised for this message, if any.
    pub anomaly_type: Option<AnomalyKind>,
}

/// A time-windowed control action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Store assigned identifier.
    pub id: u64,
    /// Target device.
    pub device_id: String,
    /// Control action string.
    pub action: String,
    /// Window start; pushed a year ahead after firing.
    pub start_ts: DateTime<Utc>,
    /// Window end.
    pub end_ts: DateTime<Utc>,
}

impl ScheduleEntry {
    /// Whether `now` falls inside the window, bounds included.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.start_ts <= now && now <= self.end_ts
    }
}

/// Schedule awaiting an identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSchedule {
    /// Target device.
    pub device_id: String,
    /// Control action string.
    pub action: String,
    /// Window start.
    pub start_ts: DateTime<Utc>,
    /// Window end.
    pub end_ts: DateTime<Utc>,
}

/// Device and time-range filter shared by the read queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Restrict to one device.
    pub device_id: Option<String>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    /// Maximum rows returned by list queries.
    pub limit: Option<usize>,
}

impl RecordFilter {
    /// Filter for a single device.
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Self::default()
        }
    }

    /// Whether a row for `device_id` at `at` passes the filter.
    pub fn matches(&self, device_id: Option<&str>, at: DateTime<Utc>) -> bool {
        if let Some(wanted) = &self.device_id {
            if device_id != Some(wanted.as_str()) {
                return false;
            }
        }
        self.since.map_or(true, |since| at >= since) && self.until.map_or(true, |until| at <= until)
    }
}

/// Summary over valid readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    /// Number of readings.
    pub count: u64,
    /// Mean value.
    pub avg: Option<f64>,
    /// Minimum value.
    pub min: Option<f64>,
    /// Maximum value.
    pub max: Option<f64>,
    /// Anomalies matching the same filter.
    pub anomalies: u64,
}

/// Rows removed by a retention purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    /// Readings removed.
    pub messages: usize,
    /// Anomalies removed.
    pub anomalies: usize,
    /// Status snapshots removed.
    pub statuses: usize,
    /// Service log rows removed.
    pub service_logs: usize,
}

impl PurgeReport {
    /// Total rows removed.
    pub fn total(&self) -> usize {
        self.messages + self.anomalies + self.statuses + self.service_logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn anomaly_kinds_use_upper_snake_case() {
        let json = serde_json::to_string(&AnomalyKind::SchemaInvalid).expect("encode");
        assert_eq!(json, "\"SCHEMA_INVALID\"");
        for kind in AnomalyKind::ALL {
            assert_eq!(format!("\"{kind}\""), serde_json::to_string(&kind).expect("encode"));
        }
    }

    #[test]
    fn schedule_window_is_inclusive() {
        let start = Utc::now();
        let entry = ScheduleEntry {
            id: 1,
            device_id: "dev001".into(),
            action: "pause".into(),
            start_ts: start,
            end_ts: start + Duration::seconds(60),
        };
        assert!(entry.is_due(start));
        assert!(entry.is_due(start + Duration::seconds(60)));
        assert!(!entry.is_due(start - Duration::milliseconds(1)));
        assert!(!entry.is_due(start + Duration::seconds(61)));
    }

    #[test]
    fn filter_checks_device_and_range() {
        let now = Utc::now();
        let filter = RecordFilter {
            since: Some(now - Duration::seconds(10)),
            ..RecordFilter::device("dev002")
        };
        assert!(filter.matches(Some("dev002"), now));
        assert!(!filter.matches(Some("dev001"), now));
        assert!(!filter.matches(None, now));
        assert!(!filter.matches(Some("dev002"), now - Duration::seconds(11)));
    }
}
