//! ---
//! ems_section: "04-telemetry-ingestion"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry validation, reconstruction and liveness tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use r_tms_persistence::AnomalyKind;

use crate::PayloadError;

/// A parsed inbound payload. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    /// Absent when the payload was too broken to identify its sender.
    pub device_id: Option<String>,
    pub location: Option<String>,
    pub sensor_value: Option<f64>,
    pub sequence_id: Option<u64>,
    /// Device timestamp in unix seconds, receipt time when the payload had none.
    pub source_timestamp: f64,
    pub raw_bytes: Vec<u8>,
}

impl TelemetryFrame {
    pub(crate) fn unidentified(raw: &[u8], received: f64) -> Self {
        Self {
            device_id: None,
            location: None,
            sensor_value: None,
            sequence_id: None,
            source_timestamp: received,
            raw_bytes: raw.to_vec(),
        }
    }

    /// Payload as text, replacing invalid sequences.
    pub fn raw_text(&self) -> String {
        String::from_utf8_lossy(&self.raw_bytes).into_owned()
    }
}

/// Outcome of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Valid,
    SchemaInvalid,
    Corrupt,
    Wild,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Valid => "VALID",
            EventKind::SchemaInvalid => "SCHEMA_INVALID",
            EventKind::Corrupt => "CORRUPT",
            EventKind::Wild => "WILD",
        }
    }

    /// Anomaly recorded for this kind; `None` for valid readings.
    pub fn anomaly(&self) -> Option<AnomalyKind> {
        match self {
            EventKind::Valid => None,
            EventKind::SchemaInvalid => Some(AnomalyKind::SchemaInvalid),
            EventKind::Corrupt => Some(AnomalyKind::Corrupt),
            EventKind::Wild => Some(AnomalyKind::Wild),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Range flags attached to a classified reading. Both may be set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeFlags {
    pub wild: bool,
    pub extreme_wild: bool,
}

/// A frame with its classification and receipt clocks.
#[derive(Debug, Clone)]
pub struct ClassifiedEvent {
    pub frame: TelemetryFrame,
    pub kind: EventKind,
    pub flags: RangeFlags,
    /// Rejection reason for CORRUPT and SCHEMA_INVALID frames.
    pub error: Option<PayloadError>,
    pub receipt_wall_time: DateTime<Utc>,
    pub receipt_monotonic_time: Instant,
}

impl ClassifiedEvent {
    pub fn device_id(&self) -> Option<&str> {
        self.frame.device_id.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        self.kind == EventKind::Valid
    }

    /// Whether the frame should open a bridge on the timeline.
    pub fn breaks_timeline(&self) -> bool {
        matches!(self.kind, EventKind::Wild | EventKind::Corrupt)
    }

    /// Passed structural checks, even if the value was rejected.
    pub fn schema_ok(&self) -> bool {
        match &self.error {
            None => true,
            Some(err) => err.schema_ok(),
        }
    }

    /// Human readable description used in anomaly and service log rows.
    pub fn describe(&self) -> String {
        match (&self.kind, &self.error) {
            (EventKind::Valid, _) => match self.frame.sensor_value {
                Some(value) => format!("value {value}"),
                None => "valid".to_owned(),
            },
            (EventKind::Wild, _) => {
                let value = self.frame.sensor_value.unwrap_or(f64::NAN);
                if self.flags.extreme_wild {
                    format!("value {value} out of range (EXTREME)")
                } else {
                    format!("value {value} out of range")
                }
            }
            (_, Some(err)) => err.to_string(),
            (kind, None) => kind.as_str().to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, value: Option<f64>, flags: RangeFlags) -> ClassifiedEvent {
        ClassifiedEvent {
            frame: TelemetryFrame {
                device_id: Some("dev001".into()),
                location: None,
                sensor_value: value,
                sequence_id: None,
                source_timestamp: 1.0,
                raw_bytes: Vec::new(),
            },
            kind,
            flags,
            error: None,
            receipt_wall_time: Utc::now(),
            receipt_monotonic_time: Instant::now(),
        }
    }

    #[test]
    fn extreme_readings_are_noted_in_the_description() {
        let flags = RangeFlags {
            wild: true,
            extreme_wild: true,
        };
        let text = event(EventKind::Wild, Some(999.9), flags).describe();
        assert!(text.contains("999.9"));
        assert!(text.contains("EXTREME"));

        let plain = event(
            EventKind::Wild,
            Some(60.0),
            RangeFlags {
                wild: true,
                extreme_wild: false,
            },
        );
        assert!(!plain.describe().contains("EXTREME"));
    }

    #[test]
    fn only_wild_and_corrupt_break_the_timeline() {
        let flags = RangeFlags::default();
        assert!(event(EventKind::Corrupt, None, flags).breaks_timeline());
        assert!(!event(EventKind::SchemaInvalid, None, flags).breaks_timeline());
        assert!(!event(EventKind::Valid, Some(20.0), flags).breaks_timeline());
        assert_eq!(EventKind::Valid.anomaly(), None);
    }
}
