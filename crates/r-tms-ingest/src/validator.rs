//! ---
//! ems_section: "04-telemetry-ingestion"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry validation, reconstruction and liveness tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::trace;

use r_tms_common::time::to_unix_seconds;
use r_tms_common::ValidationConfig;
use r_tms_persistence::AnomalyRecord;

use crate::anomaly::{AnomalyRegistry, NotificationKind};
use crate::frame::{ClassifiedEvent, EventKind, RangeFlags, TelemetryFrame};
use crate::PayloadError;

/// Device id used in anomaly rows when the payload carried none.
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Parses and schema-checks inbound data payloads.
///
/// Classification is pure: it never touches device state or storage. The
/// caller decides what to do with the result, normally through
/// [`MessageValidator::report`].
#[derive(Debug, Clone)]
pub struct MessageValidator {
    rules: ValidationConfig,
}

impl MessageValidator {
    pub fn new(rules: ValidationConfig) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ValidationConfig {
        &self.rules
    }

    /// Classify a payload received now.
    pub fn classify(&self, raw: &[u8]) -> ClassifiedEvent {
        self.classify_at(raw, Utc::now(), Instant::now())
    }

    /// Classify a payload with explicit receipt clocks.
    pub fn classify_at(
        &self,
        raw: &[u8],
        received_at: DateTime<Utc>,
        received_mono: Instant,
    ) -> ClassifiedEvent {
        let (frame, outcome) = self.parse(raw, to_unix_seconds(received_at));
        let (kind, flags, error) = match outcome {
            Ok(value) => {
                let flags = self.range_flags(value);
                let kind = if flags.wild {
                    EventKind::Wild
                } else {
                    EventKind::Valid
                };
                (kind, flags, None)
            }
            Err(err) => {
                let kind = if err.is_schema() {
                    EventKind::SchemaInvalid
                } else {
                    EventKind::Corrupt
                };
                (kind, RangeFlags::default(), Some(err))
            }
        };
        trace!(device = ?frame.device_id, kind = %kind, "classified payload");
        ClassifiedEvent {
            frame,
            kind,
            flags,
            error,
            receipt_wall_time: received_at,
            receipt_monotonic_time: received_mono,
        }
    }

    /// Anomaly row and notification key for a non-valid event.
    pub fn anomaly_for(event: &ClassifiedEvent) -> Option<(AnomalyRecord, NotificationKind)> {
        let kind = event.kind.anomaly()?;
        let device = event.device_id().unwrap_or(UNKNOWN_DEVICE);
        let mut record = AnomalyRecord::new(device, kind, event.describe());
        record.timestamp = event.receipt_wall_time;
        let key = if event.flags.extreme_wild {
            NotificationKind::ExtremeWild
        } else {
            NotificationKind::Anomaly(kind)
        };
        Some((record, key))
    }

    /// Record and notify the single anomaly a non-valid event carries.
    pub fn report(&self, event: &ClassifiedEvent, anomalies: &AnomalyRegistry) {
        if let Some((record, key)) = Self::anomaly_for(event) {
            let device = record.device_id.clone();
            let message = record.message.clone();
            anomalies.record(record);
            anomalies.notify(&device, key, &message);
        }
    }

    fn parse(
        &self,
        raw: &[u8],
        received: f64,
    ) -> (TelemetryFrame, Result<f64, PayloadError>) {
        let mut frame = TelemetryFrame::unidentified(raw, received);

        let text = match std::str::from_utf8(raw) {
            Ok(text) => text,
            Err(_) => return (frame, Err(PayloadError::NotUtf8)),
        };
        if text.trim().is_empty() {
            return (frame, Err(PayloadError::Empty));
        }
        let object = match serde_json::from_str::<JsonValue>(text) {
            Ok(JsonValue::Object(object)) => object,
            Ok(_) => return (frame, Err(PayloadError::NotObject)),
            Err(err) => return (frame, Err(PayloadError::Json(err.to_string()))),
        };

        let Some(device_id) = object
            .get("device_id")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            return (frame, Err(PayloadError::MissingDeviceId));
        };
        frame.device_id = Some(device_id.to_owned());
        frame.location = object
            .get("location")
            .and_then(JsonValue::as_str)
            .map(str::to_owned);
        if let Some(ts) = object
            .get("timestamp")
            .and_then(JsonValue::as_f64)
            .filter(|ts| ts.is_finite())
        {
            frame.source_timestamp = ts;
        }
        frame.sequence_id = sequence_of(&object);

        let Some(sensor) = object.get("sensor_data").and_then(JsonValue::as_object) else {
            return (frame, Err(PayloadError::MissingSensorData));
        };
        let Some(raw_value) = sensor.get("value") else {
            return (frame, Err(PayloadError::MissingValue));
        };

        match self.coerce(raw_value) {
            Ok(value) => {
                frame.sensor_value = Some(value);
                (frame, Ok(value))
            }
            Err(err) => (frame, Err(err)),
        }
    }

    fn coerce(&self, value: &JsonValue) -> Result<f64, PayloadError> {
        let number = match value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| PayloadError::NotNumeric(number.to_string()))?,
            JsonValue::String(text) if text == &self.rules.fault_marker => {
                return Err(PayloadError::FaultMarker(text.clone()))
            }
            JsonValue::String(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| PayloadError::NotNumeric(text.clone()))?,
            other => return Err(PayloadError::NotNumeric(other.to_string())),
        };
        if !number.is_finite() {
            return Err(PayloadError::NonFinite(value.to_string()));
        }
        Ok(number)
    }

    fn range_flags(&self, value: f64) -> RangeFlags {
        let wild = value < self.rules.allowed_min || value > self.rules.allowed_max;
        let extreme_wild =
            wild && (value < self.rules.physical_min || value > self.rules.physical_max);
        RangeFlags { wild, extreme_wild }
    }
}

/// Sender sequence: an integer `sequence` field, else the counter in `packet_id`.
fn sequence_of(object: &Map<String, JsonValue>) -> Option<u64> {
    if let Some(sequence) = object.get("sequence").and_then(JsonValue::as_u64) {
        return Some(sequence);
    }
    object
        .get("packet_id")
        .and_then(JsonValue::as_str)
        .and_then(|packet| packet.rsplit('-').next())
        .and_then(|tail| tail.parse::<u64>().ok())
}
