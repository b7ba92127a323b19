//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Wraps generated samples into device data payloads."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Local, Utc};
use r_tms_msg::types::{DEFAULT_READING_TYPE, DEFAULT_UNITS};
use r_tms_msg::{DataPayload, SensorReading};

use crate::generator::Sample;

/// Numbers packets `{device_id}-{n}` starting at 1.
#[derive(Debug, Clone)]
pub struct MessagePackager {
    device_id: String,
    location: String,
    counter: u64,
}

impl MessagePackager {
    pub fn new(device_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            location: location.into(),
            counter: 0,
        }
    }

    /// Packets produced so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn package(&mut self, sample: Sample) -> DataPayload {
        self.package_at(sample, Utc::now())
    }

    pub fn package_at(&mut self, sample: Sample, now: DateTime<Utc>) -> DataPayload {
        self.counter += 1;
        DataPayload {
            packet_id: format!("{}-{}", self.device_id, self.counter),
            timestamp: now.timestamp_micros() as f64 / 1_000_000.0,
            datetime: Some(
                now.with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            ),
            device_id: self.device_id.clone(),
            location: Some(self.location.clone()),
            sensor_data: SensorReading {
                value: sample.to_json(),
                units: Some(DEFAULT_UNITS.to_owned()),
                reading_type: Some(DEFAULT_READING_TYPE.to_owned()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::CorruptValue;
    use chrono::TimeZone;

    #[test]
    fn packets_are_numbered_per_device() {
        let mut packager = MessagePackager::new("dev001", "Library");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let first = packager.package_at(Sample::Normal(21.25), at);
        let second = packager.package_at(Sample::Normal(21.5), at);
        assert_eq!(first.packet_id, "dev001-1");
        assert_eq!(second.packet_id, "dev001-2");
        assert_eq!(first.timestamp, 1_709_294_400.0);
        assert_eq!(packager.counter(), 2);

        let json: serde_json::Value =
            serde_json::from_slice(&first.to_bytes().unwrap()).unwrap();
        assert_eq!(json["sensor_data"]["value"], 21.25);
        assert_eq!(json["sensor_data"]["units"], "celsius");
        assert_eq!(json["sensor_data"]["reading_type"], "temperature");
        assert_eq!(json["location"], "Library");
    }

    #[test]
    fn corrupt_samples_keep_their_raw_value() {
        let mut packager = MessagePackager::new("dev002", "Engineering Lab");
        let payload = packager.package(Sample::Corrupt(CorruptValue::SensorFault));
        assert_eq!(payload.sensor_data.value, "SENSOR_FAULT");
    }
}
