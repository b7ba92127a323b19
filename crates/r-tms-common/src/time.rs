//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};

/// Capture an instant for liveness and cooldown comparisons.
///
/// Wall-clock adjustments never affect values returned here.
pub fn monotonic_now() -> Instant {
    Instant::now()
}

/// Current wall time as fractional unix seconds, the unit used on the wire.
pub fn unix_now() -> f64 {
    to_unix_seconds(Utc::now())
}

pub fn to_unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1_000_000.0
}

/// Convert fractional unix seconds back into a UTC timestamp.
///
/// Non-finite or out-of-range input yields `None`.
pub fn from_unix_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1_000_000_000.0).round() as u32;
    Utc.timestamp_opt(whole as i64, nanos.min(999_999_999)).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_seconds_round_trip_to_the_microsecond() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let seconds = to_unix_seconds(at) + 0.25;
        let back = from_unix_seconds(seconds).expect("in range");
        assert_eq!(back.timestamp(), at.timestamp());
        assert_eq!(back.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn non_finite_seconds_are_rejected() {
        assert!(from_unix_seconds(f64::NAN).is_none());
        assert!(from_unix_seconds(f64::INFINITY).is_none());
    }
}
