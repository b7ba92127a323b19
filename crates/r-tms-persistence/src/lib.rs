//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry record storage and journaling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Storage for everything the monitor keeps: valid readings, anomalies,
//! status history, service logs and control schedules.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing the journal.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Journal written by an incompatible version.
    #[error("unsupported journal version {0}")]
    UnsupportedVersion(u16),
    /// A referenced schedule does not exist.
    #[error("schedule {0} not found")]
    ScheduleNotFound(u64),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    /// Backend refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub mod event_log;
mod journal;
pub mod metrics;
pub mod records;
pub mod store;

pub use event_log::replay as replay_event_log;
pub use event_log::{EventLogEntry, EventLogReader, EventLogWriter, JournalRecord, JOURNAL_VERSION};
pub use metrics::StoreMetrics;
pub use records::{
    AggregateStats, AnomalyKind, AnomalyRecord, MessageRecord, NewSchedule, PurgeReport,
    RecordFilter, ScheduleEntry, ServiceLogRecord, StatusRecord,
};
pub use store::{InMemoryStore, TelemetryStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_their_context() {
        let err = PersistenceError::ScheduleNotFound(7);
        assert_eq!(format!("{err}"), "schedule 7 not found");
    }
}
