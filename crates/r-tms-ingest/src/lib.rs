//! ---
//! ems_section: "04-telemetry-ingestion"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry validation, reconstruction and liveness tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Ingestion side of the monitor. Raw frames are classified by the
//! [`MessageValidator`], routed by device to partition workers that own a
//! [`SequenceReconstructor`], and watched for silence by the
//! [`LivenessWatchdog`]. Anomalies found anywhere flow through the
//! [`AnomalyRegistry`].

pub mod anomaly;
pub mod frame;
pub mod pipeline;
pub mod reconstructor;
pub mod registry;
pub mod validator;
pub mod watchdog;

/// Why a payload was rejected from the valid pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload is not JSON: {0}")]
    Json(String),
    #[error("payload is not a JSON object")]
    NotObject,
    #[error("missing device_id")]
    MissingDeviceId,
    #[error("missing sensor_data object")]
    MissingSensorData,
    #[error("sensor_data has no value")]
    MissingValue,
    #[error("sensor reported fault marker {0}")]
    FaultMarker(String),
    #[error("value {0} is not numeric")]
    NotNumeric(String),
    #[error("value {0} is not finite")]
    NonFinite(String),
}

impl PayloadError {
    /// Whether the rejection is a schema problem rather than corruption.
    pub fn is_schema(&self) -> bool {
        matches!(
            self,
            PayloadError::MissingDeviceId
                | PayloadError::MissingSensorData
                | PayloadError::MissingValue
        )
    }

    /// Whether the payload got past the structural checks before failing.
    pub fn schema_ok(&self) -> bool {
        matches!(
            self,
            PayloadError::FaultMarker(_) | PayloadError::NotNumeric(_) | PayloadError::NonFinite(_)
        )
    }
}

/// Failure delivering a notification. Logged and swallowed by the registry.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification queue is full")]
    QueueFull,
    #[error("notifier has shut down")]
    Closed,
    #[error("notifier rejected the message: {0}")]
    Rejected(String),
}

pub use anomaly::{
    AnomalyRegistry, LogNotifier, Notification, NotificationKind, Notifier, NotifyOutcome,
    RecordingNotifier, WebhookNotifier, WEBHOOK_QUEUE_DEPTH,
};
pub use frame::{ClassifiedEvent, EventKind, RangeFlags, TelemetryFrame};
pub use pipeline::{IngestPipeline, PipelineHandle, TimelineUpdate};
pub use reconstructor::{
    BridgeSegment, EntryKind, GoodPoint, IngestOutcome, ReorderBufferEntry, SequenceGap,
    SequenceReconstructor, TimelinePoint,
};
pub use registry::{ActiveAlert, DeviceRegistry, DeviceSnapshot, DeviceState};
pub use validator::MessageValidator;
pub use watchdog::{LivenessEvent, LivenessWatchdog};
