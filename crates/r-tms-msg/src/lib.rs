//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry wire types, broker transports and the resilient link."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Messaging primitives for R-TMS: payload schemas exchanged with devices, the
//! broker session abstraction with its MQTT and in-process backends, and the
//! [`TransportLink`] that keeps one connection alive across failures.

pub mod link;
pub mod logging;
pub mod mqtt;
pub mod qos;
pub mod transport;
pub mod types;

/// Shared result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failures raised by broker sessions and the link. Always retried, never fatal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The broker could not be reached or refused the session.
    #[error("broker connection failed: {0}")]
    Connect(String),
    /// No session is currently established.
    #[error("link is not connected")]
    NotConnected,
    /// The client rejected or could not queue a publish.
    #[error("publish to {topic} failed: {reason}")]
    Publish {
        /// Destination topic.
        topic: String,
        /// Backend specific reason.
        reason: String,
    },
    /// A subscription request failed.
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe {
        /// Requested topic filter.
        topic: String,
        /// Backend specific reason.
        reason: String,
    },
    /// The session ended before the broker acknowledged a publish.
    #[error("session closed before acknowledgement")]
    Closed,
    /// Payload could not be encoded.
    #[error("serialization error: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Encode(err.to_string())
    }
}

pub use link::{
    LinkIdentity, LinkOptions, LinkStatus, PublishOutcome, ReconnectPolicy, TransportLink,
};
pub use logging::{log_message, LinkMetricsExporter, MessageDirection};
pub use mqtt::MqttConnector;
pub use qos::{AckTracker, ProtocolVersion, QosLevel};
pub use transport::{
    topic_matches, BrokerConnector, BrokerSession, InMemoryBroker, LastWill, SessionEvent,
    SessionEvents, SessionSettings,
};
pub use types::{
    ControlAction, ControlCommand, ConnectivityStatus, DataPayload, InboundMessage,
    SensorReading, StatusPayload,
};
