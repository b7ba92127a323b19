//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry wire types, broker transports and the resilient link."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Delivery guarantees supported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum QosLevel {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible.
    #[default]
    AtLeastOnce,
    /// Four-way handshake, no duplicates.
    ExactlyOnce,
}

impl QosLevel {
    /// Numeric QoS; anything outside 0..=2 falls back to at-most-once.
    pub fn from_number(value: u8) -> Self {
        match value {
            1 => QosLevel::AtLeastOnce,
            2 => QosLevel::ExactlyOnce,
            _ => QosLevel::AtMostOnce,
        }
    }

    /// Numeric wire value.
    pub fn as_number(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl From<u8> for QosLevel {
    fn from(value: u8) -> Self {
        QosLevel::from_number(value)
    }
}

impl From<QosLevel> for u8 {
    fn from(value: QosLevel) -> Self {
        value.as_number()
    }
}

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_number())
    }
}

/// MQTT protocol revision spoken by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ProtocolVersion {
    /// MQTT 3.1.1.
    V311,
    /// MQTT 5.
    #[default]
    V5,
}

impl ProtocolVersion {
    /// `5` selects MQTT 5; every other value selects 3.1.1.
    pub fn from_number(value: u8) -> Self {
        if value == 5 {
            ProtocolVersion::V5
        } else {
            ProtocolVersion::V311
        }
    }

    /// Numeric form used in configuration and control payloads.
    pub fn as_number(self) -> u8 {
        match self {
            ProtocolVersion::V311 => 3,
            ProtocolVersion::V5 => 5,
        }
    }
}

impl From<u8> for ProtocolVersion {
    fn from(value: u8) -> Self {
        ProtocolVersion::from_number(value)
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(value: ProtocolVersion) -> Self {
        value.as_number()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V311 => f.write_str("3.1.1"),
            ProtocolVersion::V5 => f.write_str("5"),
        }
    }
}

/// Correlates client publishes with broker acknowledgements.
///
/// The MQTT client assigns packet ids inside its event loop, in the order the
/// requests were queued. Publishes are registered in that same order, bound to a
/// packet id when the event loop reports the outgoing packet, and completed on
/// PUBACK/PUBCOMP. QoS 0 publishes complete as soon as they are written.
#[derive(Debug, Default)]
pub struct AckTracker {
    state: Mutex<AckState>,
}

#[derive(Debug, Default)]
struct AckState {
    queued: VecDeque<PendingAck>,
    inflight: HashMap<u16, PendingAck>,
}

#[derive(Debug)]
struct PendingAck {
    qos: QosLevel,
    registered_at: Instant,
    done: oneshot::Sender<()>,
}

impl AckTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a publish about to be queued. The receiver resolves on acknowledgement and
    /// errors if the session ends first.
    pub fn register(&self, qos: QosLevel) -> oneshot::Receiver<()> {
        let (done, receiver) = oneshot::channel();
        self.state.lock().queued.push_back(PendingAck {
            qos,
            registered_at: Instant::now(),
            done,
        });
        receiver
    }

    /// Forget the most recent registration after the client refused to queue it.
    pub fn withdraw_latest(&self) {
        self.state.lock().queued.pop_back();
    }

    /// The event loop wrote a publish with this packet id.
    pub fn on_outgoing(&self, pkid: u16) {
        let mut guard = self.state.lock();
        let Some(pending) = guard.queued.pop_front() else {
            return;
        };
        if pending.qos == QosLevel::AtMostOnce {
            let _ = pending.done.send(());
        } else {
            guard.inflight.insert(pkid, pending);
        }
    }

    /// The broker acknowledged a packet id. Returns the time since registration.
    pub fn on_ack(&self, pkid: u16) -> Option<std::time::Duration> {
        let pending = self.state.lock().inflight.remove(&pkid)?;
        let elapsed = pending.registered_at.elapsed();
        let _ = pending.done.send(());
        Some(elapsed)
    }

    /// Number of publishes still awaiting an outcome.
    pub fn pending(&self) -> usize {
        let guard = self.state.lock();
        guard.queued.len() + guard.inflight.len()
    }

    /// Drop every pending publish; waiting callers observe the session ending.
    pub fn fail_all(&self) {
        let mut guard = self.state.lock();
        guard.queued.clear();
        guard.inflight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_numbers_normalise() {
        assert_eq!(QosLevel::from_number(2), QosLevel::ExactlyOnce);
        assert_eq!(QosLevel::from_number(3), QosLevel::AtMostOnce);
        assert_eq!(ProtocolVersion::from_number(5), ProtocolVersion::V5);
        assert_eq!(ProtocolVersion::from_number(4), ProtocolVersion::V311);
        assert_eq!(ProtocolVersion::V311.to_string(), "3.1.1");
    }

    #[test]
    fn at_most_once_completes_when_written() {
        let tracker = AckTracker::new();
        let mut receiver = tracker.register(QosLevel::AtMostOnce);
        tracker.on_outgoing(0);
        assert!(receiver.try_recv().is_ok());
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn acks_are_matched_by_packet_id_in_queue_order() {
        let tracker = AckTracker::new();
        let mut first = tracker.register(QosLevel::AtLeastOnce);
        let mut second = tracker.register(QosLevel::AtLeastOnce);
        tracker.on_outgoing(7);
        tracker.on_outgoing(8);

        assert!(tracker.on_ack(8).is_some());
        assert!(second.try_recv().is_ok());
        assert!(first.try_recv().is_err(), "first still awaiting its ack");

        assert!(tracker.on_ack(7).is_some());
        assert!(first.try_recv().is_ok());
        assert!(tracker.on_ack(7).is_none(), "duplicate acks are ignored");
    }

    #[test]
    fn failing_all_releases_waiters() {
        let tracker = AckTracker::new();
        let mut queued = tracker.register(QosLevel::ExactlyOnce);
        let mut withdrawn = tracker.register(QosLevel::AtLeastOnce);
        tracker.withdraw_latest();
        assert!(matches!(
            withdrawn.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));

        tracker.fail_all();
        assert!(matches!(
            queued.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert_eq!(tracker.pending(), 0);
    }
}
