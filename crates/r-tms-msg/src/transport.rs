//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry wire types, broker transports and the resilient link."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use r_tms_common::BrokerConfig;
use tokio::sync::mpsc;
use tracing::debug;

use crate::qos::{ProtocolVersion, QosLevel};
use crate::types::InboundMessage;
use crate::{Result, TransportError};

/// Message the broker publishes on behalf of a client that vanishes.
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    /// Destination topic.
    pub topic: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Delivery QoS.
    pub qos: QosLevel,
    /// Whether the broker retains the will.
    pub retain: bool,
}

/// Everything a connector needs to open one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// MQTT client identifier.
    pub client_id: String,
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Keepalive interval.
    pub keepalive: Duration,
    /// Protocol revision.
    pub protocol: ProtocolVersion,
    /// Default QoS for subscriptions and publishes.
    pub qos: QosLevel,
    /// Upper bound for the CONNECT/CONNACK exchange.
    pub connect_timeout: Duration,
    /// Optional last-will registration.
    pub last_will: Option<LastWill>,
}

impl SessionSettings {
    /// Settings derived from the broker configuration section.
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            host: config.host.clone(),
            port: config.port,
            keepalive: config.keepalive,
            protocol: ProtocolVersion::from_number(config.protocol_version),
            qos: QosLevel::from_number(config.qos),
            connect_timeout: config.connect_timeout,
            last_will: None,
        }
    }
}

/// Asynchronous notifications raised by an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A message arrived on a subscribed topic.
    Message(InboundMessage),
    /// The session ended without the owner asking for it.
    Closed {
        /// Backend specific reason.
        reason: String,
    },
}

/// Sink a session reports its events into.
pub type SessionEvents = mpsc::UnboundedSender<SessionEvent>;

/// One live connection to a broker.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<()>;
    /// Publish and wait for the broker acknowledgement required by `qos`.
    ///
    /// Returns [`TransportError::Closed`] when the session ends before the ack.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QosLevel, retain: bool)
        -> Result<()>;
    /// Clean disconnect. The broker does not publish the last-will.
    async fn disconnect(&self);
    /// Backend name for logs and metrics.
    fn name(&self) -> &'static str;
}

/// Factory for broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a session; unsolicited events are reported on `events`.
    async fn connect(
        &self,
        settings: &SessionSettings,
        events: SessionEvents,
    ) -> Result<Arc<dyn BrokerSession>>;
    /// Backend name for logs and metrics.
    fn name(&self) -> &'static str;
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// In-process broker used by tests and single-process deployments.
///
/// Supports retained messages, last-will on severed clients, wildcard
/// subscriptions, unreachable-broker simulation and delayed acknowledgements.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    reachable: bool,
    ack_delay: Duration,
    next_session: u64,
    connect_attempts: u64,
    sessions: HashMap<u64, SessionEntry>,
    retained: BTreeMap<String, Vec<u8>>,
    history: Vec<InboundMessage>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            ack_delay: Duration::ZERO,
            next_session: 0,
            connect_attempts: 0,
            sessions: HashMap::new(),
            retained: BTreeMap::new(),
            history: Vec::new(),
        }
    }
}

struct SessionEntry {
    client_id: String,
    protocol: ProtocolVersion,
    subscriptions: Vec<(String, QosLevel)>,
    last_will: Option<LastWill>,
    events: SessionEvents,
}

impl BrokerState {
    fn route(&mut self, topic: &str, payload: &[u8], qos: QosLevel, retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_owned(), payload.to_vec());
            }
        }
        self.history.push(InboundMessage {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            qos,
            retained: retain,
        });
        for session in self.sessions.values() {
            let granted = session
                .subscriptions
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, sub_qos)| *sub_qos)
                .max();
            if let Some(sub_qos) = granted {
                let _ = session.events.send(SessionEvent::Message(InboundMessage {
                    topic: topic.to_owned(),
                    payload: payload.to_vec(),
                    qos: qos.min(sub_qos),
                    retained: false,
                }));
            }
        }
    }

    fn drop_session(&mut self, id: u64, reason: &str, publish_will: bool) {
        if let Some(entry) = self.sessions.remove(&id) {
            let _ = entry.events.send(SessionEvent::Closed {
                reason: reason.to_owned(),
            });
            if publish_will {
                if let Some(will) = entry.last_will {
                    self.route(&will.topic, &will.payload, will.qos, will.retain);
                }
            }
        }
    }
}

impl InMemoryBroker {
    /// Create a reachable broker with immediate acknowledgements.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle whether new connection attempts succeed.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Delay applied before acknowledging QoS 1/2 publishes.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.state.lock().ack_delay = delay;
    }

    /// Drop every session of `client_id` as if the network failed, publishing
    /// their last-will. Returns whether anything was severed.
    pub fn sever(&self, client_id: &str) -> bool {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .sessions
            .iter()
            .filter(|(_, entry)| entry.client_id == client_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            state.drop_session(*id, "connection severed", true);
        }
        !ids.is_empty()
    }

    /// Publish from outside any session, e.g. a device under test.
    pub fn publish_raw(&self, topic: &str, payload: impl Into<Vec<u8>>, retain: bool) {
        let payload = payload.into();
        self.state
            .lock()
            .route(topic, &payload, QosLevel::AtLeastOnce, retain);
    }

    /// Retained payload currently stored for `topic`.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Every message routed so far whose topic matches `filter`.
    pub fn history(&self, filter: &str) -> Vec<InboundMessage> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|message| topic_matches(filter, &message.topic))
            .cloned()
            .collect()
    }

    /// Number of connection attempts, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    /// Whether `client_id` currently holds a session.
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state
            .lock()
            .sessions
            .values()
            .any(|entry| entry.client_id == client_id)
    }

    /// Protocol negotiated by the current session of `client_id`.
    pub fn session_protocol(&self, client_id: &str) -> Option<ProtocolVersion> {
        self.state
            .lock()
            .sessions
            .values()
            .find(|entry| entry.client_id == client_id)
            .map(|entry| entry.protocol)
    }

    /// Filters and granted QoS of the current session of `client_id`.
    pub fn subscriptions(&self, client_id: &str) -> Vec<(String, QosLevel)> {
        self.state
            .lock()
            .sessions
            .values()
            .find(|entry| entry.client_id == client_id)
            .map(|entry| entry.subscriptions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(
        &self,
        settings: &SessionSettings,
        events: SessionEvents,
    ) -> Result<Arc<dyn BrokerSession>> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(TransportError::Connect(format!(
                "{}:{} unreachable",
                settings.host, settings.port
            )));
        }
        let taken_over: Vec<u64> = state
            .sessions
            .iter()
            .filter(|(_, entry)| entry.client_id == settings.client_id)
            .map(|(id, _)| *id)
            .collect();
        for id in taken_over {
            state.drop_session(id, "session taken over", false);
        }
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            SessionEntry {
                client_id: settings.client_id.clone(),
                protocol: settings.protocol,
                subscriptions: Vec::new(),
                last_will: settings.last_will.clone(),
                events,
            },
        );
        debug!(client = %settings.client_id, session = id, protocol = %settings.protocol, "in-memory session opened");
        Ok(Arc::new(InMemorySession {
            broker: self.clone(),
            id,
        }))
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

struct InMemorySession {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<()> {
        let mut state = self.broker.state.lock();
        let replay: Vec<(String, Vec<u8>)> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(topic, payload)| (topic.clone(), payload.clone()))
            .collect();
        let entry = state
            .sessions
            .get_mut(&self.id)
            .ok_or(TransportError::NotConnected)?;
        entry.subscriptions.retain(|(existing, _)| existing != filter);
        entry.subscriptions.push((filter.to_owned(), qos));
        for (topic, payload) in replay {
            let _ = entry.events.send(SessionEvent::Message(InboundMessage {
                topic,
                payload,
                qos,
                retained: true,
            }));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<()> {
        let delay = {
            let mut state = self.broker.state.lock();
            if !state.sessions.contains_key(&self.id) {
                return Err(TransportError::NotConnected);
            }
            state.route(topic, &payload, qos, retain);
            state.ack_delay
        };
        if qos == QosLevel::AtMostOnce || delay.is_zero() {
            return Ok(());
        }
        tokio::time::sleep(delay).await;
        if self.broker.state.lock().sessions.contains_key(&self.id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    async fn disconnect(&self) {
        self.broker.state.lock().sessions.remove(&self.id);
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(client_id: &str) -> SessionSettings {
        let mut settings = SessionSettings::from_config(&BrokerConfig::default());
        settings.client_id = client_id.to_owned();
        settings
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> InboundMessage {
        match rx.recv().await {
            Some(SessionEvent::Message(message)) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn wildcard_filters_follow_mqtt_rules() {
        assert!(topic_matches("group_1/temp", "group_1/temp"));
        assert!(topic_matches("group_1/+", "group_1/status"));
        assert!(topic_matches("group_1/control/#", "group_1/control/dev001"));
        assert!(topic_matches("group_1/#", "group_1"));
        assert!(!topic_matches("group_1/+", "group_1/control/dev001"));
        assert!(!topic_matches("group_1/temp", "group_1/temperature"));
    }

    #[tokio::test]
    async fn retained_status_is_replayed_to_late_subscribers() {
        let broker = InMemoryBroker::new();
        broker.publish_raw("group_1/status", br#"{"status":"ONLINE"}"#.to_vec(), true);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = broker.connect(&settings("observer"), tx).await.expect("connect");
        session
            .subscribe("group_1/status", QosLevel::AtLeastOnce)
            .await
            .expect("subscribe");

        let message = next_message(&mut rx).await;
        assert!(message.retained);
        assert_eq!(message.topic, "group_1/status");

        broker.publish_raw("group_1/status", Vec::new(), true);
        assert!(broker.retained("group_1/status").is_none());
    }

    #[tokio::test]
    async fn severed_client_triggers_its_last_will() {
        let broker = InMemoryBroker::new();
        let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
        let observer = broker
            .connect(&settings("observer"), observer_tx)
            .await
            .expect("observer");
        observer
            .subscribe("group_1/status", QosLevel::AtLeastOnce)
            .await
            .expect("subscribe");

        let mut device = settings("dev001");
        device.last_will = Some(LastWill {
            topic: "group_1/status".into(),
            payload: b"OFFLINE".to_vec(),
            qos: QosLevel::AtLeastOnce,
            retain: true,
        });
        let (device_tx, mut device_rx) = mpsc::unbounded_channel();
        let _session = broker.connect(&device, device_tx).await.expect("device");

        assert!(broker.sever("dev001"));
        assert!(matches!(
            device_rx.recv().await,
            Some(SessionEvent::Closed { .. })
        ));
        let will = next_message(&mut observer_rx).await;
        assert_eq!(will.payload, b"OFFLINE");
        assert_eq!(broker.retained("group_1/status"), Some(b"OFFLINE".to_vec()));
    }

    #[tokio::test]
    async fn unreachable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = broker.connect(&settings("dev002"), tx).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn reconnecting_client_takes_over_its_session() {
        let broker = InMemoryBroker::new();
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let first = broker.connect(&settings("dev003"), first_tx).await.expect("first");
        let (second_tx, _second_rx) = mpsc::unbounded_channel();
        let _second = broker.connect(&settings("dev003"), second_tx).await.expect("second");

        assert!(matches!(
            first_rx.recv().await,
            Some(SessionEvent::Closed { .. })
        ));
        let stale = first
            .publish("group_1/temp", b"{}".to_vec(), QosLevel::AtLeastOnce, false)
            .await;
        assert_eq!(stale, Err(TransportError::NotConnected));
    }
}
