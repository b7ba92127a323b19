//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry wire types, broker transports and the resilient link."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! MQTT session backend on `rumqttc`, speaking either 3.1.1 or 5.
//!
//! The client event loop runs on its own task. It stops on the first
//! connection error instead of reconnecting internally; reconnect policy
//! belongs to [`crate::TransportLink`].
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::Outgoing;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::qos::{AckTracker, ProtocolVersion, QosLevel};
use crate::transport::{BrokerConnector, BrokerSession, SessionEvent, SessionEvents, SessionSettings};
use crate::types::InboundMessage;
use crate::{Result, TransportError};

const REQUEST_CAPACITY: usize = 64;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Opens MQTT sessions against a network broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

impl MqttConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(
        &self,
        settings: &SessionSettings,
        events: SessionEvents,
    ) -> Result<Arc<dyn BrokerSession>> {
        let acks = Arc::new(AckTracker::new());
        let (ready_tx, ready_rx) = oneshot::channel();
        let pump_state = PumpState {
            acks: Arc::clone(&acks),
            events,
            ready: Some(ready_tx),
        };

        let (client, pump) = match settings.protocol {
            ProtocolVersion::V311 => {
                let (client, eventloop) =
                    rumqttc::AsyncClient::new(v311_options(settings), REQUEST_CAPACITY);
                (
                    MqttClient::V311(client),
                    tokio::spawn(pump_v311(eventloop, pump_state)),
                )
            }
            ProtocolVersion::V5 => {
                let (client, eventloop) =
                    rumqttc::v5::AsyncClient::new(v5_options(settings), REQUEST_CAPACITY);
                (
                    MqttClient::V5(client),
                    tokio::spawn(pump_v5(eventloop, pump_state)),
                )
            }
        };

        let outcome = match tokio::time::timeout(settings.connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Connect(
                "event loop ended before CONNACK".into(),
            )),
            Err(_) => Err(TransportError::Connect(format!(
                "no CONNACK from {}:{} within {:?}",
                settings.host, settings.port, settings.connect_timeout
            ))),
        };
        if let Err(err) = outcome {
            pump.abort();
            return Err(err);
        }

        debug!(
            client = %settings.client_id,
            host = %settings.host,
            port = settings.port,
            protocol = %settings.protocol,
            "mqtt session established"
        );
        Ok(Arc::new(MqttSession {
            client,
            acks,
            publish_gate: tokio::sync::Mutex::new(()),
            pump: Mutex::new(Some(pump)),
        }))
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

enum MqttClient {
    V311(rumqttc::AsyncClient),
    V5(rumqttc::v5::AsyncClient),
}

impl MqttClient {
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> std::result::Result<(), String> {
        match self {
            MqttClient::V311(client) => client
                .subscribe(filter, to_v311(qos))
                .await
                .map_err(|err| err.to_string()),
            MqttClient::V5(client) => client
                .subscribe(filter, to_v5(qos))
                .await
                .map_err(|err| err.to_string()),
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> std::result::Result<(), String> {
        match self {
            MqttClient::V311(client) => client
                .publish(topic, to_v311(qos), retain, payload)
                .await
                .map_err(|err| err.to_string()),
            MqttClient::V5(client) => client
                .publish(topic, to_v5(qos), retain, payload)
                .await
                .map_err(|err| err.to_string()),
        }
    }

    async fn disconnect(&self) -> std::result::Result<(), String> {
        match self {
            MqttClient::V311(client) => client.disconnect().await.map_err(|err| err.to_string()),
            MqttClient::V5(client) => client.disconnect().await.map_err(|err| err.to_string()),
        }
    }
}

struct MqttSession {
    client: MqttClient,
    acks: Arc<AckTracker>,
    // Packet ids are assigned in request order, so registration and enqueue must not interleave.
    publish_gate: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<()> {
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|reason| TransportError::Subscribe {
                topic: filter.to_owned(),
                reason,
            })
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<()> {
        let acked = {
            let _gate = self.publish_gate.lock().await;
            let acked = self.acks.register(qos);
            if let Err(reason) = self.client.publish(topic, payload, qos, retain).await {
                self.acks.withdraw_latest();
                return Err(TransportError::Publish {
                    topic: topic.to_owned(),
                    reason,
                });
            }
            acked
        };
        acked.await.map_err(|_| TransportError::Closed)
    }

    async fn disconnect(&self) {
        if let Err(reason) = self.client.disconnect().await {
            debug!(%reason, "mqtt disconnect request not delivered");
        }
        let pump = self.pump.lock().take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut pump).await.is_err() {
                pump.abort();
            }
        }
        self.acks.fail_all();
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

struct PumpState {
    acks: Arc<AckTracker>,
    events: SessionEvents,
    ready: Option<oneshot::Sender<Result<()>>>,
}

impl PumpState {
    fn connected(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(()));
        }
    }

    fn message(&self, topic: String, payload: Vec<u8>, qos: QosLevel, retained: bool) {
        let _ = self.events.send(SessionEvent::Message(InboundMessage {
            topic,
            payload,
            qos,
            retained,
        }));
    }

    fn acked(&self, pkid: u16) {
        self.acks.on_ack(pkid);
    }

    fn failed(&mut self, reason: String) {
        self.acks.fail_all();
        match self.ready.take() {
            Some(ready) => {
                let _ = ready.send(Err(TransportError::Connect(reason)));
            }
            None => {
                warn!(%reason, "mqtt connection lost");
                let _ = self.events.send(SessionEvent::Closed { reason });
            }
        }
    }

    fn finished(&self) {
        self.acks.fail_all();
    }
}

async fn pump_v311(mut eventloop: rumqttc::EventLoop, mut state: PumpState) {
    use rumqttc::{Event, Packet};

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => state.connected(),
            Ok(Event::Incoming(Packet::Publish(publish))) => state.message(
                publish.topic,
                publish.payload.to_vec(),
                from_v311(publish.qos),
                publish.retain,
            ),
            Ok(Event::Incoming(Packet::PubAck(ack))) => state.acked(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => state.acked(comp.pkid),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                state.failed("broker sent DISCONNECT".into());
                break;
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => state.acks.on_outgoing(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                state.finished();
                break;
            }
            Ok(_) => {}
            Err(err) => {
                state.failed(err.to_string());
                break;
            }
        }
    }
}

async fn pump_v5(mut eventloop: rumqttc::v5::EventLoop, mut state: PumpState) {
    use rumqttc::v5::mqttbytes::v5::Packet;
    use rumqttc::v5::Event;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => state.connected(),
            Ok(Event::Incoming(Packet::Publish(publish))) => state.message(
                String::from_utf8_lossy(&publish.topic).into_owned(),
                publish.payload.to_vec(),
                from_v5(publish.qos),
                publish.retain,
            ),
            Ok(Event::Incoming(Packet::PubAck(ack))) => state.acked(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => state.acked(comp.pkid),
            Ok(Event::Incoming(Packet::Disconnect(_))) => {
                state.failed("broker sent DISCONNECT".into());
                break;
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => state.acks.on_outgoing(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                state.finished();
                break;
            }
            Ok(_) => {}
            Err(err) => {
                state.failed(err.to_string());
                break;
            }
        }
    }
}

fn v311_options(settings: &SessionSettings) -> rumqttc::MqttOptions {
    let mut options =
        rumqttc::MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
    options.set_keep_alive(settings.keepalive);
    options.set_clean_session(true);
    if let Some(will) = &settings.last_will {
        options.set_last_will(rumqttc::LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            to_v311(will.qos),
            will.retain,
        ));
    }
    options
}

fn v5_options(settings: &SessionSettings) -> rumqttc::v5::MqttOptions {
    let mut options = rumqttc::v5::MqttOptions::new(
        settings.client_id.clone(),
        settings.host.clone(),
        settings.port,
    );
    options.set_keep_alive(settings.keepalive);
    options.set_clean_start(true);
    if let Some(will) = &settings.last_will {
        options.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            to_v5(will.qos),
            will.retain,
            None,
        ));
    }
    options
}

fn to_v311(qos: QosLevel) -> rumqttc::QoS {
    match qos {
        QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_v311(qos: rumqttc::QoS) -> QosLevel {
    match qos {
        rumqttc::QoS::AtMostOnce => QosLevel::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QosLevel::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QosLevel::ExactlyOnce,
    }
}

fn to_v5(qos: QosLevel) -> rumqttc::v5::mqttbytes::QoS {
    use rumqttc::v5::mqttbytes::QoS;
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_v5(qos: rumqttc::v5::mqttbytes::QoS) -> QosLevel {
    use rumqttc::v5::mqttbytes::QoS;
    match qos {
        QoS::AtMostOnce => QosLevel::AtMostOnce,
        QoS::AtLeastOnce => QosLevel::AtLeastOnce,
        QoS::ExactlyOnce => QosLevel::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_tms_common::BrokerConfig;

    #[test]
    fn qos_mapping_is_lossless() {
        for level in [
            QosLevel::AtMostOnce,
            QosLevel::AtLeastOnce,
            QosLevel::ExactlyOnce,
        ] {
            assert_eq!(from_v311(to_v311(level)), level);
            assert_eq!(from_v5(to_v5(level)), level);
        }
    }

    #[tokio::test]
    async fn refused_connection_reports_connect_error() {
        let mut settings = SessionSettings::from_config(&BrokerConfig::default());
        settings.host = "127.0.0.1".into();
        settings.port = 1;
        settings.connect_timeout = Duration::from_secs(2);
        settings.protocol = ProtocolVersion::V311;

        let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
        let result = MqttConnector::new().connect(&settings, events).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
