//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry wire types, broker transports and the resilient link."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The resilient broker link.
//!
//! A [`TransportLink`] owns at most one [`BrokerSession`] at a time. Lost
//! sessions are rebuilt with exponential backoff, every rebuild re-subscribes
//! the registered topics, and a link carrying a device identity keeps a
//! retained status announcement (plus a matching last-will) on the broker.
//!
//! Two locks guard a rebuild: the settings mutex, held for the whole
//! teardown/rebuild/reconnect, and the write half of the session lock.
//! Publishers only ever take the read half, so no publish observes a session
//! whose protocol version and QoS disagree with the settings it was built from.
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use r_tms_common::BrokerConfig;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::logging::{log_message, LinkMetricsExporter, MessageDirection};
use crate::qos::{ProtocolVersion, QosLevel};
use crate::transport::{BrokerConnector, BrokerSession, LastWill, SessionEvent, SessionSettings};
use crate::types::{ConnectivityStatus, InboundMessage, StatusPayload};
use crate::{Result, TransportError};

const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// Connection state published on the link's watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No session; a reconnect may be pending.
    Disconnected,
    /// A session is being built.
    Connecting,
    /// A session is up and subscribed.
    Connected,
    /// Taken offline on request; no automatic reconnect.
    Offline,
    /// Shut down for good.
    Closed,
}

impl LinkStatus {
    /// Lowercase label used in health output.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Connected => "connected",
            LinkStatus::Offline => "offline",
            LinkStatus::Closed => "closed",
        }
    }
}

/// Result of a publish that reached the broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker confirmed the publish at the requested QoS.
    Acknowledged,
    /// No confirmation arrived in time. The message may still have been delivered.
    Unacknowledged,
}

/// Exponential reconnect backoff: `min(max_delay, base * 2^retry)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay preceding reconnect attempt number `retry` (zero based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

/// Device identity announced on the status topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkIdentity {
    /// Announcing device.
    pub device_id: String,
    /// Device location.
    pub location: String,
    /// Topic carrying retained status announcements.
    pub status_topic: String,
}

impl LinkIdentity {
    /// Identity for `device_id` announcing on `status_topic`.
    pub fn new(
        device_id: impl Into<String>,
        location: impl Into<String>,
        status_topic: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            location: location.into(),
            status_topic: status_topic.into(),
        }
    }

    /// Wire payload announcing `status`.
    pub fn announcement(&self, status: ConnectivityStatus) -> Result<Vec<u8>> {
        StatusPayload::new(&self.device_id, &self.location, status).to_bytes()
    }
}

/// Construction parameters for a [`TransportLink`].
#[derive(Clone)]
pub struct LinkOptions {
    /// Initial session settings.
    pub settings: SessionSettings,
    /// Topic filters subscribed after every (re)connect.
    pub subscriptions: Vec<String>,
    /// Identity to announce, if this link represents a device.
    pub identity: Option<LinkIdentity>,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// How long a publish waits for its acknowledgement.
    pub ack_timeout: Duration,
    /// Capacity of the inbound message channel.
    pub inbound_capacity: usize,
    /// Optional Prometheus exporter.
    pub metrics: Option<Arc<LinkMetricsExporter>>,
}

impl LinkOptions {
    /// Options derived from the broker configuration section.
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            settings: SessionSettings::from_config(config),
            subscriptions: Vec::new(),
            identity: None,
            reconnect: ReconnectPolicy {
                base: config.reconnect_base,
                max_delay: config.reconnect_max,
            },
            ack_timeout: config.ack_timeout,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            metrics: None,
        }
    }

    /// Override the MQTT client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.settings.client_id = client_id.into();
        self
    }

    /// Register a topic filter to subscribe on every connect.
    pub fn subscribe(mut self, filter: impl Into<String>) -> Self {
        self.subscriptions.push(filter.into());
        self
    }

    /// Announce a device identity and register the matching last-will.
    pub fn with_identity(mut self, identity: LinkIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Attach a metrics exporter.
    pub fn with_metrics(mut self, metrics: Arc<LinkMetricsExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Handle to one resilient broker connection. Cheap to clone.
#[derive(Clone)]
pub struct TransportLink {
    inner: Arc<LinkInner>,
}

struct ActiveSession {
    generation: u64,
    session: Arc<dyn BrokerSession>,
    qos: QosLevel,
}

#[derive(Debug, Default)]
struct LinkState {
    retry_count: u32,
    manual_offline: bool,
    closed: bool,
    generation: u64,
    reconnect_epoch: u64,
    pending_reconnect: Option<u64>,
}

struct LinkInner {
    connector: Arc<dyn BrokerConnector>,
    settings: tokio::sync::Mutex<SessionSettings>,
    session: RwLock<Option<ActiveSession>>,
    subscriptions: Mutex<Vec<String>>,
    identity: Option<LinkIdentity>,
    policy: ReconnectPolicy,
    ack_timeout: Duration,
    state: Mutex<LinkState>,
    status: watch::Sender<LinkStatus>,
    inbound: mpsc::Sender<InboundMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    metrics: Option<Arc<LinkMetricsExporter>>,
}

impl TransportLink {
    /// Create a disconnected link. Messages on subscribed topics arrive on the returned receiver.
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        options: LinkOptions,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound, receiver) = mpsc::channel(options.inbound_capacity.max(1));
        let (status, _) = watch::channel(LinkStatus::Disconnected);
        let inner = LinkInner {
            connector,
            settings: tokio::sync::Mutex::new(options.settings),
            session: RwLock::new(None),
            subscriptions: Mutex::new(options.subscriptions),
            identity: options.identity,
            policy: options.reconnect,
            ack_timeout: options.ack_timeout,
            state: Mutex::new(LinkState::default()),
            status,
            inbound,
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            metrics: options.metrics,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Open the session. On failure a background reconnect is scheduled and the error returned.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.state.lock().closed {
            return Err(TransportError::NotConnected);
        }
        let settings = self.inner.settings.lock().await;
        match self.inner.establish(&settings).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "initial broker connect failed");
                self.inner.schedule_reconnect();
                Err(err)
            }
        }
    }

    /// Publish with the given QoS, or the session QoS when `None`.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Option<QosLevel>,
    ) -> Result<PublishOutcome> {
        self.inner.publish(topic, payload, qos, false).await
    }

    /// Publish a retained message at the session QoS.
    pub async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<PublishOutcome> {
        self.inner.publish(topic, payload, None, true).await
    }

    /// Publish this link's retained status announcement.
    pub async fn announce(&self, status: ConnectivityStatus) -> Result<PublishOutcome> {
        let identity = self
            .inner
            .identity
            .as_ref()
            .ok_or_else(|| TransportError::Encode("link has no device identity".into()))?;
        let payload = identity.announcement(status)?;
        self.inner
            .publish(&identity.status_topic, payload, None, true)
            .await
    }

    /// Swap protocol version and QoS, rebuilding the session under the settings lock.
    ///
    /// While offline the new settings are stored and applied by [`TransportLink::go_online`].
    pub async fn reconfigure(&self, version: ProtocolVersion, qos: QosLevel) -> Result<()> {
        let mut settings = self.inner.settings.lock().await;
        settings.protocol = version;
        settings.qos = qos;
        info!(protocol = %version, qos = qos.as_number(), "reconfiguring broker link");

        let (offline, closed) = {
            let state = self.inner.state.lock();
            (state.manual_offline, state.closed)
        };
        if offline || closed {
            return Ok(());
        }
        match self.inner.establish(&settings).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "rebuild after reconfigure failed");
                self.inner.schedule_reconnect();
                Err(err)
            }
        }
    }

    /// Register an additional topic filter, subscribing immediately when connected.
    pub async fn subscribe(&self, filter: &str) -> Result<()> {
        {
            let mut subscriptions = self.inner.subscriptions.lock();
            if subscriptions.iter().any(|existing| existing == filter) {
                return Ok(());
            }
            subscriptions.push(filter.to_owned());
        }
        let guard = self.inner.session.read().await;
        match guard.as_ref() {
            Some(active) => active.session.subscribe(filter, active.qos).await,
            None => Ok(()),
        }
    }

    /// Intentional disconnect: announce OFFLINE (with identity) and close the session.
    pub async fn disconnect(&self) {
        self.inner.teardown(Some(ConnectivityStatus::Offline)).await;
        if !self.inner.state.lock().manual_offline {
            self.inner.set_status(LinkStatus::Disconnected);
        }
    }

    /// Go offline on request. No reconnect happens until [`TransportLink::go_online`].
    pub async fn go_offline(&self) {
        self.inner.state.lock().manual_offline = true;
        self.inner.teardown(Some(ConnectivityStatus::Offline)).await;
        self.inner.set_status(LinkStatus::Offline);
        info!("broker link taken offline");
    }

    /// Leave manual offline mode and connect.
    pub async fn go_online(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(TransportError::NotConnected);
            }
            state.manual_offline = false;
        }
        if self.is_connected().await {
            return Ok(());
        }
        self.inner.set_status(LinkStatus::Disconnected);
        self.connect().await
    }

    /// Disconnect, stop background tasks and wait for them.
    pub async fn shutdown(&self) {
        self.inner.state.lock().closed = true;
        self.inner.teardown(Some(ConnectivityStatus::Offline)).await;
        self.inner.shutdown.cancel();
        self.inner.set_status(LinkStatus::Closed);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "link task ended abnormally");
                }
            }
        }
        debug!("broker link shut down");
    }

    /// Current status.
    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    /// Watch status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    /// Whether a session is currently established.
    pub async fn is_connected(&self) -> bool {
        self.inner.session.read().await.is_some()
    }

    /// Protocol version and QoS currently configured.
    pub async fn settings(&self) -> (ProtocolVersion, QosLevel) {
        let settings = self.inner.settings.lock().await;
        (settings.protocol, settings.qos)
    }

    /// Identity announced by this link, if any.
    pub fn identity(&self) -> Option<&LinkIdentity> {
        self.inner.identity.as_ref()
    }

    /// Consecutive failed reconnect attempts since the last successful connect.
    pub fn retry_count(&self) -> u32 {
        self.inner.state.lock().retry_count
    }
}

impl LinkInner {
    fn set_status(&self, status: LinkStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(from = ?previous, to = ?status, "link status changed");
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn session_settings(&self, base: &SessionSettings) -> Result<SessionSettings> {
        let mut settings = base.clone();
        if let Some(identity) = &self.identity {
            settings.last_will = Some(LastWill {
                topic: identity.status_topic.clone(),
                payload: identity.announcement(ConnectivityStatus::Offline)?,
                qos: base.qos,
                retain: true,
            });
        }
        Ok(settings)
    }

    /// Tear down any current session and build a new one. Callers hold the settings lock.
    async fn establish(self: &Arc<Self>, settings: &SessionSettings) -> Result<()> {
        let session_settings = self.session_settings(settings)?;
        self.set_status(LinkStatus::Connecting);
        let mut slot = self.session.write().await;
        if let Some(previous) = slot.take() {
            previous.session.disconnect().await;
        }
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.generation
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = match self.connector.connect(&session_settings, events_tx).await {
            Ok(session) => session,
            Err(err) => {
                self.set_status(LinkStatus::Disconnected);
                return Err(err);
            }
        };

        let filters = self.subscriptions.lock().clone();
        for filter in &filters {
            if let Err(err) = session.subscribe(filter, settings.qos).await {
                session.disconnect().await;
                self.set_status(LinkStatus::Disconnected);
                return Err(err);
            }
        }

        if let Some(identity) = &self.identity {
            let payload = identity.announcement(ConnectivityStatus::Online)?;
            let announce = session.publish(&identity.status_topic, payload, settings.qos, true);
            match tokio::time::timeout(self.ack_timeout, announce).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(device = %identity.device_id, error = %err, "online announcement failed"),
                Err(_) => debug!(device = %identity.device_id, "online announcement unacknowledged"),
            }
        }

        *slot = Some(ActiveSession {
            generation,
            session,
            qos: settings.qos,
        });
        {
            let mut state = self.state.lock();
            state.retry_count = 0;
            state.pending_reconnect = None;
        }
        drop(slot);

        self.spawn_forwarder(generation, events_rx);
        self.set_status(LinkStatus::Connected);
        info!(
            connector = self.connector.name(),
            client = %settings.client_id,
            protocol = %settings.protocol,
            qos = settings.qos.as_number(),
            subscriptions = filters.len(),
            "broker session established"
        );
        Ok(())
    }

    fn spawn_forwarder(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(SessionEvent::Message(message)) => inner.deliver(message).await,
                    Some(SessionEvent::Closed { reason }) => {
                        inner.on_session_closed(generation, reason).await;
                        break;
                    }
                    None => break,
                }
            }
        });
        self.track(handle);
    }

    async fn deliver(&self, message: InboundMessage) {
        let direction = if message.retained {
            MessageDirection::Replay
        } else {
            MessageDirection::Inbound
        };
        log_message(direction, &message.topic, message.qos, &message.payload);
        if let Some(metrics) = &self.metrics {
            metrics.observe_received();
        }
        let delivered = tokio::select! {
            _ = self.shutdown.cancelled() => false,
            sent = self.inbound.send(message) => sent.is_ok(),
        };
        if !delivered {
            if let Some(metrics) = &self.metrics {
                metrics.observe_dropped();
            }
        }
    }

    async fn on_session_closed(self: &Arc<Self>, generation: u64, reason: String) {
        {
            let mut slot = self.session.write().await;
            let current = slot.as_ref().map(|active| active.generation);
            if current != Some(generation) {
                return;
            }
            *slot = None;
        }
        warn!(%reason, "broker session lost");
        let (offline, closed) = {
            let state = self.state.lock();
            (state.manual_offline, state.closed)
        };
        if closed {
            return;
        }
        if offline {
            self.set_status(LinkStatus::Offline);
            return;
        }
        self.set_status(LinkStatus::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let epoch = {
            let mut state = self.state.lock();
            if state.closed || state.manual_offline || state.pending_reconnect.is_some() {
                return;
            }
            state.reconnect_epoch += 1;
            state.pending_reconnect = Some(state.reconnect_epoch);
            state.reconnect_epoch
        };
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.reconnect_loop(epoch).await });
        self.track(handle);
    }

    fn reconnect_wanted(&self, epoch: u64) -> bool {
        let state = self.state.lock();
        !state.closed && !state.manual_offline && state.pending_reconnect == Some(epoch)
    }

    async fn reconnect_loop(self: Arc<Self>, epoch: u64) {
        loop {
            let retry = self.state.lock().retry_count;
            let delay = self.policy.delay_for(retry);
            info!(attempt = retry + 1, delay_ms = delay.as_millis() as u64, "scheduling broker reconnect");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let settings = self.settings.lock().await;
            if !self.reconnect_wanted(epoch) {
                return;
            }
            if self.session.read().await.is_some() {
                break;
            }
            if let Some(metrics) = &self.metrics {
                metrics.observe_reconnect();
            }
            match self.establish(&settings).await {
                Ok(()) => return,
                Err(err) => {
                    let mut state = self.state.lock();
                    state.retry_count = state.retry_count.saturating_add(1);
                    warn!(attempt = state.retry_count, error = %err, "broker reconnect failed");
                }
            }
        }
        let mut state = self.state.lock();
        if state.pending_reconnect == Some(epoch) {
            state.pending_reconnect = None;
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Option<QosLevel>,
        retain: bool,
    ) -> Result<PublishOutcome> {
        let guard = self.session.read().await;
        let active = guard.as_ref().ok_or(TransportError::NotConnected)?;
        let qos = qos.unwrap_or(active.qos);
        log_message(MessageDirection::Outbound, topic, qos, &payload);

        let started = Instant::now();
        let publish = active.session.publish(topic, payload, qos, retain);
        match tokio::time::timeout(self.ack_timeout, publish).await {
            Ok(Ok(())) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_published(started.elapsed());
                }
                Ok(PublishOutcome::Acknowledged)
            }
            Ok(Err(TransportError::Closed)) | Err(_) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_unacknowledged();
                }
                debug!(%topic, qos = qos.as_number(), "publish unacknowledged");
                Ok(PublishOutcome::Unacknowledged)
            }
            Ok(Err(err)) => Err(err),
        }
    }

    /// Close the current session, announcing `final_status` first when the link has an identity.
    async fn teardown(&self, final_status: Option<ConnectivityStatus>) {
        let settings = self.settings.lock().await;
        let mut slot = self.session.write().await;
        self.state.lock().pending_reconnect = None;
        let Some(active) = slot.take() else {
            return;
        };
        if let (Some(identity), Some(status)) = (&self.identity, final_status) {
            match identity.announcement(status) {
                Ok(payload) => {
                    let announce =
                        active
                            .session
                            .publish(&identity.status_topic, payload, settings.qos, true);
                    match tokio::time::timeout(self.ack_timeout, announce).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!(device = %identity.device_id, error = %err, "final announcement failed"),
                        Err(_) => debug!(device = %identity.device_id, "final announcement unacknowledged"),
                    }
                }
                Err(err) => warn!(error = %err, "could not encode final announcement"),
            }
        }
        active.session.disconnect().await;
        debug!(client = %settings.client_id, "broker session closed");
    }
}
