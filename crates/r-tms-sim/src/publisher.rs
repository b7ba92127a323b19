//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated temperature device publishing over the broker link."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! A simulated device: one [`TransportLink`] with a device identity, a
//! producer loop at the publish interval, and a control subscription on
//! `{control}/{device_id}`.
//!
//! The producer models an unreliable sender. Each cycle may be skipped on
//! its own (miss rate) or start a blackout burst that skips several cycles.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rand::prelude::*;
use r_tms_common::{AppConfig, BlackoutConfig};
use r_tms_msg::{
    BrokerConnector, ConnectivityStatus, ControlAction, ControlCommand, InboundMessage,
    LinkIdentity, LinkOptions, ProtocolVersion, PublishOutcome, QosLevel, TransportLink,
};
use r_tms_rt::{CancellationToken, RateLimiter, TaskGroup, TaskReport};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::generator::SignalGenerator;
use crate::packager::MessagePackager;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What the transmit model decided for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDecision {
    Transmit,
    /// A single dropped transmission.
    Missed,
    /// A blackout began; this cycle and the next `remaining` are skipped.
    BlackoutStarted { remaining: u32 },
    /// Inside a blackout.
    Blackout { remaining: u32 },
}

/// Miss-rate and blackout model, seeded for reproducible runs.
#[derive(Debug)]
pub struct TransmitModel {
    miss_rate: f64,
    blackout: BlackoutConfig,
    remaining: u32,
    rng: StdRng,
}

impl TransmitModel {
    pub fn new(miss_rate: f64, blackout: BlackoutConfig, seed: u64) -> Self {
        Self {
            miss_rate,
            blackout,
            remaining: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn decide(&mut self) -> CycleDecision {
        if self.remaining > 0 {
            self.remaining -= 1;
            return CycleDecision::Blackout {
                remaining: self.remaining,
            };
        }
        if self.rng.gen::<f64>() < self.miss_rate {
            return CycleDecision::Missed;
        }
        if self.rng.gen::<f64>() < self.blackout.chance {
            let (low, high) = (self.blackout.min, self.blackout.max.max(self.blackout.min));
            self.remaining = self.rng.gen_range(low..=high);
            return CycleDecision::BlackoutStarted {
                remaining: self.remaining,
            };
        }
        CycleDecision::Transmit
    }
}

/// Result of one producer cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Published {
        packet_id: String,
        outcome: PublishOutcome,
    },
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Stopped,
    NotConnected,
    Missed,
    Blackout,
}

struct Inner {
    device_id: String,
    link: TransportLink,
    data_topic: String,
    running: AtomicBool,
    generator: Mutex<SignalGenerator>,
    packager: Mutex<MessagePackager>,
    model: Mutex<TransmitModel>,
    published: AtomicU64,
}

impl Inner {
    async fn cycle(&self) -> CycleOutcome {
        if !self.running.load(Ordering::SeqCst) {
            return CycleOutcome::Skipped(SkipReason::Stopped);
        }
        if !self.link.is_connected().await {
            debug!(device = %self.device_id, "not connected; skipping cycle");
            return CycleOutcome::Skipped(SkipReason::NotConnected);
        }
        let decision = self.model.lock().decide();
        match decision {
            CycleDecision::Transmit => {}
            CycleDecision::Missed => {
                debug!(device = %self.device_id, "simulated single missed transmission");
                return CycleOutcome::Skipped(SkipReason::Missed);
            }
            CycleDecision::BlackoutStarted { remaining } => {
                info!(device = %self.device_id, remaining, "blackout started");
                return CycleOutcome::Skipped(SkipReason::Blackout);
            }
            CycleDecision::Blackout { remaining } => {
                if remaining == 0 {
                    info!(device = %self.device_id, "blackout ended");
                }
                return CycleOutcome::Skipped(SkipReason::Blackout);
            }
        }

        let sample = self.generator.lock().next_sample();
        let payload = self.packager.lock().package(sample);
        let bytes = match payload.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => return CycleOutcome::Failed(err.to_string()),
        };
        match self.link.publish(&self.data_topic, bytes, None).await {
            Ok(outcome) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                if outcome == PublishOutcome::Unacknowledged {
                    warn!(device = %self.device_id, packet = %payload.packet_id, "publish not acknowledged");
                } else {
                    debug!(device = %self.device_id, packet = %payload.packet_id, kind = sample.label(), "published");
                }
                CycleOutcome::Published {
                    packet_id: payload.packet_id,
                    outcome,
                }
            }
            Err(err) => {
                warn!(device = %self.device_id, error = %err, "publish failed");
                CycleOutcome::Failed(err.to_string())
            }
        }
    }

    async fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        let status = if running {
            ConnectivityStatus::Online
        } else {
            ConnectivityStatus::Stopped
        };
        if let Err(err) = self.link.announce(status).await {
            warn!(device = %self.device_id, status = %status, error = %err, "status announcement failed");
        }
        info!(device = %self.device_id, status = %status, "publishing state changed");
    }

    async fn apply(&self, command: ControlCommand) {
        if command.device_id != self.device_id {
            debug!(device = %self.device_id, target = %command.device_id, "ignoring command for another device");
            return;
        }
        match command.known_action() {
            Some(ControlAction::Pause) => self.set_running(false).await,
            Some(ControlAction::Resume) => self.set_running(true).await,
            Some(ControlAction::Shutdown) => {
                self.running.store(false, Ordering::SeqCst);
                info!(device = %self.device_id, "remote shutdown requested");
                self.link.go_offline().await;
            }
            Some(ControlAction::Reconfig) => {
                let (version, qos) = self.link.settings().await;
                let version = command.version.unwrap_or(version);
                let qos = command.qos.unwrap_or(qos);
                match self.link.reconfigure(version, qos).await {
                    Ok(()) => info!(device = %self.device_id, version = %version, qos = %qos, "link reconfigured"),
                    Err(err) => warn!(device = %self.device_id, error = %err, "reconfigure failed"),
                }
            }
            None => warn!(device = %self.device_id, action = %command.action, "unknown control action"),
        }
    }
}

/// Simulated device bound to one broker link.
pub struct DevicePublisher {
    inner: Arc<Inner>,
    tasks: Mutex<Option<TaskGroup>>,
    token: CancellationToken,
}

impl DevicePublisher {
    /// Build a publisher for a device listed in `config.devices`.
    ///
    /// The producer and control loops start immediately but nothing is
    /// published until [`DevicePublisher::connect`] and [`DevicePublisher::start`].
    pub fn new(
        config: &AppConfig,
        device_id: &str,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self> {
        let location = config
            .device_location(device_id)
            .ok_or_else(|| anyhow!("unknown device {device_id}; add it under [devices]"))?
            .to_owned();
        let control_topic = config.topics.control_for(device_id);
        let options = LinkOptions::from_config(&config.broker)
            .with_client_id(publisher_client_id(device_id))
            .with_identity(LinkIdentity::new(
                device_id,
                &location,
                config.topics.status_for(device_id),
            ))
            .subscribe(control_topic.clone());
        let (link, inbound) = TransportLink::new(connector, options);

        let publisher = &config.publisher;
        let seed = publisher.seed ^ device_seed(device_id);
        let inner = Arc::new(Inner {
            device_id: device_id.to_owned(),
            link,
            data_topic: config.topics.data.clone(),
            running: AtomicBool::new(false),
            generator: Mutex::new(SignalGenerator::new(publisher.generator.clone(), seed)),
            packager: Mutex::new(MessagePackager::new(device_id, &location)),
            model: Mutex::new(TransmitModel::new(
                publisher.miss_rate,
                publisher.blackout.clone(),
                seed.rotate_left(17),
            )),
            published: AtomicU64::new(0),
        });

        let token = CancellationToken::new();
        let mut tasks = TaskGroup::with_token(token.clone());
        tasks.spawn(
            format!("producer-{device_id}"),
            run_producer(inner.clone(), config.timing.publish_interval, token.clone()),
        );
        tasks.spawn(
            format!("control-{device_id}"),
            run_control(inner.clone(), inbound, token.clone()),
        );
        info!(device = device_id, location = %location, control = %control_topic, "device publisher created");

        Ok(Self {
            inner,
            tasks: Mutex::new(Some(tasks)),
            token,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn link(&self) -> &TransportLink {
        &self.inner.link
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Packets published since creation.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Connect the link. Failure is logged and retried in the background.
    pub async fn connect(&self) {
        if let Err(err) = self.inner.link.connect().await {
            warn!(device = %self.inner.device_id, error = %err, "initial connect failed; retrying in background");
        }
    }

    /// Begin publishing and announce ONLINE.
    pub async fn start(&self) {
        self.inner.set_running(true).await;
    }

    /// Stop publishing, stay connected, announce STOPPED.
    pub async fn stop(&self) {
        self.inner.set_running(false).await;
    }

    pub async fn go_offline(&self) {
        self.inner.link.go_offline().await;
    }

    pub async fn go_online(&self) -> Result<()> {
        self.inner.link.go_online().await?;
        Ok(())
    }

    pub async fn reconfigure(&self, version: ProtocolVersion, qos: QosLevel) -> Result<()> {
        self.inner.link.reconfigure(version, qos).await?;
        Ok(())
    }

    /// Run one producer cycle now, outside the interval loop.
    pub async fn publish_cycle(&self) -> CycleOutcome {
        self.inner.cycle().await
    }

    /// Announce STOPPED, then OFFLINE, disconnect and join the loops.
    pub async fn shutdown(&self) -> TaskReport {
        if self.inner.link.is_connected().await {
            self.stop().await;
        }
        self.token.cancel();
        self.inner.link.shutdown().await;
        let tasks = self.tasks.lock().take();
        let report = match tasks {
            Some(tasks) => tasks.shutdown(SHUTDOWN_GRACE).await,
            None => TaskReport::default(),
        };
        info!(device = %self.inner.device_id, published = self.published(), "device publisher shut down");
        report
    }
}

impl std::fmt::Debug for DevicePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePublisher")
            .field("device_id", &self.inner.device_id)
            .field("running", &self.is_running())
            .field("link", &self.inner.link.status())
            .finish()
    }
}

/// MQTT client id used by a simulated device.
pub fn publisher_client_id(device_id: &str) -> String {
    format!("r-tms-pub-{device_id}")
}

fn device_seed(device_id: &str) -> u64 {
    device_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        })
}

async fn run_producer(inner: Arc<Inner>, interval: Duration, token: CancellationToken) -> Result<()> {
    let mut limiter = RateLimiter::new(interval);
    limiter.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = limiter.tick() => {
                inner.cycle().await;
            }
        }
    }
    debug!(device = %inner.device_id, "producer loop stopped");
    Ok(())
}

async fn run_control(
    inner: Arc<Inner>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match serde_json::from_slice::<ControlCommand>(&message.payload) {
            Ok(command) => inner.apply(command).await,
            Err(err) => warn!(device = %inner.device_id, topic = %message.topic, error = %err, "unreadable control command"),
        }
    }
    debug!(device = %inner.device_id, "control loop stopped");
    Ok(())
}
