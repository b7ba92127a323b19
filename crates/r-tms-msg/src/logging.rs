//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry wire types, broker transports and the resilient link."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use tracing::debug;

use crate::qos::QosLevel;

/// Direction of a broker message, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Published by this process.
    Outbound,
    /// Delivered by the broker.
    Inbound,
    /// Retained replay delivered on subscribe.
    Replay,
}

/// Emit a structured log entry for broker traffic.
pub fn log_message(direction: MessageDirection, topic: &str, qos: QosLevel, payload: &[u8]) {
    debug!(
        topic = %topic,
        qos = qos.as_number(),
        bytes = payload.len(),
        direction = ?direction,
        "broker traffic"
    );
}

/// Prometheus handles for link activity.
pub struct LinkMetricsExporter {
    published: IntCounter,
    unacknowledged: IntCounter,
    received: IntCounter,
    dropped: IntCounter,
    reconnects: IntCounter,
    ack_latency: Histogram,
}

impl LinkMetricsExporter {
    /// Register link metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published = IntCounter::with_opts(Opts::new(
            "r_tms_link_published_total",
            "Publishes acknowledged by the broker",
        ))?;
        let unacknowledged = IntCounter::with_opts(Opts::new(
            "r_tms_link_unacknowledged_total",
            "Publishes whose acknowledgement did not arrive in time",
        ))?;
        let received = IntCounter::with_opts(Opts::new(
            "r_tms_link_received_total",
            "Messages delivered by the broker",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "r_tms_link_dropped_total",
            "Inbound messages discarded because the consumer was gone",
        ))?;
        let reconnects = IntCounter::with_opts(Opts::new(
            "r_tms_link_reconnect_attempts_total",
            "Automatic reconnect attempts",
        ))?;
        let ack_latency = Histogram::with_opts(HistogramOpts::new(
            "r_tms_link_ack_latency_seconds",
            "Observed latency between publish and acknowledgement",
        ))?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(unacknowledged.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(ack_latency.clone()))?;

        Ok(Self {
            published,
            unacknowledged,
            received,
            dropped,
            reconnects,
            ack_latency,
        })
    }

    /// Record an acknowledged publish and its latency.
    pub fn observe_published(&self, latency: Duration) {
        self.published.inc();
        self.ack_latency.observe(latency.as_secs_f64());
    }

    /// Record a publish that timed out waiting for its ack.
    pub fn observe_unacknowledged(&self) {
        self.unacknowledged.inc();
    }

    /// Record an inbound message.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Record an inbound message nobody consumed.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Record an automatic reconnect attempt.
    pub fn observe_reconnect(&self) {
        self.reconnects.inc();
    }
}
