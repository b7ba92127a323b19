//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder, TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Address the listener actually bound, with an ephemeral port resolved.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "r_tmsd_starts_total",
            "Total number of times the R-TMS daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r_tmsd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "r_tmsd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

/// Counters maintained by the ingestion pipeline.
#[derive(Clone, Debug)]
pub struct IngestMetrics {
    classified: IntCounterVec,
    anomalies: IntCounterVec,
    notifications: IntCounterVec,
    timeline_points: IntCounterVec,
    devices: IntGauge,
}

impl IngestMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let classified = IntCounterVec::new(
            Opts::new(
                "r_tms_messages_classified_total",
                "Inbound data messages by classification",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(classified.clone()))?;

        let anomalies = IntCounterVec::new(
            Opts::new("r_tms_anomalies_total", "Anomalies recorded by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(anomalies.clone()))?;

        let notifications = IntCounterVec::new(
            Opts::new(
                "r_tms_notifications_total",
                "Notification attempts by outcome (sent, suppressed, failed)",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(notifications.clone()))?;

        let timeline_points = IntCounterVec::new(
            Opts::new(
                "r_tms_timeline_points_total",
                "Reconstructed timeline points flushed by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(timeline_points.clone()))?;

        let devices = IntGauge::with_opts(Opts::new(
            "r_tms_devices_known",
            "Devices currently tracked by the registry",
        ))?;
        registry.register(Box::new(devices.clone()))?;

        Ok(Self {
            classified,
            anomalies,
            notifications,
            timeline_points,
            devices,
        })
    }

    pub fn record_classified(&self, kind: &str) {
        self.classified.with_label_values(&[kind]).inc();
    }

    pub fn record_anomaly(&self, kind: &str) {
        self.anomalies.with_label_values(&[kind]).inc();
    }

    pub fn record_notification(&self, outcome: &str) {
        self.notifications.with_label_values(&[outcome]).inc();
    }

    pub fn record_timeline_point(&self, kind: &str) {
        self.timeline_points.with_label_values(&[kind]).inc();
    }

    pub fn set_device_count(&self, count: usize) {
        self.devices.set(count as i64);
    }
}

/// Counters for the schedule and retention loop.
#[derive(Clone, Debug)]
pub struct DispatcherMetrics {
    schedules_fired: IntCounterVec,
    purges: IntCounter,
    purged_rows: IntCounter,
}

impl DispatcherMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let schedules_fired = IntCounterVec::new(
            Opts::new(
                "r_tms_schedules_fired_total",
                "Scheduled control actions fired, by publish outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(schedules_fired.clone()))?;

        let purges = IntCounter::with_opts(Opts::new(
            "r_tms_retention_purges_total",
            "Retention purges executed",
        ))?;
        registry.register(Box::new(purges.clone()))?;

        let purged_rows = IntCounter::with_opts(Opts::new(
            "r_tms_retention_purged_rows_total",
            "Rows removed by retention purges",
        ))?;
        registry.register(Box::new(purged_rows.clone()))?;

        Ok(Self {
            schedules_fired,
            purges,
            purged_rows,
        })
    }

    pub fn record_fired(&self, outcome: &str) {
        self.schedules_fired.with_label_values(&[outcome]).inc();
    }

    pub fn record_purge(&self, rows: usize) {
        self.purges.inc();
        self.purged_rows.inc_by(rows as u64);
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_metrics_register_once() {
        let registry = new_registry();
        let metrics = IngestMetrics::new(&registry).expect("register");
        metrics.record_classified("VALID");
        metrics.record_classified("VALID");
        metrics.record_anomaly("WILD");

        let families = registry.gather();
        let classified = families
            .iter()
            .find(|family| family.get_name() == "r_tms_messages_classified_total")
            .expect("family present");
        assert_eq!(classified.get_metric()[0].get_counter().get_value(), 2.0);

        assert!(IngestMetrics::new(&registry).is_err());
    }

    #[tokio::test]
    async fn scrape_endpoint_serves_registered_families() {
        let registry = new_registry();
        let daemon = DaemonMetrics::new(registry.clone()).expect("register");
        daemon.inc_start();
        daemon.set_build_info("0.1.0", "debug");

        let server =
            spawn_http_server(registry, "127.0.0.1:0".parse().expect("addr")).expect("spawn");
        assert_ne!(server.addr().port(), 0);

        let response = reqwest::get(format!("http://{}/metrics", server.addr()))
            .await
            .expect("scrape");
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            prometheus::TEXT_FORMAT
        );
        let body = response.text().await.expect("body");
        assert!(body.contains("r_tmsd_starts_total 1"));
        assert!(body.contains("r_tmsd_build_info"));

        server.shutdown().await.expect("shutdown");
    }
}
