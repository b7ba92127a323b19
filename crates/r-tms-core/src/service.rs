//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use r_tms_common::config::AppConfig;
use r_tms_ingest::{
    DeviceRegistry, DeviceSnapshot, IngestPipeline, LogNotifier, Notifier, PipelineHandle,
    WebhookNotifier, WEBHOOK_QUEUE_DEPTH,
};
use r_tms_metrics::{DispatcherMetrics, IngestMetrics, SharedRegistry};
use r_tms_msg::{BrokerConnector, LinkMetricsExporter, LinkOptions, TransportLink};
use r_tms_persistence::TelemetryStore;
use r_tms_rt::{CancellationToken, TaskGroup};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::ScheduleDispatcher;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Monitor service entrypoint: wires link, pipeline and dispatcher together.
pub struct MonitorService {
    config: Arc<AppConfig>,
    store: Arc<dyn TelemetryStore>,
    connector: Arc<dyn BrokerConnector>,
    notifier: Option<Arc<dyn Notifier>>,
    metrics_registry: Option<SharedRegistry>,
}

impl MonitorService {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn TelemetryStore>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            connector,
            notifier: None,
            metrics_registry: None,
        }
    }

    /// Use this notifier instead of the configured one.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_metrics(mut self, registry: SharedRegistry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    /// Start every task and return a handle for lifecycle control.
    ///
    /// An unreachable broker is not an error here; the link keeps retrying.
    pub async fn start(self) -> Result<MonitorHandle> {
        let token = CancellationToken::new();
        let (ingest_metrics, dispatcher_metrics, link_metrics) = match &self.metrics_registry {
            Some(registry) => (
                Some(IngestMetrics::new(registry)?),
                Some(DispatcherMetrics::new(registry)?),
                Some(Arc::new(
                    LinkMetricsExporter::register(registry)
                        .context("failed to register link metrics")?,
                )),
            ),
            None => (None, None, None),
        };

        let mut webhook_task = None;
        let notifier: Arc<dyn Notifier> = match (self.notifier, &self.config.notifier.webhook_url) {
            (Some(notifier), _) => notifier,
            (None, Some(url)) => {
                let client = reqwest::Client::builder()
                    .timeout(WEBHOOK_TIMEOUT)
                    .build()
                    .context("failed to build webhook client")?;
                let (notifier, task) = WebhookNotifier::spawn(url, client, WEBHOOK_QUEUE_DEPTH);
                webhook_task = Some(task);
                Arc::new(notifier)
            }
            (None, None) => Arc::new(LogNotifier),
        };
        info!(notifier = notifier.name(), "anomaly notifier selected");

        let pipeline = Arc::new(IngestPipeline::new(
            &self.config,
            self.store.clone(),
            notifier,
            ingest_metrics,
        ));

        let mut options = LinkOptions::from_config(&self.config.broker);
        for filter in pipeline.subscriptions() {
            options = options.subscribe(filter);
        }
        if let Some(metrics) = link_metrics {
            options = options.with_metrics(metrics);
        }
        let (link, inbound) = TransportLink::new(self.connector.clone(), options);
        let pipeline_tasks = pipeline.spawn(inbound, token.child_token());

        if let Err(err) = link.connect().await {
            warn!(
                host = %self.config.broker.host,
                port = self.config.broker.port,
                error = %err,
                "broker unavailable at startup; reconnecting in background"
            );
        }

        let mut dispatcher = ScheduleDispatcher::new(
            self.store.clone(),
            Arc::new(link.clone()),
            self.config.topics.clone(),
            self.config.retention.clone(),
        );
        if let Some(metrics) = dispatcher_metrics {
            dispatcher = dispatcher.with_metrics(metrics);
        }
        let mut tasks = TaskGroup::with_token(token.clone());
        tasks.spawn("schedule-dispatcher", dispatcher.run(token.clone()));

        let context = ServiceContext {
            config: self.config.clone(),
            store: self.store.clone(),
            link: link.clone(),
            devices: pipeline.registry(),
            started: Instant::now(),
        };
        info!(
            broker = %self.config.broker.host,
            connector = self.connector.name(),
            data_topic = %self.config.topics.data,
            "monitor service started"
        );

        Ok(MonitorHandle {
            token,
            link,
            pipeline,
            pipeline_tasks,
            tasks,
            webhook_task,
            context,
        })
    }
}

impl std::fmt::Debug for MonitorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorService")
            .field("broker", &self.config.broker.host)
            .field("connector", &self.connector.name())
            .finish_non_exhaustive()
    }
}

/// Shared view of a running service, cloned into request handlers.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn TelemetryStore>,
    pub link: TransportLink,
    pub devices: Arc<DeviceRegistry>,
    pub started: Instant,
}

/// Liveness summary of the service.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub link: &'static str,
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub devices: usize,
    pub uptime_secs: u64,
}

impl ServiceContext {
    pub fn device_snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices.snapshot(Instant::now())
    }

    pub async fn health(&self) -> HealthReport {
        let connected = self.link.is_connected().await;
        HealthReport {
            status: if connected { "ok" } else { "degraded" },
            link: self.link.status().as_str(),
            connected,
            reconnect_attempts: self.link.retry_count(),
            devices: self.devices.len(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("link", &self.link.status())
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

/// Handle returned from [`MonitorService::start`].
pub struct MonitorHandle {
    token: CancellationToken,
    link: TransportLink,
    pipeline: Arc<IngestPipeline>,
    pipeline_tasks: PipelineHandle,
    tasks: TaskGroup,
    webhook_task: Option<JoinHandle<()>>,
    context: ServiceContext,
}

impl MonitorHandle {
    pub fn context(&self) -> ServiceContext {
        self.context.clone()
    }

    pub fn link(&self) -> &TransportLink {
        &self.link
    }

    pub fn pipeline(&self) -> Arc<IngestPipeline> {
        self.pipeline.clone()
    }

    /// Token cancelled on shutdown; other services may hang off it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.token.cancel();
        let tasks = self.tasks.shutdown(SHUTDOWN_GRACE).await;
        self.link.shutdown().await;
        let pipeline = self.pipeline_tasks.shutdown(SHUTDOWN_GRACE).await;
        if !tasks.is_clean() || !pipeline.is_clean() {
            warn!(
                failed = ?[tasks.failed, pipeline.failed].concat(),
                aborted = ?[tasks.aborted, pipeline.aborted].concat(),
                "some tasks did not stop cleanly"
            );
        }

        drop(self.pipeline);
        drop(self.context);
        if let Some(mut task) = self.webhook_task {
            if tokio::time::timeout(WEBHOOK_TIMEOUT, &mut task).await.is_err() {
                debug!("webhook queue still busy; aborting delivery task");
                task.abort();
            }
        }
        info!("monitor service shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("link", &self.link.status())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
