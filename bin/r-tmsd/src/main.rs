//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the R-TMS daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use r_tms_api::{spawn_api_server, ApiServer, ApiState};
use r_tms_common::config::AppConfig;
use r_tms_common::logging::init_tracing;
use r_tms_core::MonitorService;
use r_tms_metrics::{new_registry, spawn_http_server, DaemonMetrics, SharedRegistry};
use r_tms_msg::MqttConnector;
use r_tms_persistence::{InMemoryStore, StoreMetrics, TelemetryStore};
use r_tms_sim::DevicePublisher;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "R-TMS telemetry monitor daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the monitor service with its metrics and API servers")]
    Run,
    #[command(about = "Run simulated device publishers")]
    Publish {
        #[arg(value_name = "DEVICE", help = "Device ids from [devices]; all when omitted")]
        devices: Vec<String>,
        #[arg(long, help = "Connect but wait for a resume command before publishing")]
        paused: bool,
    },
    #[command(about = "Load and validate configuration, then print it")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/r-tms.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    let load_duration = load_started.elapsed();

    if let Some(Commands::CheckConfig) = &cli.command {
        let rendered = serde_json::to_string_pretty(&config)
            .context("failed to render configuration")?;
        println!("# {}", loaded.source.display());
        println!("{rendered}");
        return Ok(());
    }

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" },
    );

    init_tracing("r-tmsd", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, metrics_registry).await?,
        Commands::Publish { devices, paused } => run_publishers(config, devices, paused).await?,
        Commands::CheckConfig => {}
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, registry: SharedRegistry) -> Result<()> {
    let metrics_settings = config.metrics.clone();
    let api_settings = config.api.clone();
    let metrics_registry = metrics_settings.enabled.then(|| registry.clone());

    let store = {
        let store = match &config.storage.journal {
            Some(path) => InMemoryStore::open_journal(path)
                .with_context(|| format!("failed to open journal {}", path.display()))?,
            None => InMemoryStore::new(),
        };
        match &metrics_registry {
            Some(registry) => Arc::new(store.with_metrics(StoreMetrics::new(registry)?)),
            None => Arc::new(store),
        }
    };

    let metrics_server = match &metrics_registry {
        Some(registry) => {
            info!(address = %metrics_settings.listen, "metrics exporter enabled");
            Some(spawn_http_server(registry.clone(), metrics_settings.listen)?)
        }
        None => {
            info!("metrics exporter disabled by configuration");
            None
        }
    };

    let shared_store: Arc<dyn TelemetryStore> = store.clone();
    let mut service = MonitorService::new(config, shared_store, Arc::new(MqttConnector::new()));
    if let Some(registry) = metrics_registry {
        service = service.with_metrics(registry);
    }
    let handle = service.start().await?;

    let mut api_server: Option<ApiServer> = None;
    if api_settings.enabled {
        let state = Arc::new(ApiState::new(handle.context()));
        match spawn_api_server(state, api_settings.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "api server listening");
                api_server = Some(server);
            }
            Err(err) => {
                warn!(error = %err, "failed to start api server");
            }
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!("monitor running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    if let Some(server) = api_server {
        server.shutdown().await?;
    }
    handle.shutdown().await?;
    if let Err(err) = store.flush_journal() {
        warn!(error = %err, "failed to flush journal on shutdown");
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}

async fn run_publishers(config: AppConfig, devices: Vec<String>, paused: bool) -> Result<()> {
    let devices = if devices.is_empty() {
        config.devices.keys().cloned().collect()
    } else {
        devices
    };
    if devices.is_empty() {
        bail!("no devices configured");
    }

    let connector = Arc::new(MqttConnector::new());
    let mut publishers = Vec::with_capacity(devices.len());
    for device_id in &devices {
        let publisher = DevicePublisher::new(&config, device_id, connector.clone())?;
        publisher.connect().await;
        if !paused {
            publisher.start().await;
        }
        publishers.push(publisher);
    }
    info!(devices = ?devices, paused, "publishers running; waiting for termination signal");

    signal::ctrl_c().await?;
    info!("ctrl-c received; stopping publishers");
    for publisher in publishers {
        let report = publisher.shutdown().await;
        if !report.is_clean() {
            warn!(device = %publisher.device_id(), ?report, "publisher tasks did not stop cleanly");
        }
    }
    Ok(())
}
