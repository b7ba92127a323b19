//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "R_TMS_LOG";

/// Pipeline and dispatcher chatter at debug; broker and HTTP client internals quiet.
pub const DEFAULT_FILTER: &str =
    "info,r_tms_ingest=debug,r_tms_core=debug,r_tms_sim=debug,rumqttc=warn,hyper=warn,reqwest=warn";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Initialize the tracing subscriber for a service.
///
/// * The filter comes from `R_TMS_LOG` (e.g. `info,r_tms_ingest=trace`), then
///   `[logging].filter`, then `RUST_LOG`, finally [`DEFAULT_FILTER`].
/// * Stdout receives JSON or pretty output; a rolling daily JSON file is written to
///   `config.directory` regardless of the stdout format.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());

    let file_appender = daily(&config.directory, format!("{prefix}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let directive = filter_directive(
        std::env::var(LOG_ENV).ok(),
        config.filter.as_deref(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid log filter {directive:?} ({err}); using {DEFAULT_FILTER}");
        EnvFilter::new(DEFAULT_FILTER)
    });

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, log_dir = %config.directory.display(), format = ?config.format, filter = %directive, "tracing initialised");
    Ok(())
}

fn filter_directive(
    service_env: Option<String>,
    configured: Option<&str>,
    rust_log: Option<String>,
) -> String {
    let non_empty = |value: &String| !value.trim().is_empty();
    service_env
        .filter(non_empty)
        .or_else(|| configured.map(str::to_owned).filter(non_empty))
        .or_else(|| rust_log.filter(non_empty))
        .unwrap_or_else(|| DEFAULT_FILTER.to_owned())
}
