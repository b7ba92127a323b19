//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the R-TMS workspace.
//! This crate exposes configuration loading, logging bootstrap and
//! clock helpers consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    ApiConfig, AppConfig, BlackoutConfig, BrokerConfig, ConfigError, GeneratorConfig,
    LoadedAppConfig, LoggingConfig, MetricsConfig, NotifierConfig, PublisherConfig,
    RetentionConfig, StorageConfig, TimingConfig, TopicConfig, ValidationConfig,
};
pub use logging::{init_tracing, LogFormat};
