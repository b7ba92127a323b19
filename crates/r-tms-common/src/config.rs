//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::LogFormat;

fn default_broker_host() -> String {
    "broker.hivemq.com".to_owned()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keepalive() -> Duration {
    Duration::from_secs(60)
}

fn default_client_id() -> String {
    "r-tms-monitor".to_owned()
}

fn default_protocol_version() -> u8 {
    5
}

fn default_qos() -> u8 {
    1
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_base() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(30)
}

fn default_data_topic() -> String {
    "group_1/temp".to_owned()
}

fn default_status_topic() -> String {
    "group_1/status".to_owned()
}

fn default_control_topic() -> String {
    "group_1/control".to_owned()
}

fn default_allowed_min() -> f64 {
    0.0
}

fn default_allowed_max() -> f64 {
    50.0
}

fn default_physical_min() -> f64 {
    -50.0
}

fn default_physical_max() -> f64 {
    100.0
}

fn default_fault_marker() -> String {
    "SENSOR_FAULT".to_owned()
}

fn default_publish_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_reorder_ratio() -> f64 {
    0.6
}

fn default_reorder_floor() -> Duration {
    Duration::from_millis(800)
}

fn default_watchdog_tick() -> Duration {
    Duration::from_secs(2)
}

fn default_liveness_slop() -> Duration {
    Duration::from_millis(750)
}

fn default_pipeline_workers() -> usize {
    4
}

fn default_notify_cooldown() -> Duration {
    Duration::from_secs(300)
}

fn default_retention_days() -> u32 {
    30
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_schedule_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_schedule_debounce() -> Duration {
    Duration::from_secs(365 * 24 * 3600)
}

fn default_miss_rate() -> f64 {
    0.02
}

fn default_blackout_chance() -> f64 {
    0.03
}

fn default_blackout_min() -> u32 {
    3
}

fn default_blackout_max() -> u32 {
    8
}

fn default_generator_base() -> f64 {
    19.5
}

fn default_generator_amplitude() -> f64 {
    2.5
}

fn default_generator_frequency() -> f64 {
    0.08
}

fn default_generator_noise() -> f64 {
    0.8
}

fn default_injection_rate() -> f64 {
    0.02
}

fn default_publisher_seed() -> u64 {
    0x7E57u64
}

fn default_devices() -> IndexMap<String, String> {
    let mut devices = IndexMap::new();
    devices.insert("dev001".to_owned(), "Library".to_owned());
    devices.insert("dev002".to_owned(), "Engineering Lab".to_owned());
    devices.insert("dev003".to_owned(), "Student Cafeteria".to_owned());
    devices
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Raised when configuration is structurally unusable. Only ever fatal at startup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

fn under(topic: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    topic == root
        || topic
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Primary configuration object for the R-TMS runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default = "default_devices")]
    pub devices: IndexMap<String, String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            topics: TopicConfig::default(),
            validation: ValidationConfig::default(),
            timing: TimingConfig::default(),
            notifier: NotifierConfig::default(),
            retention: RetentionConfig::default(),
            storage: StorageConfig::default(),
            publisher: PublisherConfig::default(),
            devices: default_devices(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_TMS_CONFIG";

    /// Load configuration from disk, respecting the `R_TMS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Location configured for a device, if any.
    pub fn device_location(&self, device_id: &str) -> Option<&str> {
        self.devices.get(device_id).map(String::as_str)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.broker.validate()?;
        self.topics.validate()?;
        self.validation.validate()?;
        self.timing.validate()?;
        self.publisher.validate()?;
        if self.retention.retention_days == 0 {
            return Err(ConfigError::invalid(
                "retention.retention_days",
                "retention horizon must be at least one day",
            ));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_keepalive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keepalive: Duration,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// MQTT protocol version; anything other than 5 selects 3.1.1.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,
    /// Requested QoS; values outside 0..=2 fall back to 0.
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_ack_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub ack_timeout: Duration,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_reconnect_base")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub reconnect_base: Duration,
    #[serde(default = "default_reconnect_max")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub reconnect_max: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            keepalive: default_keepalive(),
            client_id: default_client_id(),
            protocol_version: default_protocol_version(),
            qos: default_qos(),
            ack_timeout: default_ack_timeout(),
            connect_timeout: default_connect_timeout(),
            reconnect_base: default_reconnect_base(),
            reconnect_max: default_reconnect_max(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Missing("broker.host"));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("broker.client_id"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("broker.port", "port must be non-zero"));
        }
        if self.reconnect_base.is_zero() {
            return Err(ConfigError::invalid(
                "broker.reconnect_base",
                "reconnect base delay must be positive",
            ));
        }
        if self.reconnect_max < self.reconnect_base {
            return Err(ConfigError::invalid(
                "broker.reconnect_max",
                "maximum reconnect delay is shorter than the base delay",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_data_topic")]
    pub data: String,
    #[serde(default = "default_status_topic")]
    pub status: String,
    /// Base topic; commands go to `{control}/{device_id}`.
    #[serde(default = "default_control_topic")]
    pub control: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            data: default_data_topic(),
            status: default_status_topic(),
            control: default_control_topic(),
        }
    }
}

impl TopicConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.data.trim().is_empty() {
            return Err(ConfigError::Missing("topics.data"));
        }
        if self.status.trim().is_empty() {
            return Err(ConfigError::Missing("topics.status"));
        }
        if self.control.trim().is_empty() {
            return Err(ConfigError::Missing("topics.control"));
        }
        if self.data == self.status {
            return Err(ConfigError::invalid(
                "topics.status",
                "status topic must differ from the data topic",
            ));
        }
        Ok(())
    }

    /// Control topic addressed to a single device.
    pub fn control_for(&self, device_id: &str) -> String {
        format!("{}/{}", self.control.trim_end_matches('/'), device_id)
    }

    /// Retained status topic owned by a single device.
    pub fn status_for(&self, device_id: &str) -> String {
        format!("{}/{}", self.status.trim_end_matches('/'), device_id)
    }

    /// Whether `topic` carries status announcements.
    pub fn is_status(&self, topic: &str) -> bool {
        under(topic, &self.status)
    }

    /// Whether `topic` carries telemetry.
    pub fn is_data(&self, topic: &str) -> bool {
        under(topic, &self.data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_allowed_min")]
    pub allowed_min: f64,
    #[serde(default = "default_allowed_max")]
    pub allowed_max: f64,
    #[serde(default = "default_physical_min")]
    pub physical_min: f64,
    #[serde(default = "default_physical_max")]
    pub physical_max: f64,
    #[serde(default = "default_fault_marker")]
    pub fault_marker: String,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allowed_min: default_allowed_min(),
            allowed_max: default_allowed_max(),
            physical_min: default_physical_min(),
            physical_max: default_physical_max(),
            fault_marker: default_fault_marker(),
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let bounds = [
            self.allowed_min,
            self.allowed_max,
            self.physical_min,
            self.physical_max,
        ];
        if bounds.iter().any(|value| !value.is_finite()) {
            return Err(ConfigError::invalid(
                "validation",
                "range bounds must be finite numbers",
            ));
        }
        if self.allowed_min >= self.allowed_max {
            return Err(ConfigError::invalid(
                "validation.allowed_min",
                format!(
                    "allowed range [{}, {}] is empty",
                    self.allowed_min, self.allowed_max
                ),
            ));
        }
        if self.physical_min > self.allowed_min || self.physical_max < self.allowed_max {
            return Err(ConfigError::invalid(
                "validation.physical_min",
                "physical bounds must contain the allowed range",
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Expected interval between samples from one device.
    #[serde(default = "default_publish_interval")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub publish_interval: Duration,
    #[serde(default = "default_reorder_ratio")]
    pub reorder_ratio: f64,
    #[serde(default = "default_reorder_floor")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub reorder_floor: Duration,
    #[serde(default = "default_watchdog_tick")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub watchdog_tick: Duration,
    #[serde(default = "default_liveness_slop")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub liveness_slop: Duration,
    #[serde(default = "default_pipeline_workers")]
    pub pipeline_workers: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            publish_interval: default_publish_interval(),
            reorder_ratio: default_reorder_ratio(),
            reorder_floor: default_reorder_floor(),
            watchdog_tick: default_watchdog_tick(),
            liveness_slop: default_liveness_slop(),
            pipeline_workers: default_pipeline_workers(),
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.publish_interval.is_zero() {
            return Err(ConfigError::invalid(
                "timing.publish_interval",
                "publish interval must be positive",
            ));
        }
        if !(self.reorder_ratio > 0.0 && self.reorder_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                "timing.reorder_ratio",
                format!("{} is outside (0, 1]", self.reorder_ratio),
            ));
        }
        if self.watchdog_tick.is_zero() {
            return Err(ConfigError::invalid(
                "timing.watchdog_tick",
                "watchdog cadence must be positive",
            ));
        }
        if self.pipeline_workers == 0 {
            return Err(ConfigError::invalid(
                "timing.pipeline_workers",
                "at least one pipeline worker is required",
            ));
        }
        Ok(())
    }

    /// Reorder window: a fraction of the publish interval with a fixed floor.
    pub fn reorder_window(&self) -> Duration {
        self.publish_interval
            .mul_f64(self.reorder_ratio)
            .max(self.reorder_floor)
    }

    /// Silence tolerated before a device is considered stalled.
    pub fn liveness_threshold(&self) -> Duration {
        self.publish_interval * 2 + self.liveness_slop
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_notify_cooldown")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cooldown: Duration,
    /// Optional HTTP endpoint receiving JSON notifications.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            cooldown: default_notify_cooldown(),
            webhook_url: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_purge_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub purge_interval: Duration,
    #[serde(default = "default_schedule_tick")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub schedule_tick: Duration,
    /// How far a fired schedule is pushed into the future.
    #[serde(default = "default_schedule_debounce")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub schedule_debounce: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            purge_interval: default_purge_interval(),
            schedule_tick: default_schedule_tick(),
            schedule_debounce: default_schedule_debounce(),
        }
    }
}

impl RetentionConfig {
    pub fn horizon(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// JSON-lines journal mirroring every appended record.
    #[serde(default)]
    pub journal: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_miss_rate")]
    pub miss_rate: f64,
    #[serde(default)]
    pub blackout: BlackoutConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default = "default_publisher_seed")]
    pub seed: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            miss_rate: default_miss_rate(),
            blackout: BlackoutConfig::default(),
            generator: GeneratorConfig::default(),
            seed: default_publisher_seed(),
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let rates = [
            ("publisher.miss_rate", self.miss_rate),
            ("publisher.blackout.chance", self.blackout.chance),
            ("publisher.generator.wild_rate", self.generator.wild_rate),
            (
                "publisher.generator.corrupt_rate",
                self.generator.corrupt_rate,
            ),
        ];
        for (field, rate) in rates {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::invalid(
                    field,
                    format!("{rate} is not a probability"),
                ));
            }
        }
        if self.blackout.min > self.blackout.max {
            return Err(ConfigError::invalid(
                "publisher.blackout.min",
                "blackout minimum exceeds maximum",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackoutConfig {
    #[serde(default = "default_blackout_chance")]
    pub chance: f64,
    #[serde(default = "default_blackout_min")]
    pub min: u32,
    #[serde(default = "default_blackout_max")]
    pub max: u32,
}

impl Default for BlackoutConfig {
    fn default() -> Self {
        Self {
            chance: default_blackout_chance(),
            min: default_blackout_min(),
            max: default_blackout_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_base")]
    pub base: f64,
    #[serde(default = "default_generator_amplitude")]
    pub amplitude: f64,
    #[serde(default = "default_generator_frequency")]
    pub frequency: f64,
    #[serde(default = "default_generator_noise")]
    pub noise: f64,
    #[serde(default)]
    pub allow_wild: bool,
    #[serde(default)]
    pub allow_corrupt: bool,
    #[serde(default = "default_injection_rate")]
    pub wild_rate: f64,
    #[serde(default = "default_injection_rate")]
    pub corrupt_rate: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base: default_generator_base(),
            amplitude: default_generator_amplitude(),
            frequency: default_generator_frequency(),
            noise: default_generator_noise(),
            allow_wild: false,
            allow_corrupt: false,
            wild_rate: default_injection_rate(),
            corrupt_rate: default_injection_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// `tracing` filter directive, overridden by `R_TMS_LOG`.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_documented_defaults() {
        let config: AppConfig = "".parse().expect("defaults are valid");
        assert_eq!(config.broker.host, "broker.hivemq.com");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.qos, 1);
        assert_eq!(config.broker.protocol_version, 5);
        assert_eq!(config.topics.data, "group_1/temp");
        assert_eq!(config.validation.allowed_max, 50.0);
        assert_eq!(config.retention.retention_days, 30);
        assert_eq!(config.notifier.cooldown, Duration::from_secs(300));
        assert_eq!(config.device_location("dev002"), Some("Engineering Lab"));
    }

    #[test]
    fn programmatic_default_matches_an_empty_document() {
        let config = AppConfig::default();
        assert_eq!(config.devices.len(), 3);
        assert_eq!(config.device_location("dev001"), Some("Library"));
        assert_eq!(config.device_location("dev003"), Some("Student Cafeteria"));

        let parsed: AppConfig = "".parse().expect("defaults are valid");
        assert_eq!(
            config.devices.keys().collect::<Vec<_>>(),
            parsed.devices.keys().collect::<Vec<_>>()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn derived_windows_follow_publish_interval() {
        let mut timing = TimingConfig::default();
        assert_eq!(timing.reorder_window(), Duration::from_millis(1200));
        assert_eq!(timing.liveness_threshold(), Duration::from_millis(4750));

        timing.publish_interval = Duration::from_secs(1);
        assert_eq!(timing.reorder_window(), Duration::from_millis(800));
    }

    #[test]
    fn fractional_durations_parse() {
        let config: AppConfig = r#"
            [timing]
            publish_interval = 0.5
            liveness_slop = 0.25
        "#
        .parse()
        .expect("valid config");
        assert_eq!(config.timing.publish_interval, Duration::from_millis(500));
        assert_eq!(
            config.timing.liveness_threshold(),
            Duration::from_millis(1250)
        );
    }

    #[test]
    fn empty_allowed_range_is_rejected() {
        let mut config = AppConfig::default();
        config.validation.allowed_min = 60.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "validation.allowed_min",
                ..
            })
        ));
    }

    #[test]
    fn missing_host_is_reported() {
        let mut config = AppConfig::default();
        config.broker.host = "  ".into();
        assert_eq!(
            config.validate(),
            Err(ConfigError::Missing("broker.host"))
        );
    }

    #[test]
    fn control_topic_is_scoped_per_device() {
        let topics = TopicConfig {
            control: "plant/control/".into(),
            ..TopicConfig::default()
        };
        assert_eq!(topics.control_for("dev009"), "plant/control/dev009");
        assert!(topics.is_status(&topics.status_for("dev009")));
        assert!(!topics.is_status("plant/statusx"));
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let config: AppConfig = include_str!("../../../configs/r-tms.toml")
            .parse()
            .expect("example config parses");
        assert_eq!(config.timing.publish_interval, Duration::from_secs(2));
        assert_eq!(config.retention.purge_interval, Duration::from_secs(6 * 3600));
        assert!(config.publisher.generator.allow_wild);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.devices.len(), 3);
    }

    #[test]
    fn loads_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("tms.toml");
        let mut file = std::fs::File::create(&path).expect("create config");
        writeln!(file, "[broker]\nhost = \"localhost\"\nport = 1884").expect("write config");

        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).expect("load config");
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.broker.host, "localhost");
        assert_eq!(loaded.config.broker.port, 1884);
    }
}
