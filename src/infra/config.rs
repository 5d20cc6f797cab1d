//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section and field has a default, so an empty file is a valid config.

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "region-match".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

/// Input topics; MQTT wildcards are allowed
#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_observations_topic")]
    pub observations: String,
    #[serde(default = "default_regions_topic")]
    pub regions: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self { observations: default_observations_topic(), regions: default_regions_topic() }
    }
}

fn default_observations_topic() -> String {
    "regionmatch/devices".to_string()
}

fn default_regions_topic() -> String {
    "regionmatch/regions".to_string()
}

/// JSON attribute names bound on input observations and output events
#[derive(Debug, Clone, Deserialize)]
pub struct AttributesConfig {
    #[serde(default = "default_id_attribute")]
    pub id: String,
    #[serde(default = "default_latitude_attribute")]
    pub latitude: String,
    #[serde(default = "default_longitude_attribute")]
    pub longitude: String,
    #[serde(default = "default_timestamp_attribute")]
    pub timestamp: String,
    #[serde(default = "default_event_type_attribute")]
    pub event_type: String,
    #[serde(default = "default_region_name_attribute")]
    pub region_name: String,
}

impl Default for AttributesConfig {
    fn default() -> Self {
        Self {
            id: default_id_attribute(),
            latitude: default_latitude_attribute(),
            longitude: default_longitude_attribute(),
            timestamp: default_timestamp_attribute(),
            event_type: default_event_type_attribute(),
            region_name: default_region_name_attribute(),
        }
    }
}

fn default_id_attribute() -> String {
    "id".to_string()
}

fn default_latitude_attribute() -> String {
    "latitude".to_string()
}

fn default_longitude_attribute() -> String {
    "longitude".to_string()
}

fn default_timestamp_attribute() -> String {
    "timeStamp".to_string()
}

fn default_event_type_attribute() -> String {
    "matchEventType".to_string()
}

fn default_region_name_attribute() -> String {
    "regionName".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Number of partition workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded queue depth per input channel and per worker
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,
    /// Forget devices silent for this long (0 = never)
    #[serde(default)]
    pub device_idle_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
            housekeeping_interval_secs: default_housekeeping_interval(),
            device_idle_timeout_secs: 0,
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_depth() -> usize {
    1000
}

fn default_housekeeping_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EgressConfig {
    /// File path for event egress (JSONL format); unset disables it
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    /// Enable MQTT egress publishing
    #[serde(default = "default_mqtt_egress_enabled")]
    pub enabled: bool,
    /// Topic for match events (QoS 1)
    #[serde(default = "default_events_topic")]
    pub events_topic: String,
    /// Topic for periodic metrics snapshots (QoS 0)
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
    /// Interval for publishing metrics (seconds)
    #[serde(default = "default_metrics_publish_interval")]
    pub metrics_publish_interval_secs: u64,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: default_mqtt_egress_enabled(),
            events_topic: default_events_topic(),
            metrics_topic: default_metrics_topic(),
            metrics_publish_interval_secs: default_metrics_publish_interval(),
        }
    }
}

fn default_mqtt_egress_enabled() -> bool {
    true
}

fn default_events_topic() -> String {
    "regionmatch/events".to_string()
}

fn default_metrics_topic() -> String {
    "regionmatch/metrics".to_string()
}

fn default_metrics_publish_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Run an embedded broker in-process
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: default_broker_bind_address(), port: default_broker_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Deployment identifier, stamped on metrics snapshots
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "region-match".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub attributes: AttributesConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_client_id: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_keep_alive_secs: u64,
    observations_topic: String,
    regions_topic: String,
    attributes: AttributesConfig,
    engine_workers: usize,
    engine_queue_depth: usize,
    housekeeping_interval_secs: u64,
    device_idle_timeout_secs: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
    egress_file: Option<String>,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    // MQTT Egress config
    mqtt_egress_enabled: bool,
    mqtt_egress_events_topic: String,
    mqtt_egress_metrics_topic: String,
    mqtt_egress_metrics_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_client_id: toml_config.mqtt.client_id,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_keep_alive_secs: toml_config.mqtt.keep_alive_secs,
            observations_topic: toml_config.topics.observations,
            regions_topic: toml_config.topics.regions,
            attributes: toml_config.attributes,
            engine_workers: toml_config.engine.workers.max(1),
            engine_queue_depth: toml_config.engine.queue_depth.max(1),
            housekeeping_interval_secs: toml_config.engine.housekeeping_interval_secs.max(1),
            device_idle_timeout_secs: toml_config.engine.device_idle_timeout_secs,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
            egress_file: toml_config.egress.file.filter(|f| !f.trim().is_empty()),
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_egress_events_topic: toml_config.mqtt_egress.events_topic,
            mqtt_egress_metrics_topic: toml_config.mqtt_egress.metrics_topic,
            mqtt_egress_metrics_interval_secs: toml_config
                .mqtt_egress
                .metrics_publish_interval_secs
                .max(1),
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        // Check CONFIG_FILE environment variable
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        // Default to dev.toml
        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(Self::resolve_config_path(args))
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt_client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_keep_alive_secs(&self) -> u64 {
        self.mqtt_keep_alive_secs
    }

    pub fn observations_topic(&self) -> &str {
        &self.observations_topic
    }

    pub fn regions_topic(&self) -> &str {
        &self.regions_topic
    }

    pub fn attributes(&self) -> &AttributesConfig {
        &self.attributes
    }

    pub fn engine_workers(&self) -> usize {
        self.engine_workers
    }

    pub fn engine_queue_depth(&self) -> usize {
        self.engine_queue_depth
    }

    pub fn housekeeping_interval_secs(&self) -> u64 {
        self.housekeeping_interval_secs
    }

    /// None when idle eviction is disabled
    pub fn device_idle_timeout(&self) -> Option<Duration> {
        (self.device_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.device_idle_timeout_secs))
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn egress_file(&self) -> Option<&str> {
        self.egress_file.as_deref()
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    // MQTT Egress getters
    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_egress_events_topic(&self) -> &str {
        &self.mqtt_egress_events_topic
    }

    pub fn mqtt_egress_metrics_topic(&self) -> &str {
        &self.mqtt_egress_metrics_topic
    }

    pub fn mqtt_egress_metrics_interval_secs(&self) -> u64 {
        self.mqtt_egress_metrics_interval_secs
    }
}
