//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! A missing or unreadable file falls back to defaults with a warning.

use crate::domain::types::DeviceId;
use crate::domain::zone::Zone;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier, tagged onto every egress payload
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "geotrack".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Enable the JSONL TCP fix listener
    #[serde(default = "default_true")]
    pub listener_enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    /// Number of ingest workers; fixes are sharded by device id
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-worker queue capacity
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Devices reported as inactive even before their first fix
    #[serde(default)]
    pub known_devices: Vec<i64>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listener_enabled: true,
            bind_address: default_bind_address(),
            listener_port: default_listener_port(),
            workers: default_workers(),
            queue_size: default_queue_size(),
            known_devices: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listener_port() -> u16 {
    5055
}

fn default_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// HTTP API and metrics port (0 to disable)
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: default_http_port(), bind_address: default_bind_address() }
    }
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Fixes older than this many days are pruned
    #[serde(default = "default_retention_days")]
    pub days: u32,
    #[serde(default = "default_retention_interval")]
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { days: default_retention_days(), interval_secs: default_retention_interval() }
    }
}

fn default_retention_days() -> u32 {
    90
}

fn default_retention_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// File path for zone event and alert egress (JSONL format)
    #[serde(default = "default_egress_file")]
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: default_egress_file() }
    }
}

fn default_egress_file() -> String {
    "zone_events.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { host: default_mqtt_host(), port: default_mqtt_port(), username: None, password: None }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    /// Enable MQTT egress publishing
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Topic for accepted fixes (QoS 0)
    #[serde(default = "default_fixes_topic")]
    pub fixes_topic: String,
    /// Topic for zone entry/exit events (QoS 1)
    #[serde(default = "default_events_topic")]
    pub events_topic: String,
    /// Topic for alerts (QoS 1)
    #[serde(default = "default_alerts_topic")]
    pub alerts_topic: String,
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
            enabled: true,
            fixes_topic: default_fixes_topic(),
            events_topic: default_events_topic(),
            alerts_topic: default_alerts_topic(),
            metrics_topic: default_metrics_topic(),
            metrics_publish_interval_secs: default_metrics_publish_interval(),
        }
    }
}

fn default_fixes_topic() -> String {
    "geotrack/fixes".to_string()
}

fn default_events_topic() -> String {
    "geotrack/events".to_string()
}

fn default_alerts_topic() -> String {
    "geotrack/alerts".to_string()
}

fn default_metrics_topic() -> String {
    "geotrack/metrics".to_string()
}

fn default_metrics_publish_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Run the embedded MQTT broker
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: true, bind_address: default_bind_address(), port: default_mqtt_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub zones: Vec<Zone>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    listener_enabled: bool,
    listener_bind_address: String,
    listener_port: u16,
    ingest_workers: usize,
    ingest_queue_size: usize,
    known_devices: Vec<DeviceId>,
    http_bind_address: String,
    http_port: u16,
    retention_days: u32,
    retention_interval_secs: u64,
    egress_file: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_egress_enabled: bool,
    mqtt_egress_fixes_topic: String,
    mqtt_egress_events_topic: String,
    mqtt_egress_alerts_topic: String,
    mqtt_egress_metrics_topic: String,
    mqtt_egress_metrics_interval_secs: u64,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    metrics_interval_secs: u64,
    zones: Vec<Zone>,
    config_file: String,
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
            listener_enabled: toml_config.ingest.listener_enabled,
            listener_bind_address: toml_config.ingest.bind_address,
            listener_port: toml_config.ingest.listener_port,
            // Zero workers would leave fixes with nowhere to go
            ingest_workers: toml_config.ingest.workers.max(1),
            ingest_queue_size: toml_config.ingest.queue_size.max(1),
            known_devices: toml_config.ingest.known_devices.into_iter().map(DeviceId).collect(),
            http_bind_address: toml_config.http.bind_address,
            http_port: toml_config.http.port,
            retention_days: toml_config.retention.days,
            retention_interval_secs: toml_config.retention.interval_secs,
            egress_file: toml_config.egress.file,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_egress_fixes_topic: toml_config.mqtt_egress.fixes_topic,
            mqtt_egress_events_topic: toml_config.mqtt_egress.events_topic,
            mqtt_egress_alerts_topic: toml_config.mqtt_egress.alerts_topic,
            mqtt_egress_metrics_topic: toml_config.mqtt_egress.metrics_topic,
            mqtt_egress_metrics_interval_secs: toml_config
                .mqtt_egress
                .metrics_publish_interval_secs,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            zones: toml_config.zones,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
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

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

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
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration - resolves the path from args/env first
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn listener_enabled(&self) -> bool {
        self.listener_enabled
    }

    pub fn listener_bind_address(&self) -> &str {
        &self.listener_bind_address
    }

    pub fn listener_port(&self) -> u16 {
        self.listener_port
    }

    pub fn ingest_workers(&self) -> usize {
        self.ingest_workers
    }

    pub fn ingest_queue_size(&self) -> usize {
        self.ingest_queue_size
    }

    pub fn known_devices(&self) -> &[DeviceId] {
        &self.known_devices
    }

    pub fn http_bind_address(&self) -> &str {
        &self.http_bind_address
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn retention_interval_secs(&self) -> u64 {
        self.retention_interval_secs
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_egress_fixes_topic(&self) -> &str {
        &self.mqtt_egress_fixes_topic
    }

    pub fn mqtt_egress_events_topic(&self) -> &str {
        &self.mqtt_egress_events_topic
    }

    pub fn mqtt_egress_alerts_topic(&self) -> &str {
        &self.mqtt_egress_alerts_topic
    }

    pub fn mqtt_egress_metrics_topic(&self) -> &str {
        &self.mqtt_egress_metrics_topic
    }

    pub fn mqtt_egress_metrics_interval_secs(&self) -> u64 {
        self.mqtt_egress_metrics_interval_secs
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

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    /// Zones defined in the config file
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the egress file
    #[cfg(test)]
    pub fn with_egress_file(mut self, file: &str) -> Self {
        self.egress_file = file.to_string();
        self
    }

    /// Builder method for tests to set the zone list
    #[cfg(test)]
    pub fn with_zones(mut self, zones: Vec<Zone>) -> Self {
        self.zones = zones;
        self
    }

    /// Builder method for tests to set known devices
    #[cfg(test)]
    pub fn with_known_devices(mut self, devices: &[i64]) -> Self {
        self.known_devices = devices.iter().copied().map(DeviceId).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::zone::{ZoneKind, ZoneShape};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "geotrack");
        assert_eq!(config.listener_port(), 5055);
        assert_eq!(config.http_port(), 8080);
        assert_eq!(config.ingest_workers(), 4);
        assert_eq!(config.retention_days(), 90);
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.metrics_interval_secs(), 10);
        assert!(config.zones().is_empty());
    }

    #[test]
    fn test_egress_file_default() {
        let egress = EgressConfig::default();
        assert_eq!(egress.file, "zone_events.jsonl");
        assert_eq!(Config::default().egress_file(), "zone_events.jsonl");
    }

    #[test]
    fn test_zones_from_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[[zones]]
id = 1
name = "Depot"
kind = "allowed"
shape = "circle"
center_lat = 19.43
center_lon = -99.13
radius_m = 250.0

[[zones]]
id = 2
name = "Yard"
kind = "restricted"
shape = "polygon"
vertices = [[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0]]
active = false
schedule_start = "08:00:00"
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());

        let zones = config.zones();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].kind, ZoneKind::Allowed);
        assert!(matches!(zones[0].shape, ZoneShape::Circle { radius_m, .. } if radius_m == 250.0));
        assert!(zones[0].active);
        assert!(!zones[1].active);
        assert!(zones[1].schedule_start.is_some());
        assert!(zones[1].contains(0.5, 0.5));
    }

    #[test]
    fn test_zero_workers_clamped() {
        let toml_config: TomlConfig = toml::from_str("[ingest]\nworkers = 0\n").unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.ingest_workers(), 1);
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["geotrack".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> =
            vec!["geotrack".to_string(), "--config".to_string(), "config/plant.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/plant.toml");

        let args: Vec<String> = vec!["geotrack".to_string(), "--config=config/b.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/b.toml");
    }
}
