use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::bridge::field::FieldKind;
use crate::bridge::scheduler::SchedulePolicy;
use crate::bridge::topic::TopicPattern;

/// Top-level configuration for the bridge.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// MQTT broker connection configuration.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Topic patterns per channel category.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Field name to sink slot mapping. Default: the smart-room field set.
    #[serde(default = "default_fields")]
    pub fields: BTreeMap<String, FieldConfig>,

    /// Flush scheduling configuration.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Catalog service configuration (credential lookups).
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Ingestion sink configuration.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// MQTT broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname or address.
    #[serde(default)]
    pub host: String,

    /// Broker port. Default: 1883.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier presented to the broker. Default: "tsbridge".
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Keep-alive interval. Default: 30s.
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,

    /// Capacity of the inbound message channel between the MQTT loop and the
    /// bridge. Default: 1024.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Topic patterns per channel category.
///
/// Patterns use `{User}` and `{Room}` placeholders, MQTT `+` for a single
/// ignored level, and a trailing `#` for any remaining levels.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// Structured sensor/actuator payloads.
    #[serde(default = "default_telemetry_topics")]
    pub telemetry: Vec<String>,

    /// Alert payloads scanned for the alert marker.
    #[serde(default = "default_alert_topics")]
    pub alerts: Vec<String>,

    /// Counter reset signals.
    #[serde(default = "default_reset_topics")]
    pub reset: Vec<String>,

    /// Scheduling hints.
    #[serde(default = "default_hint_topics")]
    pub hint: Vec<String>,

    /// Status value counted as one alert. Default: "ALERT".
    #[serde(default = "default_alert_marker")]
    pub alert_marker: String,

    /// Field name aliases applied after name resolution. Default: raw -> light.
    #[serde(default = "default_aliases")]
    pub aliases: HashMap<String, String>,
}

/// Sink slot and aggregation kind for one field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldConfig {
    /// Sink slot identifier (e.g. "field1").
    pub slot: String,
    /// Aggregation kind.
    pub kind: FieldKind,
}

/// Flush scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Minimum time between two publishes for one key. Default: 15s.
    #[serde(default = "default_min_period", with = "humantime_serde")]
    pub min_period: Duration,

    /// Regular flush period. Defaults to `min_period`.
    #[serde(default, with = "humantime_serde::option")]
    pub flush_interval: Option<Duration>,

    /// Due-scan tick. Default: 1s.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Upper bound on concurrently running flushes. Default: 8.
    #[serde(default = "default_max_concurrent_flushes")]
    pub max_concurrent_flushes: usize,
}

/// Catalog service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Catalog base URL (e.g. "http://catalog:8080").
    #[serde(default)]
    pub url: String,

    /// Request timeout. Default: 5s.
    #[serde(default = "default_catalog_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How long resolved credentials stay cached. Default: 10m.
    #[serde(default = "default_credentials_ttl", with = "humantime_serde")]
    pub credentials_ttl: Duration,

    /// Warm the credential cache from the full catalog at start. Default: true.
    #[serde(default = "default_true")]
    pub preload: bool,

    /// Register this bridge as a service in the catalog. Default: false.
    #[serde(default)]
    pub register_service: bool,

    /// Service identifier used for registration.
    #[serde(default = "default_service_id")]
    pub service_id: String,

    /// Value sent in the `X-Write-Token` header on registration.
    #[serde(default)]
    pub write_token: Option<String>,
}

/// Ingestion sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Write endpoint. Default: "https://api.thingspeak.com/update".
    #[serde(default = "default_write_url")]
    pub write_url: String,

    /// Per-request timeout. Default: 5s.
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Documented per-channel minimum interval of the sink. Default: 15s.
    #[serde(default = "default_min_period", with = "humantime_serde")]
    pub min_period_floor: Duration,
}

/// Health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address for the Prometheus metrics endpoint. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "tsbridge".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_telemetry_topics() -> Vec<String> {
    [
        "SC/{User}/{Room}/dht",
        "SC/{User}/{Room}/hr",
        "SC/{User}/{Room}/light",
        "SC/{User}/{Room}/servo/#",
        "SC/{User}/{Room}/led/#",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_alert_topics() -> Vec<String> {
    vec!["SC/alerts/{User}/{Room}/#".to_string()]
}

fn default_reset_topics() -> Vec<String> {
    vec!["SC/{User}/{Room}/initTimeshift".to_string()]
}

fn default_hint_topics() -> Vec<String> {
    vec!["SC/{User}/{Room}/wakeup".to_string()]
}

fn default_alert_marker() -> String {
    "ALERT".to_string()
}

fn default_aliases() -> HashMap<String, String> {
    HashMap::from([("raw".to_string(), "light".to_string())])
}

pub(crate) fn default_fields() -> BTreeMap<String, FieldConfig> {
    [
        ("temp", "field1", FieldKind::Average),
        ("hum", "field2", FieldKind::Average),
        ("bpm", "field3", FieldKind::Average),
        ("light", "field4", FieldKind::Average),
        ("servoFan", "field5", FieldKind::Last),
        ("servoCurtain", "field6", FieldKind::Last),
        ("LedL", "field7", FieldKind::Last),
        ("alerts", "field8", FieldKind::Counter),
    ]
    .into_iter()
    .map(|(name, slot, kind)| {
        (
            name.to_string(),
            FieldConfig {
                slot: slot.to_string(),
                kind,
            },
        )
    })
    .collect()
}

fn default_min_period() -> Duration {
    Duration::from_secs(15)
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_concurrent_flushes() -> usize {
    8
}

fn default_catalog_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_credentials_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_service_id() -> String {
    "tsbridge".to_string()
}

fn default_write_url() -> String {
    "https://api.thingspeak.com/update".to_string()
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            mqtt: MqttConfig::default(),
            channels: ChannelsConfig::default(),
            fields: default_fields(),
            schedule: ScheduleConfig::default(),
            catalog: CatalogConfig::default(),
            sink: SinkConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            keep_alive: default_keep_alive(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            telemetry: default_telemetry_topics(),
            alerts: default_alert_topics(),
            reset: default_reset_topics(),
            hint: default_hint_topics(),
            alert_marker: default_alert_marker(),
            aliases: default_aliases(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            min_period: default_min_period(),
            flush_interval: None,
            tick_interval: default_tick_interval(),
            max_concurrent_flushes: default_max_concurrent_flushes(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: default_catalog_timeout(),
            credentials_ttl: default_credentials_ttl(),
            preload: true,
            register_service: false,
            service_id: default_service_id(),
            write_token: None,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            write_url: default_write_url(),
            timeout: default_sink_timeout(),
            min_period_floor: default_min_period(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.is_empty() {
            bail!("mqtt.host is required");
        }

        if self.mqtt.client_id.is_empty() {
            bail!("mqtt.client_id is required");
        }

        if self.mqtt.channel_capacity == 0 {
            bail!("mqtt.channel_capacity must be positive");
        }

        if self.catalog.url.is_empty() {
            bail!("catalog.url is required");
        }

        if self.catalog.register_service && self.catalog.service_id.is_empty() {
            bail!("catalog.service_id is required when catalog.register_service is enabled");
        }

        if self.sink.write_url.is_empty() {
            bail!("sink.write_url is required");
        }

        if self.sink.timeout.is_zero() {
            bail!("sink.timeout must be positive");
        }

        self.schedule.validate(self.sink.min_period_floor)?;
        self.channels.validate()?;
        validate_fields(&self.fields)?;

        Ok(())
    }
}

impl ScheduleConfig {
    /// Resolves the effective scheduling policy.
    pub fn policy(&self) -> SchedulePolicy {
        SchedulePolicy {
            min_period: self.min_period,
            flush_interval: self.flush_interval.unwrap_or(self.min_period),
        }
    }

    fn validate(&self, floor: Duration) -> Result<()> {
        if self.min_period.is_zero() {
            bail!("schedule.min_period must be positive");
        }

        if self.min_period < floor {
            bail!(
                "schedule.min_period {:?} must be at least sink.min_period_floor {:?}",
                self.min_period,
                floor
            );
        }

        if let Some(interval) = self.flush_interval {
            if interval < self.min_period {
                bail!(
                    "schedule.flush_interval {:?} must be at least schedule.min_period {:?}",
                    interval,
                    self.min_period
                );
            }
        }

        if self.tick_interval.is_zero() {
            bail!("schedule.tick_interval must be positive");
        }

        if self.tick_interval > self.min_period {
            bail!("schedule.tick_interval must not exceed schedule.min_period");
        }

        if self.max_concurrent_flushes == 0 {
            bail!("schedule.max_concurrent_flushes must be positive");
        }

        Ok(())
    }
}

impl ChannelsConfig {
    fn validate(&self) -> Result<()> {
        if self.telemetry.is_empty() {
            bail!("channels.telemetry must list at least one topic pattern");
        }

        if self.alert_marker.trim().is_empty() {
            bail!("channels.alert_marker must not be empty");
        }

        for (category, patterns) in self.categories() {
            for pattern in patterns {
                TopicPattern::parse(pattern)
                    .with_context(|| format!("invalid topic pattern in channels.{category}"))?;
            }
        }

        Ok(())
    }

    /// Pattern lists in match-priority order.
    pub(crate) fn categories(&self) -> [(&'static str, &[String]); 4] {
        [
            ("reset", &self.reset),
            ("hint", &self.hint),
            ("alerts", &self.alerts),
            ("telemetry", &self.telemetry),
        ]
    }
}

fn validate_fields(fields: &BTreeMap<String, FieldConfig>) -> Result<()> {
    if fields.is_empty() {
        bail!("fields must define at least one field");
    }

    let mut slots = HashSet::new();
    let mut counters = Vec::new();

    for (name, field) in fields {
        if name.is_empty() {
            bail!("fields: field names must not be empty");
        }

        if field.slot.is_empty() {
            bail!("fields.{name}.slot is required");
        }

        if !slots.insert(field.slot.as_str()) {
            bail!("fields.{name}.slot {} is used by more than one field", field.slot);
        }

        if field.kind == FieldKind::Counter {
            counters.push(name.as_str());
        }
    }

    if counters.len() > 1 {
        bail!(
            "at most one counter field may be configured, found: {}",
            counters.join(", ")
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            mqtt: MqttConfig {
                host: "localhost".to_string(),
                ..Default::default()
            },
            catalog: CatalogConfig {
                url: "http://localhost:8080".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.keep_alive, Duration::from_secs(30));
        assert_eq!(cfg.schedule.min_period, Duration::from_secs(15));
        assert_eq!(cfg.schedule.tick_interval, Duration::from_secs(1));
        assert_eq!(cfg.schedule.max_concurrent_flushes, 8);
        assert_eq!(cfg.catalog.credentials_ttl, Duration::from_secs(600));
        assert!(cfg.catalog.preload);
        assert!(!cfg.catalog.register_service);
        assert_eq!(cfg.channels.alert_marker, "ALERT");
        assert_eq!(cfg.channels.aliases.get("raw").map(String::as_str), Some("light"));
        assert_eq!(cfg.fields.len(), 8);
        assert_eq!(cfg.health.addr, ":9090");
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate().expect("valid config");
    }

    #[test]
    fn test_flush_interval_defaults_to_min_period() {
        let cfg = valid_config();
        let policy = cfg.schedule.policy();
        assert_eq!(policy.flush_interval, policy.min_period);

        let cfg = Config {
            schedule: ScheduleConfig {
                flush_interval: Some(Duration::from_secs(60)),
                ..Default::default()
            },
            ..valid_config()
        };
        assert_eq!(cfg.schedule.policy().flush_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_mqtt_host() {
        let mut cfg = valid_config();
        cfg.mqtt.host.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("mqtt.host"));
    }

    #[test]
    fn test_missing_catalog_url() {
        let mut cfg = valid_config();
        cfg.catalog.url.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("catalog.url"));
    }

    #[test]
    fn test_min_period_below_sink_floor() {
        let mut cfg = valid_config();
        cfg.schedule.min_period = Duration::from_secs(5);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sink.min_period_floor"));
    }

    #[test]
    fn test_flush_interval_below_min_period() {
        let mut cfg = valid_config();
        cfg.schedule.flush_interval = Some(Duration::from_secs(10));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("schedule.flush_interval"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut cfg = valid_config();
        cfg.schedule.max_concurrent_flushes = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_flushes"));
    }

    #[test]
    fn test_two_counter_fields_rejected() {
        let mut cfg = valid_config();
        cfg.fields.insert(
            "errors".to_string(),
            FieldConfig {
                slot: "field9".to_string(),
                kind: FieldKind::Counter,
            },
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at most one counter"));
    }

    #[test]
    fn test_duplicate_slot_rejected() {
        let mut cfg = valid_config();
        cfg.fields.insert(
            "co2".to_string(),
            FieldConfig {
                slot: "field1".to_string(),
                kind: FieldKind::Average,
            },
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("field1"));
    }

    #[test]
    fn test_invalid_topic_pattern_rejected() {
        let mut cfg = valid_config();
        cfg.channels.hint = vec!["SC/{User}/wakeup".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("channels.hint"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
mqtt:
  host: broker.local
  port: 1884
  keep_alive: 45s
channels:
  telemetry:
    - "home/{User}/{Room}/sensors"
  alert_marker: CRITICAL
fields:
  temp:
    slot: field1
    kind: average
  door:
    slot: field2
    kind: last
  alerts:
    slot: field3
    kind: counter
schedule:
  min_period: 20s
  flush_interval: 1m
  tick_interval: 500ms
catalog:
  url: http://catalog:8080
  credentials_ttl: 2m
  preload: false
sink:
  write_url: http://sink.local/update
  timeout: 3s
health:
  addr: ":9191"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        cfg.validate().expect("valid");

        assert_eq!(cfg.mqtt.host, "broker.local");
        assert_eq!(cfg.mqtt.port, 1884);
        assert_eq!(cfg.mqtt.keep_alive, Duration::from_secs(45));
        assert_eq!(cfg.channels.telemetry, vec!["home/{User}/{Room}/sensors"]);
        assert_eq!(cfg.channels.alerts, default_alert_topics());
        assert_eq!(cfg.channels.alert_marker, "CRITICAL");
        assert_eq!(cfg.fields.len(), 3);
        assert_eq!(cfg.fields["door"].kind, FieldKind::Last);
        assert_eq!(cfg.schedule.min_period, Duration::from_secs(20));
        assert_eq!(cfg.schedule.flush_interval, Some(Duration::from_secs(60)));
        assert_eq!(cfg.schedule.tick_interval, Duration::from_millis(500));
        assert_eq!(cfg.catalog.credentials_ttl, Duration::from_secs(120));
        assert!(!cfg.catalog.preload);
        assert_eq!(cfg.sink.timeout, Duration::from_secs(3));
        assert_eq!(cfg.health.addr, ":9191");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "mqtt:\n  host: localhost\ncatalog:\n  url: http://localhost:8080\n",
        )
        .expect("write config");

        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.mqtt.host, "localhost");
        assert_eq!(cfg.fields, default_fields());
    }

    #[test]
    fn test_example_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.example.yaml");
        let cfg = Config::load(&path).expect("load example");
        assert_eq!(cfg.fields, default_fields());
        assert_eq!(cfg.schedule.policy().flush_interval, Duration::from_secs(15));
        assert_eq!(cfg.catalog.credentials_ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "mqtt:\n  host: localhost\n").expect("write config");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("catalog.url"));
    }
}
