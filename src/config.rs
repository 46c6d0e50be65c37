//! Bridge configuration.
//!
//! Loaded from YAML, then overlaid with `BOSUN_*` environment variables.
//!
//! ```yaml
//! signalk:
//!   host: openplotter.local
//!   port: 3000
//! mqtt:
//!   host: homeassistant.local
//!   username: bosun
//!   password: secret
//! raw_mode: false
//! publish_interval_ms: 1000
//! sensors:
//!   - path: environment.outside.temperature
//!     name: Outside Air
//!   - path: electrical.batteries.*.voltage
//!     icon: mdi:car-battery
//!   - path: navigation.gnss.antennaAltitude
//!     enabled: false
//! ```
//!
//! `sensors` is a list on purpose: wildcard patterns are tried in the order
//! they appear here.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signalk: SignalKConfig,
    pub mqtt: MqttConfig,
    /// Publish values exactly as received: no unit transforms, no rounding.
    pub raw_mode: bool,
    /// Minimum spacing between two state publications of the same sensor.
    pub publish_interval_ms: u64,
    /// Upper bound for registry and metadata HTTP calls.
    pub http_timeout_ms: u64,
    pub registry_refresh_secs: u64,
    pub sensors: Vec<SensorEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signalk: SignalKConfig::default(),
            mqtt: MqttConfig::default(),
            raw_mode: false,
            publish_interval_ms: 1000,
            http_timeout_ms: 5000,
            registry_refresh_secs: 300,
            sensors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalKConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub token: Option<String>,
    /// `self` or `all` (other vessels too).
    pub subscribe: String,
}

impl Default for SignalKConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            tls: false,
            token: None,
            subscribe: "self".to_string(),
        }
    }
}

impl SignalKConfig {
    /// `http://host:port/signalk/v1/api`
    pub fn api_base(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}/signalk/v1/api", scheme, self.host, self.port)
    }

    pub fn stream_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        let mut url = format!(
            "{}://{}:{}/signalk/v1/stream?subscribe={}&sendMeta=all",
            scheme, self.host, self.port, self.subscribe
        );
        if let Some(token) = &self.token {
            url.push_str("&token=");
            url.push_str(token);
        }
        url
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    /// Home Assistant discovery prefix; also prefixes state topics.
    pub discovery_prefix: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: None,
            discovery_prefix: "homeassistant".to_string(),
            keep_alive_secs: 30,
        }
    }
}

/// One row of the static sensor table, keyed by exact path or a pattern
/// with a single `*` segment.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub path: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Effective configuration of one sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    pub enabled: bool,
    pub name: String,
    pub device_class: Option<String>,
    pub unit: Option<String>,
    pub icon: Option<String>,
}

impl Config {
    /// Read `path` if it exists, fall back to defaults otherwise, then apply
    /// environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_yaml::from_str::<Config>(&contents)?
        } else {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            Config::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay `BOSUN_*` variables. Unparseable numbers are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("BOSUN_SIGNALK_HOST") {
            self.signalk.host = host;
        }
        if let Some(port) = lookup("BOSUN_SIGNALK_PORT").and_then(|p| p.parse().ok()) {
            self.signalk.port = port;
        }
        if let Some(token) = lookup("BOSUN_SIGNALK_TOKEN") {
            self.signalk.token = Some(token);
        }
        if let Some(host) = lookup("BOSUN_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("BOSUN_MQTT_PORT").and_then(|p| p.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(user) = lookup("BOSUN_MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(pass) = lookup("BOSUN_MQTT_PASSWORD") {
            self.mqtt.password = Some(pass);
        }
        if let Some(raw) = lookup("BOSUN_RAW_MODE") {
            self.raw_mode = matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(ms) = lookup("BOSUN_PUBLISH_INTERVAL_MS").and_then(|p| p.parse().ok()) {
            self.publish_interval_ms = ms;
        }
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}
