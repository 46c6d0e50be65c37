//! Home Assistant MQTT discovery for bridged sensors.
//!
//! Each (source, path) pair becomes one `sensor` entity, announced once per
//! process at `<prefix>/sensor/<deviceId>/<sensorId>/config` with the retain
//! flag set. All sensors of one source share a device block, and every device
//! hangs off the bridge itself via `via_device`.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::bus::Publisher;
use crate::convert::display_precision;
use crate::delta::{is_position_path, is_timestamp_path, SourceDescriptor};
use crate::error::Result;
use crate::inference::Transform;
use crate::registry::{DeviceInfo, DeviceRegistry};
use crate::resolver::ResolvedSensor;
use crate::throttle::SensorKey;

/// Identifier of the bridge device every source device is attached to.
pub const BRIDGE_ID: &str = "bosun_bridge";

const RAW_SUFFIX: &str = " (raw)";

/// Config payload for one sensor entity.
#[derive(Debug, Serialize)]
pub struct DiscoveryPayload {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    pub device: DevicePayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_display_precision: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_attributes_topic: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DevicePayload {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub via_device: &'static str,
}

pub struct DiscoveryEmitter {
    prefix: String,
    raw_mode: bool,
    discovered: DashMap<SensorKey, ()>,
}

impl DiscoveryEmitter {
    pub fn new(prefix: impl Into<String>, raw_mode: bool) -> Self {
        Self {
            prefix: prefix.into(),
            raw_mode,
            discovered: DashMap::new(),
        }
    }

    pub fn is_discovered(&self, key: &SensorKey) -> bool {
        self.discovered.contains_key(key)
    }

    pub fn discovered_count(&self) -> usize {
        self.discovered.len()
    }

    pub fn state_topic(&self, key: &SensorKey) -> String {
        format!(
            "{}/sensor/{}/{}/state",
            self.prefix,
            device_id(&key.source_id),
            sensor_id(&key.path)
        )
    }

    pub fn config_topic(&self, key: &SensorKey) -> String {
        format!(
            "{}/sensor/{}/{}/config",
            self.prefix,
            device_id(&key.source_id),
            sensor_id(&key.path)
        )
    }

    /// Announce `key` unless already done. Returns `Ok(true)` when a payload
    /// went out now. The key is only marked after the publisher accepted it,
    /// so a failed announcement is retried with the next value.
    pub fn maybe_publish(
        &self,
        key: &SensorKey,
        sensor: &ResolvedSensor,
        source: &SourceDescriptor,
        sample: &Value,
        registry: &DeviceRegistry,
        publisher: &dyn Publisher,
    ) -> Result<bool> {
        if self.is_discovered(key) {
            return Ok(false);
        }

        let payload = self.build(key, sensor, source, sample, registry);
        let body = serde_json::to_string(&payload)?;
        let topic = self.config_topic(key);
        publisher.publish_discovery(&topic, body)?;

        self.discovered.insert(key.clone(), ());
        tracing::info!(sensor = %key, topic = %topic, origin = ?sensor.origin, "Discovery published");
        Ok(true)
    }

    pub fn build(
        &self,
        key: &SensorKey,
        sensor: &ResolvedSensor,
        source: &SourceDescriptor,
        sample: &Value,
        registry: &DeviceRegistry,
    ) -> DiscoveryPayload {
        let path = key.path.as_str();
        let config = &sensor.config;
        let state_topic = self.state_topic(key);
        let device_id = device_id(&key.source_id);
        // a position that has not produced a fix yet still gets the template
        let structured = is_position_path(path) && (sample.is_object() || sample.is_null());
        let timestamp =
            is_timestamp_path(path) || config.device_class.as_deref() == Some("timestamp");
        let numeric = is_numeric(sensor, sample) && !structured && !timestamp;

        let (name, device_class, unit, precision) = if self.raw_mode {
            (
                format!("{}{}", config.name, RAW_SUFFIX),
                None,
                sensor.source_units.clone().or_else(|| config.unit.clone()),
                None,
            )
        } else {
            (
                config.name.clone(),
                config.device_class.clone(),
                config.unit.clone(),
                numeric.then(|| display_precision(path, config)).flatten(),
            )
        };

        let state_class = numeric.then_some("measurement");

        DiscoveryPayload {
            name,
            unique_id: format!("{}_{}", device_id, sensor_id(path)),
            device: device_block(source, registry.lookup_source(source)),
            device_class,
            unit_of_measurement: unit,
            suggested_display_precision: precision,
            icon: config.icon.clone(),
            state_class,
            value_template: structured.then(|| "{{ value_json.latitude }}".to_string()),
            json_attributes_topic: structured.then(|| state_topic.clone()),
            state_topic,
        }
    }
}

/// Device classes whose states are always numbers.
const NUMERIC_CLASSES: &[&str] = &[
    "temperature",
    "speed",
    "wind_speed",
    "distance",
    "voltage",
    "current",
    "pressure",
];

/// Whether the sensor reports numbers, judged from its resolved config first.
/// The sample only decides when the config says nothing, since the first
/// value seen may well be `null`.
pub fn is_numeric(sensor: &ResolvedSensor, sample: &Value) -> bool {
    let config = &sensor.config;
    let class = config.device_class.as_deref();
    if class.is_some_and(|c| NUMERIC_CLASSES.contains(&c))
        || config.unit.is_some()
        || sensor.transform != Transform::Identity
    {
        return true;
    }
    if class.is_some() {
        return false;
    }
    sample.is_number()
}

fn device_block(source: &SourceDescriptor, known: Option<DeviceInfo>) -> DevicePayload {
    let known = known.unwrap_or_default();
    let generic = format!("N2K Source {}", source.id);

    let name = known.name.unwrap_or_else(|| {
        let qualified = source.id.starts_with(&format!("{}.", source.label));
        if !source.label.is_empty() && source.label != source.id && !qualified {
            source.label.clone()
        } else {
            generic.clone()
        }
    });
    let manufacturer = known
        .manufacturer
        .or_else(|| source.manufacturer.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let model = known
        .model
        .or_else(|| source.model.clone())
        .unwrap_or(generic);

    DevicePayload {
        identifiers: vec![format!("device:{}", source.id)],
        name,
        manufacturer,
        model,
        via_device: BRIDGE_ID,
    }
}

/// `n2k_src_<sourceId>` with topic-unsafe characters replaced by `_`.
pub fn device_id(source_id: &str) -> String {
    let safe: String = source_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("n2k_src_{}", safe)
}

/// Path as an object id: `.` → `_`, `*` → `wildcard`.
pub fn sensor_id(path: &str) -> String {
    path.replace('.', "_").replace('*', "wildcard")
}
