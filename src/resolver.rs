//! Sensor config resolution.
//!
//! Order, first match wins:
//! 1. an exact path entry from the sensor table;
//! 2. wildcard entries, in the order they are declared in the config file.
//!    Two overlapping patterns (`electrical.batteries.*.voltage` and
//!    `electrical.*.0.voltage`) both match `electrical.batteries.0.voltage`;
//!    whichever is listed first wins;
//! 3. an auto-generated config from [`crate::inference`].
//!
//! The result for a path is computed once, from the value and metadata seen
//! at first observation, and then reused for the life of the process.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::config::{SensorConfig, SensorEntry};
use crate::delta::MetaInfo;
use crate::inference::{self, Transform};

/// Where a resolved config came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    Exact,
    Wildcard(String),
    Inferred,
}

/// A sensor config plus the conversion fixed at first observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSensor {
    pub config: SensorConfig,
    pub transform: Transform,
    /// Units reported by the source, before any transform.
    pub source_units: Option<String>,
    pub origin: ConfigOrigin,
}

pub struct SensorResolver {
    exact: HashMap<String, SensorEntry>,
    wildcards: Vec<SensorEntry>,
    resolved: DashMap<String, Arc<ResolvedSensor>>,
}

impl SensorResolver {
    pub fn new(entries: &[SensorEntry]) -> Self {
        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();
        for entry in entries {
            if entry.path.split('.').any(|seg| seg == "*") {
                wildcards.push(entry.clone());
            } else {
                // first declaration of a path wins
                exact.entry(entry.path.clone()).or_insert_with(|| entry.clone());
            }
        }
        Self {
            exact,
            wildcards,
            resolved: DashMap::new(),
        }
    }

    /// Previously resolved config for `path`, if any.
    pub fn cached(&self, path: &str) -> Option<Arc<ResolvedSensor>> {
        self.resolved.get(path).map(|e| Arc::clone(e.value()))
    }

    /// Resolve `path`, computing and caching the result on first call.
    pub fn resolve(&self, path: &str, value: &Value, meta: Option<&MetaInfo>) -> Arc<ResolvedSensor> {
        let entry = self
            .resolved
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(self.compute(path, value, meta)));
        Arc::clone(entry.value())
    }

    /// The static table entry governing `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<(&SensorEntry, ConfigOrigin)> {
        if let Some(entry) = self.exact.get(path) {
            return Some((entry, ConfigOrigin::Exact));
        }
        self.wildcards
            .iter()
            .find(|entry| wildcard_matches(&entry.path, path))
            .map(|entry| (entry, ConfigOrigin::Wildcard(entry.path.clone())))
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    fn compute(&self, path: &str, value: &Value, meta: Option<&MetaInfo>) -> ResolvedSensor {
        let source_units = meta.and_then(|m| m.units.clone());

        if let Some((entry, origin)) = self.lookup(path) {
            tracing::debug!(path, ?origin, "Sensor config from table");
            return ResolvedSensor {
                config: SensorConfig {
                    enabled: entry.enabled,
                    name: entry.name.clone().unwrap_or_else(|| display_name(path)),
                    device_class: entry.device_class.clone(),
                    unit: entry.unit.clone(),
                    icon: entry.icon.clone(),
                },
                transform: inference::transform_for(path, meta),
                source_units,
                origin,
            };
        }

        let inferred = inference::infer(path, value, meta);
        tracing::debug!(
            path,
            device_class = ?inferred.device_class,
            unit = ?inferred.unit,
            "Sensor config inferred"
        );
        ResolvedSensor {
            config: SensorConfig {
                enabled: true,
                name: display_name(path),
                device_class: inferred.device_class.map(String::from),
                unit: inferred.unit.map(String::from),
                icon: Some(inferred.icon.to_string()),
            },
            transform: inferred.transform,
            source_units,
            origin: ConfigOrigin::Inferred,
        }
    }
}

/// Segment-wise match: each `*` in `pattern` stands for exactly one
/// non-empty path segment, every other segment must be equal.
pub fn wildcard_matches(pattern: &str, path: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut segs = path.split('.');
    loop {
        match (pat.next(), segs.next()) {
            (None, None) => return true,
            (Some("*"), Some(seg)) if !seg.is_empty() => continue,
            (Some(p), Some(seg)) if p == seg => continue,
            _ => return false,
        }
    }
}

/// Human readable name from the tail of a path.
///
/// `environment.water.temperature` → "Water Temperature",
/// `navigation.speedOverGround` → "Speed Over Ground",
/// `electrical.batteries.0.voltage` → "Batteries 0 Voltage".
pub fn display_name(path: &str) -> String {
    const GROUPS: &[&str] = &[
        "communication",
        "design",
        "electrical",
        "environment",
        "navigation",
        "notifications",
        "performance",
        "propulsion",
        "sails",
        "sensors",
        "steering",
        "tanks",
    ];

    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let mut start = segments.len().saturating_sub(2);
    // keep the instance name together with its index
    if start > 0 && segments[start].chars().all(|c| c.is_ascii_digit()) {
        start -= 1;
    }
    if segments.len() - start > 1 && GROUPS.contains(&segments[start]) {
        start += 1;
    }

    segments[start..]
        .iter()
        .flat_map(|seg| split_words(seg))
        .map(|word| title_case(&word))
        .collect::<Vec<_>>()
        .join(" ")
}

fn split_words(segment: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in segment.chars() {
        if c == '_' || c == '-' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(path: &str) -> SensorEntry {
        SensorEntry {
            path: path.to_string(),
            enabled: true,
            name: None,
            device_class: None,
            unit: None,
            icon: None,
        }
    }

    fn named(path: &str, name: &str) -> SensorEntry {
        SensorEntry {
            name: Some(name.to_string()),
            ..entry(path)
        }
    }

    #[test]
    fn test_wildcard_matches() {
        let pattern = "electrical.batteries.*.voltage";
        assert!(wildcard_matches(pattern, "electrical.batteries.0.voltage"));
        assert!(wildcard_matches(pattern, "electrical.batteries.1.voltage"));
        assert!(wildcard_matches(pattern, "electrical.batteries.house.voltage"));
        assert!(!wildcard_matches(pattern, "electrical.batteries.0.current"));
        assert!(!wildcard_matches(pattern, "electrical.batteries.voltage"));
        assert!(!wildcard_matches(pattern, "electrical.batteries.0.1.voltage"));
        assert!(!wildcard_matches(pattern, "electrical.batteries..voltage"));
    }

    #[test]
    fn test_exact_entry_beats_wildcard() {
        let resolver = SensorResolver::new(&[
            named("electrical.batteries.*.voltage", "Any Battery"),
            named("electrical.batteries.0.voltage", "House Bank"),
        ]);
        let resolved = resolver.resolve("electrical.batteries.0.voltage", &json!(12.6), None);
        assert_eq!(resolved.config.name, "House Bank");
        assert_eq!(resolved.origin, ConfigOrigin::Exact);

        let other = resolver.resolve("electrical.batteries.1.voltage", &json!(12.6), None);
        assert_eq!(other.config.name, "Any Battery");
    }

    #[test]
    fn test_first_declared_wildcard_wins() {
        let path = "electrical.batteries.0.voltage";

        let resolver = SensorResolver::new(&[
            named("electrical.batteries.*.voltage", "By Bank"),
            named("electrical.*.0.voltage", "By Index"),
        ]);
        let (hit, origin) = resolver.lookup(path).unwrap();
        assert_eq!(hit.name.as_deref(), Some("By Bank"));
        assert_eq!(origin, ConfigOrigin::Wildcard("electrical.batteries.*.voltage".to_string()));

        let reversed = SensorResolver::new(&[
            named("electrical.*.0.voltage", "By Index"),
            named("electrical.batteries.*.voltage", "By Bank"),
        ]);
        assert_eq!(reversed.lookup(path).unwrap().0.name.as_deref(), Some("By Index"));
    }

    #[test]
    fn test_table_entry_without_name_gets_derived_name() {
        let resolver = SensorResolver::new(&[SensorEntry {
            icon: Some("mdi:car-battery".to_string()),
            ..entry("electrical.batteries.*.voltage")
        }]);
        let resolved = resolver.resolve(
            "electrical.batteries.1.voltage",
            &json!(12.1),
            Some(&MetaInfo::with_units("V")),
        );
        assert_eq!(resolved.config.name, "Batteries 1 Voltage");
        assert_eq!(resolved.config.icon.as_deref(), Some("mdi:car-battery"));
        assert_eq!(resolved.config.device_class, None);
        assert_eq!(resolved.transform, Transform::Identity);
    }

    #[test]
    fn test_table_entry_still_gets_meta_transform() {
        let resolver = SensorResolver::new(&[named("environment.water.temperature", "Sea")]);
        let resolved = resolver.resolve(
            "environment.water.temperature",
            &json!(290.0),
            Some(&MetaInfo::with_units("K")),
        );
        assert_eq!(resolved.transform, Transform::KelvinToCelsius);
        assert_eq!(resolved.source_units.as_deref(), Some("K"));
    }

    #[test]
    fn test_auto_generated_config() {
        let resolver = SensorResolver::new(&[]);
        let resolved = resolver.resolve(
            "environment.water.temperature",
            &json!(293.15),
            Some(&MetaInfo::with_units("K")),
        );
        assert_eq!(resolved.origin, ConfigOrigin::Inferred);
        assert!(resolved.config.enabled);
        assert_eq!(resolved.config.name, "Water Temperature");
        assert_eq!(resolved.config.device_class.as_deref(), Some("temperature"));
        assert_eq!(resolved.config.unit.as_deref(), Some("°C"));
        assert_eq!(resolved.config.icon.as_deref(), Some("mdi:thermometer"));
        assert_eq!(resolved.transform, Transform::KelvinToCelsius);
    }

    #[test]
    fn test_resolution_is_fixed_at_first_observation() {
        let resolver = SensorResolver::new(&[]);
        let first = resolver.resolve(
            "navigation.headingTrue",
            &json!(1.0),
            Some(&MetaInfo::with_units("rad")),
        );
        let second = resolver.resolve("navigation.headingTrue", &json!(2.0), None);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.transform, Transform::RadiansToDegrees);
        assert_eq!(resolver.resolved_count(), 1);
        assert!(resolver.cached("navigation.headingTrue").is_some());
        assert!(resolver.cached("navigation.headingMagnetic").is_none());
    }

    #[test]
    fn test_disabled_entry() {
        let resolver = SensorResolver::new(&[SensorEntry {
            enabled: false,
            ..entry("navigation.gnss.antennaAltitude")
        }]);
        let resolved = resolver.resolve("navigation.gnss.antennaAltitude", &json!(3.0), None);
        assert!(!resolved.config.enabled);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(display_name("environment.water.temperature"), "Water Temperature");
        assert_eq!(display_name("navigation.speedOverGround"), "Speed Over Ground");
        assert_eq!(display_name("environment.depth.belowKeel"), "Depth Below Keel");
        assert_eq!(display_name("navigation.attitude.roll"), "Attitude Roll");
        assert_eq!(display_name("electrical.batteries.0.voltage"), "Batteries 0 Voltage");
        assert_eq!(display_name("propulsion.port_engine.oilPressure"), "Port Engine Oil Pressure");
        assert_eq!(display_name("uptime"), "Uptime");
    }
}
