//! Metadata inference: decides device class, target unit, icon and the
//! numeric transform for a path that has no explicit sensor config.
//!
//! Two tiers:
//! 1. `meta.units` from the source, looked up in [`UNIT_TABLE`]. This is the
//!    only tier that produces a non-identity transform.
//! 2. An ordered list of path rules ([`PATH_RULES`]). Order matters: the
//!    first matching rule wins, so e.g. a course-to-waypoint *distance* is
//!    classified as a distance before the angle rule sees the word "course".

use std::f64::consts::PI;
use std::ops::RangeInclusive;

use serde_json::Value;

use crate::delta::{is_position_path, is_timestamp_path, MetaInfo};

/// Converted temperatures outside this range (°C) are suspicious.
pub const SANE_TEMPERATURE_C: RangeInclusive<f64> = -50.0..=100.0;

/// Numeric conversion from the source unit to the published unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    #[default]
    Identity,
    KelvinToCelsius,
    FahrenheitToCelsius,
    RadiansToDegrees,
}

impl Transform {
    pub fn apply(self, v: f64) -> f64 {
        match self {
            Transform::Identity => v,
            Transform::KelvinToCelsius => v - 273.15,
            Transform::FahrenheitToCelsius => (v - 32.0) * 5.0 / 9.0,
            Transform::RadiansToDegrees => v * 180.0 / PI,
        }
    }
}

/// Result of inference for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inference {
    pub device_class: Option<&'static str>,
    pub unit: Option<&'static str>,
    pub icon: &'static str,
    pub transform: Transform,
}

struct UnitRule {
    units: &'static [&'static str],
    device_class: Option<&'static str>,
    unit: &'static str,
    icon: &'static str,
    transform: Transform,
}

const UNIT_TABLE: &[UnitRule] = &[
    UnitRule {
        units: &["K"],
        device_class: Some("temperature"),
        unit: "°C",
        icon: "mdi:thermometer",
        transform: Transform::KelvinToCelsius,
    },
    UnitRule {
        units: &["°C", "C"],
        device_class: Some("temperature"),
        unit: "°C",
        icon: "mdi:thermometer",
        transform: Transform::Identity,
    },
    UnitRule {
        units: &["°F", "F"],
        device_class: Some("temperature"),
        unit: "°C",
        icon: "mdi:thermometer",
        transform: Transform::FahrenheitToCelsius,
    },
    // Disambiguated into wind_speed by path in `from_units`.
    UnitRule {
        units: &["m/s"],
        device_class: Some("speed"),
        unit: "m/s",
        icon: "mdi:speedometer",
        transform: Transform::Identity,
    },
    UnitRule {
        units: &["m"],
        device_class: Some("distance"),
        unit: "m",
        icon: "mdi:ruler",
        transform: Transform::Identity,
    },
    UnitRule {
        units: &["rad"],
        device_class: None,
        unit: "°",
        icon: "mdi:compass-outline",
        transform: Transform::RadiansToDegrees,
    },
    UnitRule {
        units: &["V"],
        device_class: Some("voltage"),
        unit: "V",
        icon: "mdi:flash",
        transform: Transform::Identity,
    },
    UnitRule {
        units: &["A"],
        device_class: Some("current"),
        unit: "A",
        icon: "mdi:current-dc",
        transform: Transform::Identity,
    },
    UnitRule {
        units: &["Pa"],
        device_class: Some("pressure"),
        unit: "Pa",
        icon: "mdi:gauge",
        transform: Transform::Identity,
    },
];

/// Look up authoritative source units. `None` if the units are not known.
pub fn from_units(units: &str, path: &str) -> Option<Inference> {
    let rule = UNIT_TABLE.iter().find(|r| r.units.contains(&units))?;
    let mut inference = Inference {
        device_class: rule.device_class,
        unit: Some(rule.unit),
        icon: rule.icon,
        transform: rule.transform,
    };
    if units == "m/s" && path.contains("wind") {
        inference.device_class = Some("wind_speed");
        inference.icon = "mdi:weather-windy";
    }
    Some(inference)
}

/// The transform implied by a path's metadata, identity when unknown.
pub fn transform_for(path: &str, meta: Option<&MetaInfo>) -> Transform {
    meta.and_then(|m| m.units.as_deref())
        .and_then(|units| from_units(units, path))
        .map(|i| i.transform)
        .unwrap_or_default()
}

/// One heuristic classification, tried in declaration order.
pub struct PathRule {
    pub name: &'static str,
    matches: fn(&str) -> bool,
    device_class: Option<&'static str>,
    unit: Option<&'static str>,
    icon: &'static str,
}

fn last_segment(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

pub const PATH_RULES: &[PathRule] = &[
    PathRule {
        name: "timestamp",
        matches: is_timestamp_path,
        device_class: Some("timestamp"),
        unit: None,
        icon: "mdi:clock-outline",
    },
    PathRule {
        name: "temperature",
        matches: |p| p.contains("temperature"),
        device_class: Some("temperature"),
        unit: Some("°C"),
        icon: "mdi:thermometer",
    },
    PathRule {
        name: "speed",
        matches: |p| p.contains("speed") && !p.contains("wind"),
        device_class: Some("speed"),
        unit: Some("m/s"),
        icon: "mdi:speedometer",
    },
    PathRule {
        name: "depth",
        matches: |p| p.contains("depth"),
        device_class: Some("distance"),
        unit: Some("m"),
        icon: "mdi:waves",
    },
    PathRule {
        name: "distance",
        matches: |p| p.contains("distance") || last_segment(p) == "log",
        device_class: Some("distance"),
        unit: Some("m"),
        icon: "mdi:map-marker-distance",
    },
    PathRule {
        name: "voltage",
        matches: |p| p.contains("voltage"),
        device_class: Some("voltage"),
        unit: Some("V"),
        icon: "mdi:flash",
    },
    // Only a trailing `current` segment: `currentLevel` is a tank ratio.
    PathRule {
        name: "current",
        matches: |p| last_segment(p) == "current",
        device_class: Some("current"),
        unit: Some("A"),
        icon: "mdi:current-dc",
    },
    PathRule {
        name: "pressure",
        matches: |p| p.contains("pressure"),
        device_class: Some("pressure"),
        unit: Some("Pa"),
        icon: "mdi:gauge",
    },
    PathRule {
        name: "angle",
        matches: |p| {
            ["heading", "course", "angle", "bearing", "direction"]
                .iter()
                .any(|w| p.contains(w))
        },
        device_class: None,
        unit: Some("rad"),
        icon: "mdi:compass",
    },
    PathRule {
        name: "position",
        matches: |p| is_position_path(p) || p.contains(".position."),
        device_class: None,
        unit: None,
        icon: "mdi:crosshairs-gps",
    },
    PathRule {
        name: "satellites",
        matches: |p| p.contains("satellites"),
        device_class: None,
        unit: None,
        icon: "mdi:satellite-variant",
    },
    PathRule {
        name: "wind_speed",
        matches: |p| p.contains("wind") && p.contains("speed"),
        device_class: Some("wind_speed"),
        unit: Some("m/s"),
        icon: "mdi:weather-windy",
    },
    PathRule {
        name: "wind",
        matches: |p| p.contains("wind"),
        device_class: None,
        unit: None,
        icon: "mdi:weather-windy",
    },
];

/// First heuristic rule matching `path`, if any.
pub fn matching_rule(path: &str) -> Option<&'static PathRule> {
    let lowered = path.to_ascii_lowercase();
    PATH_RULES.iter().find(|rule| (rule.matches)(&lowered))
}

/// Infer metadata for `path`, preferring source units over heuristics.
pub fn infer(path: &str, value: &Value, meta: Option<&MetaInfo>) -> Inference {
    if let Some(inference) = meta
        .and_then(|m| m.units.as_deref())
        .and_then(|units| from_units(units, path))
    {
        return inference;
    }

    if let Some(rule) = matching_rule(path) {
        tracing::trace!(path, rule = rule.name, "Heuristic rule matched");
        return Inference {
            device_class: rule.device_class,
            unit: rule.unit,
            icon: rule.icon,
            transform: Transform::Identity,
        };
    }

    let icon = if value.is_boolean() {
        "mdi:toggle-switch"
    } else {
        "mdi:gauge"
    };
    Inference {
        device_class: None,
        unit: None,
        icon,
        transform: Transform::Identity,
    }
}
