//! Turns a telemetry value into the string published on a state topic.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::SensorConfig;
use crate::delta::{is_position_path, is_timestamp_path};
use crate::inference::SANE_TEMPERATURE_C;
use crate::resolver::ResolvedSensor;

/// Published for absent and non-finite values.
pub const UNKNOWN: &str = "unknown";

/// State document for position sensors.
#[derive(Debug, Serialize)]
struct PositionState {
    /// "lat, lon" with 6 decimals, for display.
    position: String,
    latitude: f64,
    longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    altitude: Option<f64>,
}

pub struct ValueConverter {
    raw_mode: bool,
    /// Temperatures published despite failing the sanity range.
    suspicious: AtomicU64,
}

impl ValueConverter {
    pub fn new(raw_mode: bool) -> Self {
        Self {
            raw_mode,
            suspicious: AtomicU64::new(0),
        }
    }

    pub fn raw_mode(&self) -> bool {
        self.raw_mode
    }

    pub fn suspicious_count(&self) -> u64 {
        self.suspicious.load(Ordering::Relaxed)
    }

    /// Wire representation of `value` for the sensor at `path`.
    pub fn convert(&self, path: &str, value: &Value, sensor: &ResolvedSensor) -> String {
        match value {
            Value::Null => UNKNOWN.to_string(),
            Value::Object(members) if is_position_path(path) && has_lat_lon(members) => {
                position_state(members)
            }
            _ if is_timestamp_path(path)
                || sensor.config.device_class.as_deref() == Some("timestamp") =>
            {
                format_timestamp(value)
            }
            Value::Number(n) => match n.as_f64() {
                Some(v) => self.format_number(path, v, sensor),
                None => UNKNOWN.to_string(),
            },
            Value::Object(_) | Value::Array(_) => value.to_string(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
        }
    }

    /// Transform and round a numeric reading. Raw mode skips both.
    pub fn format_number(&self, path: &str, v: f64, sensor: &ResolvedSensor) -> String {
        if !v.is_finite() {
            return UNKNOWN.to_string();
        }
        if self.raw_mode {
            return v.to_string();
        }

        let converted = sensor.transform.apply(v);
        if !converted.is_finite() {
            return UNKNOWN.to_string();
        }

        if sensor.config.device_class.as_deref() == Some("temperature")
            && temperature_suspicious(converted)
        {
            self.suspicious.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                path,
                raw = v,
                converted,
                units = ?sensor.source_units,
                "Temperature outside plausible range, source units may be wrong"
            );
        }

        match display_precision(path, &sensor.config) {
            Some(decimals) => format!("{:.*}", decimals, converted),
            None => converted.to_string(),
        }
    }
}

/// A converted °C reading outside the plausible range usually means the
/// source reported the wrong units. Such values are logged, never altered.
pub fn temperature_suspicious(celsius: f64) -> bool {
    !SANE_TEMPERATURE_C.contains(&celsius)
}

/// Decimal places a converted value is rounded to; `None` means never round.
pub fn display_precision(path: &str, config: &SensorConfig) -> Option<usize> {
    if is_position_path(path) || path.contains(".position.") {
        return None;
    }
    match config.device_class.as_deref() {
        Some("pressure") => return Some(2),
        Some("temperature" | "speed" | "wind_speed" | "distance") => return Some(1),
        _ => {}
    }
    match config.unit.as_deref() {
        Some("°" | "rad") => Some(1),
        _ => Some(2),
    }
}

fn has_lat_lon(members: &Map<String, Value>) -> bool {
    members.get("latitude").is_some_and(Value::is_number)
        && members.get("longitude").is_some_and(Value::is_number)
}

fn position_state(members: &Map<String, Value>) -> String {
    let latitude = members.get("latitude").and_then(Value::as_f64);
    let longitude = members.get("longitude").and_then(Value::as_f64);
    let (Some(latitude), Some(longitude)) = (latitude, longitude) else {
        return UNKNOWN.to_string();
    };
    if !latitude.is_finite() || !longitude.is_finite() {
        return UNKNOWN.to_string();
    }

    let state = PositionState {
        position: format!("{:.6}, {:.6}", latitude, longitude),
        latitude,
        longitude,
        altitude: members
            .get("altitude")
            .and_then(Value::as_f64)
            .filter(|a| a.is_finite()),
    };
    serde_json::to_string(&state).unwrap_or_else(|_| UNKNOWN.to_string())
}

/// RFC 3339 in UTC. Strings are re-formatted when parseable and passed through
/// otherwise; numbers are epoch seconds, or milliseconds when large enough.
fn format_timestamp(value: &Value) -> String {
    match value {
        Value::Null => UNKNOWN.to_string(),
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => ts
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Err(_) => s.clone(),
        },
        Value::Number(n) => {
            let Some(v) = n.as_f64().filter(|v| v.is_finite()) else {
                return UNKNOWN.to_string();
            };
            let millis = if v.abs() >= 1e11 { v } else { v * 1000.0 };
            DateTime::<Utc>::from_timestamp_millis(millis as i64)
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
                .unwrap_or_else(|| UNKNOWN.to_string())
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::MetaInfo;
    use crate::resolver::SensorResolver;
    use serde_json::json;

    fn sensor(path: &str, value: &Value, units: Option<&str>) -> ResolvedSensor {
        let meta = units.map(MetaInfo::with_units);
        let resolver = SensorResolver::new(&[]);
        (*resolver.resolve(path, value, meta.as_ref())).clone()
    }

    fn convert(raw: bool, path: &str, value: Value, units: Option<&str>) -> String {
        let s = sensor(path, &value, units);
        ValueConverter::new(raw).convert(path, &value, &s)
    }

    #[test]
    fn test_kelvin_to_celsius_one_decimal() {
        assert_eq!(
            convert(false, "environment.water.temperature", json!(293.15), Some("K")),
            "20.0"
        );
    }

    #[test]
    fn test_radians_to_degrees() {
        assert_eq!(
            convert(false, "navigation.headingTrue", json!(1.5708), Some("rad")),
            "90.0"
        );
    }

    #[test]
    fn test_raw_mode_bypasses_transform_and_rounding() {
        assert_eq!(
            convert(true, "environment.water.temperature", json!(293.15), Some("K")),
            "293.15"
        );
        assert_eq!(
            convert(true, "navigation.headingTrue", json!(1.570796), Some("rad")),
            "1.570796"
        );
    }

    #[test]
    fn test_non_finite_is_unknown_in_any_mode() {
        let s = sensor("environment.water.temperature", &json!(1.0), Some("K"));
        for raw in [false, true] {
            let conv = ValueConverter::new(raw);
            assert_eq!(conv.format_number("environment.water.temperature", f64::NAN, &s), UNKNOWN);
            assert_eq!(
                conv.format_number("environment.water.temperature", f64::INFINITY, &s),
                UNKNOWN
            );
            assert_eq!(
                conv.format_number("environment.water.temperature", f64::NEG_INFINITY, &s),
                UNKNOWN
            );
        }
    }

    #[test]
    fn test_null_is_unknown() {
        assert_eq!(convert(false, "navigation.speedOverGround", Value::Null, None), "unknown");
        assert_eq!(convert(true, "navigation.position", Value::Null, None), "unknown");
    }

    #[test]
    fn test_position_document() {
        let out = convert(
            false,
            "navigation.position",
            json!({"latitude": 37.774900, "longitude": -122.419400}),
            None,
        );
        let doc: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["position"], "37.774900, -122.419400");
        assert_eq!(doc["latitude"].as_f64(), Some(37.7749));
        assert_eq!(doc["longitude"].as_f64(), Some(-122.4194));
        assert!(doc.get("altitude").is_none());
    }

    #[test]
    fn test_position_keeps_full_precision() {
        let out = convert(
            false,
            "navigation.position",
            json!({"latitude": 60.123456789, "longitude": 24.987654321, "altitude": 2.5}),
            None,
        );
        let doc: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["position"], "60.123457, 24.987654");
        assert_eq!(doc["latitude"].as_f64(), Some(60.123456789));
        assert_eq!(doc["altitude"].as_f64(), Some(2.5));
    }

    #[test]
    fn test_position_without_coordinates_is_serialized() {
        let out = convert(false, "navigation.position", json!({"foo": [1, 2]}), None);
        assert_eq!(out, r#"{"foo":[1,2]}"#);
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(
            convert(false, "navigation.datetime", json!("2024-06-01T10:15:30.000Z"), None),
            "2024-06-01T10:15:30Z"
        );
        assert_eq!(
            convert(false, "navigation.datetime", json!("2024-06-01T12:15:30+02:00"), None),
            "2024-06-01T10:15:30Z"
        );
        assert_eq!(
            convert(false, "navigation.datetime", json!("not a date"), None),
            "not a date"
        );
        assert_eq!(
            convert(false, "navigation.gnss.timestamp", json!(1717236930), None),
            "2024-06-01T10:15:30Z"
        );
        assert_eq!(
            convert(false, "navigation.gnss.timestamp", json!(1717236930500i64), None),
            "2024-06-01T10:15:30.500Z"
        );
    }

    #[test]
    fn test_smart_rounding() {
        // pressure: 2 decimals
        assert_eq!(
            convert(false, "environment.outside.pressure", json!(101325.456), Some("Pa")),
            "101325.46"
        );
        // speed: 1 decimal
        assert_eq!(
            convert(false, "navigation.speedOverGround", json!(3.14159), Some("m/s")),
            "3.1"
        );
        // voltage: default 2 decimals
        assert_eq!(
            convert(false, "electrical.batteries.0.voltage", json!(12.6789), Some("V")),
            "12.68"
        );
        // heuristic angle in radians: 1 decimal, no transform
        assert_eq!(convert(false, "navigation.courseOverGroundTrue", json!(2.3456), None), "2.3");
        // unclassified: 2 decimals
        assert_eq!(convert(false, "tanks.fuel.0.currentLevel", json!(0.456), None), "0.46");
    }

    #[test]
    fn test_other_shapes() {
        assert_eq!(convert(false, "a.nested", json!({"x": {"y": 1}}), None), r#"{"x":{"y":1}}"#);
        assert_eq!(convert(false, "a.list", json!([1, 2]), None), "[1,2]");
        assert_eq!(convert(false, "navigation.state", json!("anchored"), None), "anchored");
        assert_eq!(convert(false, "a.switch", json!(true), None), "true");
    }

    #[test]
    fn test_temperature_sanity_range() {
        assert!(!temperature_suspicious(20.0));
        assert!(!temperature_suspicious(-50.0));
        assert!(!temperature_suspicious(100.0));
        assert!(temperature_suspicious(126.85));
        assert!(temperature_suspicious(-273.15));
    }

    #[test]
    fn test_implausible_temperature_is_still_published() {
        // Kelvin reading mislabelled as °C by the source
        let value = json!(400.0);
        let s = sensor("environment.inside.temperature", &value, Some("°C"));
        let conv = ValueConverter::new(false);
        assert_eq!(conv.convert("environment.inside.temperature", &value, &s), "400.0");
        assert_eq!(conv.suspicious_count(), 1);

        assert_eq!(conv.convert("environment.inside.temperature", &json!(22.5), &s), "22.5");
        assert_eq!(conv.suspicious_count(), 1);

        // genuinely hot exhaust reported in K converts normally
        let out = convert(false, "propulsion.main.exhaustTemperature", json!(400.0), Some("K"));
        assert_eq!(out, "126.9");
    }

    #[test]
    fn test_display_precision() {
        let cfg = |dc: Option<&str>, unit: Option<&str>| SensorConfig {
            enabled: true,
            name: "x".to_string(),
            device_class: dc.map(String::from),
            unit: unit.map(String::from),
            icon: None,
        };
        assert_eq!(display_precision("navigation.position", &cfg(None, None)), None);
        assert_eq!(display_precision("a.b", &cfg(Some("pressure"), Some("Pa"))), Some(2));
        assert_eq!(display_precision("a.b", &cfg(Some("distance"), Some("m"))), Some(1));
        assert_eq!(display_precision("a.b", &cfg(None, Some("°"))), Some(1));
        assert_eq!(display_precision("a.b", &cfg(Some("voltage"), Some("V"))), Some(2));
    }
}
