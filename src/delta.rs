//! Inbound delta model and the normalizer that flattens one batch into
//! independently addressable `(path, value, meta, source)` tuples.
//!
//! A delta looks like:
//!
//! ```json
//! {"context": "vessels.self",
//!  "updates": [{"source": {"label": "can0", "src": "36"},
//!               "values": [{"path": "navigation.attitude",
//!                           "value": {"roll": 0.01, "pitch": 0.02, "yaw": 1.2}}]}]}
//! ```
//!
//! The `source` field arrives either as a bare label or as an object; it is
//! collapsed into a single [`SourceDescriptor`] here so nothing downstream
//! has to care which shape the stream used.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

/// One inbound update batch.
#[derive(Debug, Clone, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    updates: Option<Vec<Update>>,
}

impl Delta {
    pub fn updates(&self) -> &[Update] {
        self.updates.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    #[serde(default)]
    source: Option<SourceRef>,
    #[serde(default, rename = "$source")]
    source_ref: Option<String>,
    #[serde(default)]
    values: Option<Vec<PathValue>>,
    /// Metadata deltas (sent by the server with `sendMeta=all`).
    #[serde(default)]
    meta: Option<Vec<PathMeta>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathValue {
    pub path: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub meta: Option<MetaInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathMeta {
    pub path: String,
    #[serde(default)]
    pub value: MetaInfo,
}

/// Unit hint supplied by the telemetry source for a path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MetaInfo {
    #[serde(default)]
    pub units: Option<String>,
}

impl MetaInfo {
    #[cfg(test)]
    pub fn with_units(units: impl Into<String>) -> Self {
        Self {
            units: Some(units.into()),
        }
    }
}

/// Raw `source` field: a bare label or a structured object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SourceRef {
    Label(String),
    Detailed(SourceObject),
}

#[derive(Debug, Clone, Deserialize)]
struct SourceObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    label: Option<String>,
    /// NMEA 2000 source address; sent as a string but some servers use a number.
    #[serde(default)]
    src: Option<Value>,
    #[serde(default)]
    manufacturer: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Normalized origin of a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub id: String,
    pub label: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

impl SourceDescriptor {
    pub fn from_label(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            id: label.clone(),
            label,
            manufacturer: None,
            model: None,
        }
    }
}

impl Update {
    pub fn values(&self) -> &[PathValue] {
        self.values.as_deref().unwrap_or_default()
    }

    pub fn meta(&self) -> &[PathMeta] {
        self.meta.as_deref().unwrap_or_default()
    }

    /// Collapse `source` / `$source` into one descriptor.
    pub fn source_descriptor(&self) -> SourceDescriptor {
        match &self.source {
            Some(SourceRef::Label(label)) => SourceDescriptor::from_label(label.as_str()),
            Some(SourceRef::Detailed(obj)) => {
                let src = obj.src.as_ref().and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                });
                // `<label>.<src>` so equal addresses on two buses stay apart
                let qualified = match (&obj.label, &src) {
                    (Some(label), Some(src)) => Some(format!("{}.{}", label, src)),
                    _ => None,
                };
                let id = obj
                    .id
                    .clone()
                    .or(qualified)
                    .or_else(|| self.source_ref.clone())
                    .or(src)
                    .or_else(|| obj.label.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                SourceDescriptor {
                    label: obj.label.clone().unwrap_or_else(|| id.clone()),
                    id,
                    manufacturer: obj.manufacturer.clone(),
                    model: obj.model.clone(),
                }
            }
            None => SourceDescriptor::from_label(
                self.source_ref.as_deref().unwrap_or("unknown"),
            ),
        }
    }
}

/// One flattened tuple handed to the rest of the pipeline.
#[derive(Debug, Clone)]
pub struct FlatValue {
    pub path: String,
    pub value: Value,
    pub meta: Option<MetaInfo>,
    pub source: Arc<SourceDescriptor>,
}

/// `navigation.position`, `navigation.anchor.position`, ...
pub fn is_position_path(path: &str) -> bool {
    path.rsplit('.').next() == Some("position")
}

/// `navigation.datetime`, `navigation.gnss.timestamp`, ...
pub fn is_timestamp_path(path: &str) -> bool {
    let last = path.rsplit('.').next().unwrap_or(path).to_ascii_lowercase();
    last.contains("datetime") || last.contains("timestamp")
}

/// Flatten a batch, update by update, value by value.
pub fn flatten(delta: &Delta) -> impl Iterator<Item = FlatValue> + '_ {
    delta.updates().iter().flat_map(|update| {
        let source = Arc::new(update.source_descriptor());
        update
            .values()
            .iter()
            .flat_map(move |pv| expand(pv, Arc::clone(&source)))
    })
}

fn expand(pv: &PathValue, source: Arc<SourceDescriptor>) -> Vec<FlatValue> {
    if let Value::Object(members) = &pv.value {
        let eligible = !members.is_empty()
            && !is_position_path(&pv.path)
            && members.values().all(is_scalar);
        if eligible {
            return members
                .iter()
                .map(|(key, value)| FlatValue {
                    path: format!("{}.{}", pv.path, key),
                    value: value.clone(),
                    meta: pv.meta.clone(),
                    source: Arc::clone(&source),
                })
                .collect();
        }
    }

    vec![FlatValue {
        path: pv.path.clone(),
        value: pv.value.clone(),
        meta: pv.meta.clone(),
        source,
    }]
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}
