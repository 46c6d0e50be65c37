//! Device registry backed by the Signal K `/sources` tree.
//!
//! Resolves a source id (the NMEA 2000 address, or `<label>.<address>`) to
//! manufacturer and model strings for the discovery device block. The
//! registry is optional: when the fetch fails or times out it still becomes
//! ready, just empty, and discovery falls back to generic names.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::delta::SourceDescriptor;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

pub struct DeviceRegistry {
    devices: DashMap<String, DeviceInfo>,
    ready: AtomicBool,
    client: reqwest::Client,
    sources_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl DeviceRegistry {
    /// Registry that fetches from `<api_base>/sources`. Not ready until
    /// [`DeviceRegistry::start`] has made its first attempt.
    pub fn new(api_base: &str, token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            devices: DashMap::new(),
            ready: AtomicBool::new(false),
            client,
            sources_url: format!("{}/sources", api_base),
            token,
            timeout,
        }
    }

    /// Empty registry that is ready immediately and never fetches.
    pub fn offline() -> Self {
        let registry = Self::new("http://localhost/signalk/v1/api", None, Duration::from_secs(1));
        registry.mark_ready();
        registry
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::AcqRel) {
            tracing::info!("Device registry ready ({} sources)", self.devices.len());
        }
    }

    pub fn insert(&self, source_id: impl Into<String>, info: DeviceInfo) {
        self.devices.insert(source_id.into(), info);
    }

    pub fn lookup(&self, source_id: &str) -> Option<DeviceInfo> {
        self.devices.get(source_id).map(|e| e.value().clone())
    }

    /// Lookup by source id (`<label>.<address>` for bus devices), then by
    /// the id qualified with the label.
    pub fn lookup_source(&self, source: &SourceDescriptor) -> Option<DeviceInfo> {
        self.lookup(&source.id)
            .or_else(|| self.lookup(&format!("{}.{}", source.label, source.id)))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Fetch the sources tree once. Bounded by the configured timeout.
    pub async fn refresh(&self) -> Result<usize> {
        let mut request = self.client.get(&self.sources_url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let fetch = async {
            let resp = request.send().await?.error_for_status()?;
            Ok::<Value, BridgeError>(resp.json::<Value>().await?)
        };
        let body = tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| BridgeError::Timeout(self.timeout))??;

        let entries = parse_sources(&body);
        let count = entries.len();
        for (id, info) in entries {
            self.insert(id, info);
        }
        Ok(count)
    }

    /// Initial fetch, then periodic refreshes. The registry is marked ready
    /// after the first attempt whatever its outcome.
    pub fn start(self: Arc<Self>, refresh_every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.refresh().await {
                    Ok(count) => tracing::debug!("Device registry refreshed: {} entries", count),
                    Err(e) => tracing::warn!("Device registry fetch failed, using defaults: {}", e),
                }
                self.mark_ready();
                tokio::time::sleep(refresh_every).await;
            }
        })
    }
}

/// Flatten the `/sources` tree into `(source id, device info)` pairs.
///
/// ```json
/// {"can0": {"label": "can0", "type": "NMEA2000",
///           "36": {"n2k": {"src": "36", "manufacturerName": "Garmin", "modelId": "GND 10"}}}}
/// ```
///
/// yields entries for both `36` and `can0.36`.
pub fn parse_sources(body: &Value) -> Vec<(String, DeviceInfo)> {
    let mut out = Vec::new();
    let Some(buses) = body.as_object() else {
        return out;
    };

    for (label, bus) in buses {
        let Some(devices) = bus.as_object() else {
            continue;
        };
        for (address, device) in devices {
            let Some(n2k) = device.get("n2k").and_then(Value::as_object) else {
                continue;
            };

            let text = |key: &str| {
                n2k.get(key).and_then(|v| match v {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
            };

            let manufacturer = text("manufacturerName").or_else(|| text("manufacturerCode"));
            let model = text("modelId").or_else(|| text("productName"));
            let name = match (&manufacturer, &model) {
                (Some(m), Some(model)) => Some(format!("{} {}", m, model)),
                (None, Some(model)) => Some(model.clone()),
                _ => None,
            };
            let info = DeviceInfo {
                name,
                manufacturer,
                model,
            };

            let src = text("src").unwrap_or_else(|| address.clone());
            out.push((format!("{}.{}", label, src), info.clone()));
            out.push((src, info));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_sources() {
        let body = json!({
            "can0": {
                "label": "can0",
                "type": "NMEA2000",
                "36": {"n2k": {"src": "36", "manufacturerName": "Garmin", "modelId": "GND 10"}},
                "12": {"n2k": {"src": "12", "manufacturerCode": 1855}},
                "115": {"n2k": {"src": "115", "productName": "  "}}
            },
            "derived-data": {"label": "derived-data", "type": "Plugin"}
        });

        let entries = parse_sources(&body);
        let find = |id: &str| entries.iter().find(|(k, _)| k == id).map(|(_, v)| v.clone());

        let garmin = find("36").unwrap();
        assert_eq!(garmin.manufacturer.as_deref(), Some("Garmin"));
        assert_eq!(garmin.model.as_deref(), Some("GND 10"));
        assert_eq!(garmin.name.as_deref(), Some("Garmin GND 10"));
        assert_eq!(find("can0.36"), Some(garmin));

        let coded = find("12").unwrap();
        assert_eq!(coded.manufacturer.as_deref(), Some("1855"));
        assert_eq!(coded.name, None);

        let blank = find("115").unwrap();
        assert_eq!(blank, DeviceInfo::default());

        assert_eq!(entries.len(), 6);
    }

    #[test]
    fn test_lookup_keeps_buses_apart() {
        let registry = DeviceRegistry::offline();
        let body = json!({
            "can0": {"36": {"n2k": {"src": "36", "manufacturerName": "Garmin"}}},
            "can1": {"36": {"n2k": {"src": "36", "manufacturerName": "Airmar"}}}
        });
        for (id, info) in parse_sources(&body) {
            registry.insert(id, info);
        }

        let source = |id: &str, label: &str| SourceDescriptor {
            id: id.to_string(),
            label: label.to_string(),
            manufacturer: None,
            model: None,
        };
        let maker = |s: &SourceDescriptor| registry.lookup_source(s).and_then(|d| d.manufacturer);
        assert_eq!(maker(&source("can0.36", "can0")).as_deref(), Some("Garmin"));
        assert_eq!(maker(&source("can1.36", "can1")).as_deref(), Some("Airmar"));
        assert_eq!(maker(&source("can0.99", "can0")), None);
    }

    #[test]
    fn test_parse_sources_ignores_garbage() {
        assert!(parse_sources(&json!([1, 2, 3])).is_empty());
        assert!(parse_sources(&json!({"x": 1, "y": {"z": 2}})).is_empty());
    }

    #[test]
    fn test_offline_registry_is_ready() {
        let registry = DeviceRegistry::offline();
        assert!(registry.is_ready());
        assert!(registry.lookup("36").is_none());

        registry.insert(
            "36",
            DeviceInfo {
                manufacturer: Some("Airmar".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(registry.lookup("36").unwrap().manufacturer.as_deref(), Some("Airmar"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_still_becomes_ready() {
        let registry = Arc::new(DeviceRegistry::new(
            "http://127.0.0.1:9/signalk/v1/api",
            None,
            Duration::from_millis(300),
        ));
        assert!(!registry.is_ready());
        assert!(registry.refresh().await.is_err());

        let handle = Arc::clone(&registry).start(Duration::from_secs(3600));
        for _ in 0..50 {
            if registry.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registry.is_ready());
        assert_eq!(registry.len(), 0);
        handle.abort();
    }
}
