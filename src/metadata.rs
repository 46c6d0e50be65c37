//! Per-path unit metadata.
//!
//! Units arrive inline in the stream (`updates[].meta[]`, requested with
//! `sendMeta=all`) or are fetched from
//! `<api>/vessels/self/<path as segments>/meta`. Fetches run on their own
//! task, bounded by a timeout, and never block the pipeline: until a fetch
//! completes the path reports [`MetaLookup::Pending`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::StatusCode;

use crate::delta::MetaInfo;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaLookup {
    Known(MetaInfo),
    /// No units available; heuristics apply.
    Missing,
    /// A fetch is in flight.
    Pending,
}

impl MetaLookup {
    pub fn meta(&self) -> Option<&MetaInfo> {
        match self {
            MetaLookup::Known(meta) => Some(meta),
            _ => None,
        }
    }
}

struct Fetcher {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
    timeout: Duration,
    runtime: tokio::runtime::Handle,
}

pub struct MetaCache {
    entries: Arc<DashMap<String, MetaLookup>>,
    fetcher: Option<Fetcher>,
}

impl MetaCache {
    /// Cache fed only by inline metadata; unknown paths are `Missing`.
    pub fn offline() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            fetcher: None,
        }
    }

    /// Cache that fetches unknown paths over HTTP. Must be created inside a
    /// tokio runtime; falls back to [`MetaCache::offline`] otherwise.
    pub fn http(api_base: &str, token: Option<String>, timeout: Duration) -> Self {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime, path metadata will not be fetched");
            return Self::offline();
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            entries: Arc::new(DashMap::new()),
            fetcher: Some(Fetcher {
                client,
                api_base: api_base.trim_end_matches('/').to_string(),
                token,
                timeout,
                runtime,
            }),
        }
    }

    /// Record units announced inline by the stream.
    pub fn remember(&self, path: &str, meta: MetaInfo) {
        if meta.units.is_some() {
            self.entries.insert(path.to_string(), MetaLookup::Known(meta));
        }
    }

    /// Current knowledge about `path`; starts a fetch on first sight.
    pub fn lookup(&self, path: &str) -> MetaLookup {
        if let Some(entry) = self.entries.get(path) {
            return entry.value().clone();
        }
        let Some(fetcher) = &self.fetcher else {
            return MetaLookup::Missing;
        };

        self.entries.insert(path.to_string(), MetaLookup::Pending);

        let entries = Arc::clone(&self.entries);
        let client = fetcher.client.clone();
        let url = meta_url(&fetcher.api_base, path);
        let token = fetcher.token.clone();
        let timeout = fetcher.timeout;
        let path = path.to_string();
        fetcher.runtime.spawn(async move {
            let outcome = match fetch_meta(&client, &url, token.as_deref(), timeout).await {
                Ok(Some(meta)) if meta.units.is_some() => MetaLookup::Known(meta),
                Ok(_) => MetaLookup::Missing,
                Err(e) => {
                    tracing::warn!(path = %path, "Metadata fetch failed: {}", e);
                    MetaLookup::Missing
                }
            };
            tracing::debug!(path = %path, ?outcome, "Metadata resolved");
            // inline metadata may have landed while we were waiting
            if let Some(mut entry) = entries.get_mut(&path) {
                if *entry == MetaLookup::Pending {
                    *entry = outcome;
                }
            }
        });

        MetaLookup::Pending
    }
}

/// `environment.outside.temperature` → `<api>/vessels/self/environment/outside/temperature/meta`
pub fn meta_url(api_base: &str, path: &str) -> String {
    format!("{}/vessels/self/{}/meta", api_base, path.replace('.', "/"))
}

async fn fetch_meta(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    timeout: Duration,
) -> Result<Option<MetaInfo>> {
    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let fetch = async {
        let resp = request.send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let meta = resp.error_for_status()?.json::<MetaInfo>().await?;
        Ok::<_, BridgeError>(Some(meta))
    };
    tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| BridgeError::Timeout(timeout))?
}
