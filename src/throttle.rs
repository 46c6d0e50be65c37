//! Per-sensor publish rate limiting.
//!
//! Signal K servers happily emit several updates per second per path; Home
//! Assistant only needs a human-scale cadence. Discovery is never throttled,
//! only state publications go through here.

use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Identity of one sensor: the same path from two sources is two sensors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SensorKey {
    pub source_id: String,
    pub path: String,
}

impl SensorKey {
    pub fn new(source_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.path)
    }
}

pub struct Throttle {
    window: Duration,
    last_publish: DashMap<SensorKey, Instant>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_publish: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// True, and `now` recorded, when `key` has not been published within
    /// the window.
    pub fn should_publish(&self, key: &SensorKey, now: Instant) -> bool {
        match self.last_publish.get_mut(key) {
            Some(mut last) => {
                if now.saturating_duration_since(*last) >= self.window {
                    *last = now;
                    true
                } else {
                    false
                }
            }
            None => {
                self.last_publish.insert(key.clone(), now);
                true
            }
        }
    }

    /// Forget the publish just granted to `key`, after it failed. The key
    /// passed the window, so its previous record was already stale and the
    /// next update goes straight through.
    pub fn revoke(&self, key: &SensorKey) {
        self.last_publish.remove(key);
    }

    /// Number of sensors published at least once.
    pub fn tracked(&self) -> usize {
        self.last_publish.len()
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}
