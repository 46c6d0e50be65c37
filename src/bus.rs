//! Outbound port of the pipeline: something that can put a payload on a
//! topic. The MQTT adapter implements it for real; tests use
//! [`RecordingPublisher`].

use crate::error::Result;

/// A publish request handed to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

pub trait Publisher: Send + Sync {
    /// Entity announcement; delivered retained.
    fn publish_discovery(&self, topic: &str, payload: String) -> Result<()>;

    /// Periodic state value; not retained.
    fn publish_state(&self, topic: &str, payload: String) -> Result<()>;
}

/// In-memory publisher that records everything, optionally failing.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingPublisher {
    messages: std::sync::Mutex<Vec<BusMessage>>,
    fail_discovery: std::sync::atomic::AtomicBool,
    fail_state: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_discovery(&self, fail: bool) {
        self.fail_discovery
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn set_fail_state(&self, fail: bool) {
        self.fail_state
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn messages(&self) -> Vec<BusMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn discoveries(&self) -> Vec<BusMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic.ends_with("/config"))
            .collect()
    }

    pub fn states(&self) -> Vec<BusMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic.ends_with("/state"))
            .collect()
    }

    fn record(&self, topic: &str, payload: String, retain: bool) {
        self.messages.lock().unwrap().push(BusMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
    }
}

#[cfg(test)]
impl Publisher for RecordingPublisher {
    fn publish_discovery(&self, topic: &str, payload: String) -> Result<()> {
        if self.fail_discovery.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(crate::error::BridgeError::Publish {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        self.record(topic, payload, true);
        Ok(())
    }

    fn publish_state(&self, topic: &str, payload: String) -> Result<()> {
        if self.fail_state.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(crate::error::BridgeError::Publish {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        self.record(topic, payload, false);
        Ok(())
    }
}
