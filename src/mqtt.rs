//! MQTT side of the bridge.
//!
//! [`MqttBus`] implements the pipeline's [`Publisher`] port on top of a
//! `rumqttc` client. Publishing never waits on the network: requests are
//! queued with `try_publish` and a background task drives the event loop,
//! which also takes care of reconnecting.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{BusMessage, Publisher};
use crate::config::MqttConfig;
use crate::error::{BridgeError, Result};

/// Outgoing requests buffered between the pipeline and the event loop.
const REQUEST_CAPACITY: usize = 256;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Create the client and spawn the event loop task.
    pub fn connect(config: &MqttConfig) -> (Self, JoinHandle<()>) {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("bosun-{}", Uuid::new_v4().simple()));

        let mut opts = MqttOptions::new(client_id.clone(), config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
        tracing::info!(
            "MQTT client {} connecting to {}:{}",
            client_id,
            config.host,
            config.port
        );

        let handle = tokio::spawn(drive(eventloop));
        (Self { client }, handle)
    }

    fn send(&self, msg: BusMessage) -> Result<()> {
        self.client
            .try_publish(msg.topic.as_str(), QoS::AtLeastOnce, msg.retain, msg.payload)
            .map_err(|e| BridgeError::Publish {
                topic: msg.topic.clone(),
                reason: e.to_string(),
            })
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!("MQTT disconnect: {}", e);
        }
    }
}

impl Publisher for MqttBus {
    fn publish_discovery(&self, topic: &str, payload: String) -> Result<()> {
        self.send(BusMessage {
            topic: topic.to_string(),
            payload,
            retain: true,
        })
    }

    fn publish_state(&self, topic: &str, payload: String) -> Result<()> {
        self.send(BusMessage {
            topic: topic.to_string(),
            payload,
            retain: false,
        })
    }
}

/// Poll the event loop forever. Errors are logged once per outage and
/// followed by a growing pause; polling again reconnects.
async fn drive(mut eventloop: EventLoop) {
    let mut failures: u32 = 0;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if failures > 0 {
                    tracing::info!("MQTT reconnected after {} failed attempts", failures);
                } else {
                    tracing::info!("MQTT connected");
                }
                failures = 0;
            }
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    tracing::error!("MQTT connection error: {}", e);
                } else {
                    tracing::debug!("MQTT still disconnected ({} attempts): {}", failures, e);
                }
                tokio::time::sleep(backoff(failures)).await;
            }
        }
    }
}

/// 1 s, 2 s, 4 s, ... capped at 30 s.
pub fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(5);
    Duration::from_secs(1u64 << exp).min(MAX_BACKOFF)
}
