mod bus;
mod config;
mod convert;
mod delta;
mod discovery;
mod error;
mod inference;
mod metadata;
mod mqtt;
mod pipeline;
mod registry;
mod resolver;
mod signalk;
mod throttle;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::Config;
use metadata::MetaCache;
use pipeline::Pipeline;
use registry::DeviceRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bosun=debug")),
        )
        .init();

    tracing::info!("Starting Bosun v{}", env!("CARGO_PKG_VERSION"));

    // Config path: first argument, then BOSUN_CONFIG, then ./bosun.yaml
    let config_path: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BOSUN_CONFIG").ok())
        .unwrap_or_else(|| "bosun.yaml".to_string())
        .into();
    let config = Config::load(&config_path)?;
    tracing::info!(
        "Signal K {}:{}, MQTT {}:{}, {} sensor entries",
        config.signalk.host,
        config.signalk.port,
        config.mqtt.host,
        config.mqtt.port,
        config.sensors.len()
    );

    let (bus, mqtt_task) = mqtt::MqttBus::connect(&config.mqtt);
    let bus = Arc::new(bus);

    let api_base = config.signalk.api_base();
    let registry = Arc::new(DeviceRegistry::new(
        &api_base,
        config.signalk.token.clone(),
        config.http_timeout(),
    ));
    let registry_task = Arc::clone(&registry)
        .start(Duration::from_secs(config.registry_refresh_secs.max(10)));

    let metadata = Arc::new(MetaCache::http(
        &api_base,
        config.signalk.token.clone(),
        config.http_timeout(),
    ));

    let pipeline = Pipeline::new(&config, registry, metadata, bus.clone());

    let (tx, mut rx) = mpsc::channel::<String>(1024);
    let stream_task = signalk::spawn(config.signalk.stream_url(), tx);

    let mut stats_tick = tokio::time::interval(Duration::from_secs(60));
    stats_tick.tick().await;
    let mut flush_tick = tokio::time::interval(Duration::from_secs(1));

    // Single consumer: batches are handled one at a time, in arrival order.
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(text) => pipeline.handle_message(&text),
                None => {
                    tracing::error!("Signal K stream task ended");
                    break;
                }
            },
            _ = flush_tick.tick() => pipeline.flush_parked(std::time::Instant::now()),
            _ = stats_tick.tick() => pipeline.log_stats(),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    pipeline.log_stats();
    stream_task.abort();
    registry_task.abort();
    bus.disconnect().await;
    mqtt_task.abort();

    Ok(())
}
