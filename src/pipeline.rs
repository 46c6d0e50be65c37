//! The bridge core: one inbound delta in, discovery and state publications out.
//!
//! Per flattened tuple: resolve config, announce the entity if needed, apply
//! the publish window, convert and publish the state. A failing tuple is
//! logged and abandoned; the rest of the batch carries on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::bus::Publisher;
use crate::config::Config;
use crate::convert::ValueConverter;
use crate::delta::{self, Delta, FlatValue, MetaInfo};
use crate::discovery::DiscoveryEmitter;
use crate::error::Result;
use crate::metadata::{MetaCache, MetaLookup};
use crate::registry::DeviceRegistry;
use crate::resolver::SensorResolver;
use crate::throttle::{SensorKey, Throttle};

/// Pipeline counters. Relaxed atomics, read for periodic logging and tests.
#[derive(Default)]
pub struct PipelineStats {
    pub batches_handled: AtomicU64,
    /// Arrived before the device registry was ready.
    pub batches_dropped: AtomicU64,
    pub batches_invalid: AtomicU64,
    /// Numeric first observations parked while their units were fetched.
    pub tuples_parked: AtomicU64,
    pub tuples_disabled: AtomicU64,
    pub discoveries_published: AtomicU64,
    pub states_published: AtomicU64,
    pub states_throttled: AtomicU64,
    pub publish_failures: AtomicU64,
}

impl PipelineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn log_summary(&self) {
        tracing::info!(
            batches = Self::get(&self.batches_handled),
            dropped = Self::get(&self.batches_dropped),
            invalid = Self::get(&self.batches_invalid),
            parked = Self::get(&self.tuples_parked),
            discoveries = Self::get(&self.discoveries_published),
            states = Self::get(&self.states_published),
            throttled = Self::get(&self.states_throttled),
            failures = Self::get(&self.publish_failures),
            "Pipeline stats"
        );
    }
}

pub struct Pipeline {
    resolver: SensorResolver,
    converter: ValueConverter,
    emitter: DiscoveryEmitter,
    throttle: Throttle,
    registry: Arc<DeviceRegistry>,
    metadata: Arc<MetaCache>,
    publisher: Arc<dyn Publisher>,
    /// Latest numeric value per sensor whose units are still being fetched.
    parked: DashMap<SensorKey, FlatValue>,
    pub stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        registry: Arc<DeviceRegistry>,
        metadata: Arc<MetaCache>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        if config.raw_mode {
            tracing::info!("Raw mode: values are published without unit conversion");
        }
        Self {
            resolver: SensorResolver::new(&config.sensors),
            converter: ValueConverter::new(config.raw_mode),
            emitter: DiscoveryEmitter::new(config.mqtt.discovery_prefix.clone(), config.raw_mode),
            throttle: Throttle::new(config.publish_interval()),
            registry,
            metadata,
            publisher,
            parked: DashMap::new(),
            stats: PipelineStats::default(),
        }
    }

    /// Counters plus the sizes of the per-sensor stores.
    pub fn log_stats(&self) {
        self.stats.log_summary();
        tracing::debug!(
            resolved = self.resolver.resolved_count(),
            discovered = self.emitter.discovered_count(),
            throttled_keys = self.throttle.tracked(),
            window_ms = self.throttle.window().as_millis() as u64,
            registry = self.registry.len(),
            parked = self.parked.len(),
            raw_mode = self.converter.raw_mode(),
            suspicious_temperatures = self.converter.suspicious_count(),
            "Pipeline stores"
        );
    }

    /// Entry point for one text frame from the stream.
    pub fn handle_message(&self, text: &str) {
        match serde_json::from_str::<Delta>(text) {
            Ok(delta) => self.handle_delta(&delta),
            Err(e) => {
                PipelineStats::bump(&self.stats.batches_invalid);
                tracing::warn!("Skipping malformed delta: {}", e);
            }
        }
    }

    pub fn handle_delta(&self, delta: &Delta) {
        self.handle_delta_at(delta, Instant::now());
    }

    /// Process a batch as if it arrived at `now`.
    pub fn handle_delta_at(&self, delta: &Delta, now: Instant) {
        if delta.updates().is_empty() {
            return;
        }
        if !self.registry.is_ready() {
            PipelineStats::bump(&self.stats.batches_dropped);
            tracing::trace!("Device registry not ready, dropping batch");
            return;
        }
        PipelineStats::bump(&self.stats.batches_handled);
        tracing::trace!(context = ?delta.context, updates = delta.updates().len(), "Delta");

        for update in delta.updates() {
            for entry in update.meta() {
                self.metadata.remember(&entry.path, entry.value.clone());
            }
        }

        // parked values are older than this batch
        self.flush_parked(now);

        for tuple in delta::flatten(delta) {
            self.run_tuple(&tuple, now);
        }
    }

    /// Replay parked values whose units have settled since they arrived.
    /// Called before every batch and periodically by the main loop, so a
    /// value that is never repeated still gets out.
    pub fn flush_parked(&self, now: Instant) {
        if self.parked.is_empty() {
            return;
        }
        let settled: Vec<SensorKey> = self
            .parked
            .iter()
            .filter(|entry| self.metadata.lookup(&entry.key().path) != MetaLookup::Pending)
            .map(|entry| entry.key().clone())
            .collect();
        for key in settled {
            if let Some((_, tuple)) = self.parked.remove(&key) {
                self.run_tuple(&tuple, now);
            }
        }
    }

    fn run_tuple(&self, tuple: &FlatValue, now: Instant) {
        if let Err(e) = self.process_tuple(tuple, now) {
            PipelineStats::bump(&self.stats.publish_failures);
            tracing::error!(source = %tuple.source.id, path = %tuple.path, "Publish failed: {}", e);
        }
    }

    fn process_tuple(&self, tuple: &FlatValue, now: Instant) -> Result<()> {
        let key = SensorKey::new(tuple.source.id.as_str(), tuple.path.as_str());

        let sensor = match self.resolver.cached(&tuple.path) {
            Some(sensor) => sensor,
            None => match self.units_for(tuple) {
                Some(meta) => self.resolver.resolve(&tuple.path, &tuple.value, meta.as_ref()),
                // Units only change how numbers are converted, and a null
                // may be followed by one. Anything else is resolved from
                // the path rules right away.
                None if tuple.value.is_number() || tuple.value.is_null() => {
                    PipelineStats::bump(&self.stats.tuples_parked);
                    tracing::trace!(sensor = %key, "Parked until units are known");
                    self.parked.insert(key, tuple.clone());
                    return Ok(());
                }
                None => self.resolver.resolve(&tuple.path, &tuple.value, None),
            },
        };

        if !sensor.config.enabled {
            PipelineStats::bump(&self.stats.tuples_disabled);
            return Ok(());
        }

        let announced = self.emitter.maybe_publish(
            &key,
            &sensor,
            &tuple.source,
            &tuple.value,
            &self.registry,
            self.publisher.as_ref(),
        )?;
        if announced {
            PipelineStats::bump(&self.stats.discoveries_published);
        }

        if !self.throttle.should_publish(&key, now) {
            PipelineStats::bump(&self.stats.states_throttled);
            return Ok(());
        }

        let payload = self.converter.convert(&tuple.path, &tuple.value, &sensor);
        let topic = self.emitter.state_topic(&key);
        tracing::trace!(sensor = %key, payload = %payload, "State");
        if let Err(e) = self.publisher.publish_state(&topic, payload) {
            // the window only counts successful publications
            self.throttle.revoke(&key);
            return Err(e);
        }
        PipelineStats::bump(&self.stats.states_published);
        Ok(())
    }

    /// Units for a first observation. `None` while a fetch is in flight;
    /// `Some(None)` when no units exist and heuristics should apply.
    fn units_for(&self, tuple: &FlatValue) -> Option<Option<MetaInfo>> {
        if let Some(meta) = tuple.meta.as_ref().filter(|m| m.units.is_some()) {
            self.metadata.remember(&tuple.path, meta.clone());
            return Some(Some(meta.clone()));
        }
        match self.metadata.lookup(&tuple.path) {
            MetaLookup::Pending => None,
            settled => Some(settled.meta().cloned()),
        }
    }
}
