//! Memory governor.
//!
//! Keeps resident memory under a configured ceiling by watching the usage
//! ratio and reclaiming engine-owned caches when it climbs:
//!
//! - above `critical_threshold` — aggressive reclaim: every registered
//!   cache is emptied and a low-memory signal is broadcast
//! - between `warning_threshold` and critical — light reclaim: caches are
//!   trimmed toward half occupancy
//!
//! The periodic check runs on a private tokio task whose cancellation is
//! deterministic ([`MemoryOptimizer::shutdown`] or drop). The host's
//! platform memory-pressure event maps to
//! [`MemoryOptimizer::on_memory_pressure`], an explicit entry point rather
//! than a pub/sub subscription.

mod stats;

pub use stats::MemoryStats;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{KvStore, MEMORY_CONFIG_KEY};
use crate::error::{Error, Result};

/// A cache that the governor may shrink or empty under pressure.
///
/// Implementations are registered once and must tolerate concurrent calls;
/// `clear` must release every byte `owned_bytes` reports.
pub trait ReclaimableCache: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;
    /// Bytes currently held.
    fn owned_bytes(&self) -> u64;
    /// Light reclaim: shed roughly half the held entries.
    fn trim(&self);
    /// Aggressive reclaim: drop everything.
    fn clear(&self);
}

/// Governor thresholds and cadence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Usage ratio that triggers light reclaim
    pub warning_threshold: f64,
    /// Usage ratio that triggers aggressive reclaim and gates allocation
    pub critical_threshold: f64,
    /// Cadence of the periodic check
    #[serde(with = "interval_millis")]
    pub check_interval: Duration,
    /// Whether the periodic check reclaims automatically
    pub auto_reclaim: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.70,
            critical_threshold: 0.85,
            check_interval: Duration::from_secs(5),
            auto_reclaim: true,
        }
    }
}

impl MemoryConfig {
    /// Validate threshold ordering and ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.warning_threshold)
            || !(0.0..=1.0).contains(&self.critical_threshold)
        {
            return Err(Error::invalid_parameter("thresholds must lie in [0, 1]"));
        }
        if self.warning_threshold >= self.critical_threshold {
            return Err(Error::invalid_parameter(
                "warning threshold must be below critical",
            ));
        }
        if self.check_interval.is_zero() {
            return Err(Error::invalid_parameter("check interval must be non-zero"));
        }
        Ok(())
    }

    /// Load from the persistence store, defaulting on decode failure.
    pub fn load(store: &KvStore) -> Self {
        let config: MemoryConfig = store.get(MEMORY_CONFIG_KEY).unwrap_or_default();
        if config.validate().is_err() {
            tracing::warn!("persisted memory config out of range, using defaults");
            return Self::default();
        }
        config
    }

    /// Persist the current values.
    pub fn persist(&self, store: &KvStore) -> Result<()> {
        store.put(MEMORY_CONFIG_KEY, self)
    }
}

/// Pressure classification of a sampled usage ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    /// Below the warning threshold
    Normal,
    /// Between warning and critical
    Warning,
    /// At or above critical
    Critical,
}

/// Service that samples memory and reclaims caches under pressure.
pub struct MemoryOptimizer {
    config: RwLock<MemoryConfig>,
    caches: Mutex<Vec<Arc<dyn ReclaimableCache>>>,
    low_memory_tx: watch::Sender<u64>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    aggressive_reclaims: AtomicU64,
    light_reclaims: AtomicU64,
}

impl MemoryOptimizer {
    /// Create a governor with the given configuration.
    pub fn new(config: MemoryConfig) -> Self {
        let (low_memory_tx, _) = watch::channel(0);
        Self {
            config: RwLock::new(config),
            caches: Mutex::new(Vec::new()),
            low_memory_tx,
            monitor: Mutex::new(None),
            aggressive_reclaims: AtomicU64::new(0),
            light_reclaims: AtomicU64::new(0),
        }
    }

    /// Register a cache for pressure reclaim.
    pub fn register_cache(&self, cache: Arc<dyn ReclaimableCache>) {
        self.caches.lock().push(cache);
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> MemoryConfig {
        *self.config.read()
    }

    /// Replace the configuration after validation.
    pub fn set_config(&self, config: MemoryConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    /// Current memory snapshot.
    pub fn current_stats(&self) -> MemoryStats {
        MemoryStats::sample()
    }

    /// Whether a new allocation-heavy session should proceed.
    pub fn can_allocate(&self) -> bool {
        self.current_stats().usage_ratio < self.config.read().critical_threshold
    }

    /// Bytes currently held across all registered caches.
    pub fn cache_bytes(&self) -> u64 {
        self.caches.lock().iter().map(|c| c.owned_bytes()).sum()
    }

    /// Classify a usage ratio against the configured thresholds.
    pub fn classify(&self, usage_ratio: f64) -> PressureLevel {
        let config = self.config.read();
        if usage_ratio >= config.critical_threshold {
            PressureLevel::Critical
        } else if usage_ratio > config.warning_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// Evaluate a snapshot and reclaim accordingly.
    ///
    /// Exposed so the host (or a test) can drive the governor with
    /// synthetic readings; the periodic task calls this with real samples.
    pub fn evaluate(&self, stats: &MemoryStats) {
        match self.classify(stats.usage_ratio) {
            PressureLevel::Critical => {
                tracing::warn!(
                    ratio = stats.usage_ratio,
                    rss = stats.physical_memory_used,
                    "memory critical, forcing reclaim"
                );
                self.force_reclaim();
            }
            PressureLevel::Warning => {
                tracing::debug!(ratio = stats.usage_ratio, "memory elevated, trimming caches");
                self.light_reclaim();
            }
            PressureLevel::Normal => {}
        }
    }

    /// Aggressive reclaim, synchronous: empty every cache and broadcast the
    /// low-memory signal.
    pub fn force_reclaim(&self) {
        let caches = self.caches.lock();
        let before: u64 = caches.iter().map(|c| c.owned_bytes()).sum();
        for cache in caches.iter() {
            cache.clear();
        }
        drop(caches);

        self.aggressive_reclaims.fetch_add(1, Ordering::Relaxed);
        self.low_memory_tx.send_modify(|n| *n += 1);
        tracing::info!(reclaimed_bytes = before, "aggressive memory reclaim complete");
    }

    /// Light reclaim: trim each cache toward half occupancy.
    pub fn light_reclaim(&self) {
        for cache in self.caches.lock().iter() {
            cache.trim();
        }
        self.light_reclaims.fetch_add(1, Ordering::Relaxed);
    }

    /// Entry point for the host's platform memory-pressure event.
    pub fn on_memory_pressure(&self) {
        tracing::info!("host signalled memory pressure");
        self.force_reclaim();
    }

    /// Observe low-memory broadcasts; the value counts events so far.
    pub fn subscribe_low_memory(&self) -> watch::Receiver<u64> {
        self.low_memory_tx.subscribe()
    }

    /// Count of aggressive reclaims performed.
    pub fn aggressive_reclaim_count(&self) -> u64 {
        self.aggressive_reclaims.load(Ordering::Relaxed)
    }

    /// Count of light reclaims performed.
    pub fn light_reclaim_count(&self) -> u64 {
        self.light_reclaims.load(Ordering::Relaxed)
    }

    /// Start the periodic pressure check.
    ///
    /// Idempotent: a second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.monitor.lock();
        if slot.is_some() {
            return;
        }

        let governor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(governor.config.read().check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if governor.config.read().auto_reclaim {
                    let stats = MemoryStats::sample();
                    governor.evaluate(&stats);
                }
            }
        });
        *slot = Some(handle);
    }

    /// Cancel the periodic check deterministically.
    pub fn shutdown(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for MemoryOptimizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

mod interval_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
