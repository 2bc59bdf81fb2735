//! Process-wide cipher execution tuning.
//!
//! A single [`CipherConfig`] value governs chunking, parallelism, caching
//! and time budgets for every cipher session in the process. Reads take a
//! cheap snapshot under a shared lock; every mutation funnels through
//! [`CipherConfigManager::update`] so writers serialize and readers always
//! observe a complete value.

use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::persist::{KvStore, CIPHER_CONFIG_KEY};

/// Tunable cipher execution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CipherConfig {
    /// Chunk size above which parallel processing is considered (bytes)
    pub block_size: usize,
    /// Fan out large seekable-cipher inputs across worker threads
    pub use_parallel: bool,
    /// Cache derived keys and translation tables between sessions
    pub enable_cache: bool,
    /// Budget for all cipher caches combined (bytes)
    pub max_cache_size: u64,
    /// Prefer hardware-backed primitives where the platform offers them
    pub use_hardware_acceleration: bool,
    /// Time budget for a single encrypt/decrypt call
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Bounded retry attempts for transient connection failures
    pub max_retries: u32,
}

/// Named configuration presets for different memory envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPreset {
    /// Balanced defaults
    Default,
    /// Constrained devices: small chunks, no cache growth
    SmallMemory,
    /// Plenty of headroom: large chunks, generous caches
    LargeMemory,
}

impl CipherConfig {
    /// Preset for devices with a tight memory ceiling.
    pub fn small_memory() -> Self {
        Self {
            block_size: 4 * 1024,
            use_parallel: false,
            enable_cache: false,
            max_cache_size: 1024 * 1024,
            use_hardware_acceleration: true,
            timeout: Duration::from_secs(10),
            max_retries: 2,
        }
    }

    /// Preset for hosts with generous memory headroom.
    pub fn large_memory() -> Self {
        Self {
            block_size: 64 * 1024,
            use_parallel: true,
            enable_cache: true,
            max_cache_size: 16 * 1024 * 1024,
            use_hardware_acceleration: true,
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    /// Preset lookup.
    pub fn preset(preset: ConfigPreset) -> Self {
        match preset {
            ConfigPreset::Default => Self::default(),
            ConfigPreset::SmallMemory => Self::small_memory(),
            ConfigPreset::LargeMemory => Self::large_memory(),
        }
    }

    /// Validate parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < 1024 {
            return Err(Error::invalid_parameter("block_size below 1 KiB"));
        }
        if self.timeout.is_zero() {
            return Err(Error::invalid_parameter("timeout must be non-zero"));
        }
        Ok(())
    }
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            block_size: 16 * 1024,
            use_parallel: true,
            enable_cache: true,
            max_cache_size: 4 * 1024 * 1024,
            use_hardware_acceleration: true,
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

/// Owner of the process-wide [`CipherConfig`].
///
/// Concurrent readers share the lock; updates take the exclusive side, so a
/// reader that follows an update always sees the updated value.
pub struct CipherConfigManager {
    inner: RwLock<CipherConfig>,
}

impl CipherConfigManager {
    /// Create a manager holding the default configuration.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CipherConfig::default()),
        }
    }

    /// Create a manager from persisted state, falling back to defaults when
    /// the stored blob is missing or fails to decode.
    pub fn load(store: &KvStore) -> Self {
        let config: CipherConfig = store.get(CIPHER_CONFIG_KEY).unwrap_or_default();
        if config.validate().is_err() {
            tracing::warn!("persisted cipher config out of range, using defaults");
            return Self::new();
        }
        Self {
            inner: RwLock::new(config),
        }
    }

    /// Snapshot the current configuration.
    pub fn current(&self) -> CipherConfig {
        *self.inner.read()
    }

    /// Apply a mutation under the writer lock.
    ///
    /// The mutation is validated before it becomes visible; an invalid
    /// update leaves the previous configuration in place.
    pub fn update(&self, mutate: impl FnOnce(&mut CipherConfig)) -> Result<()> {
        let mut guard = self.inner.write();
        let mut candidate = *guard;
        mutate(&mut candidate);
        candidate.validate()?;
        *guard = candidate;
        Ok(())
    }

    /// Replace the configuration with a preset.
    pub fn apply_preset(&self, preset: ConfigPreset) {
        *self.inner.write() = CipherConfig::preset(preset);
    }

    /// Persist the current configuration.
    pub fn persist(&self, store: &KvStore) -> Result<()> {
        store.put(CIPHER_CONFIG_KEY, &self.current())
    }
}

impl Default for CipherConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert!(CipherConfig::default().validate().is_ok());
        assert!(CipherConfig::small_memory().validate().is_ok());
        assert!(CipherConfig::large_memory().validate().is_ok());

        assert!(CipherConfig::small_memory().block_size < CipherConfig::large_memory().block_size);
        assert!(!CipherConfig::small_memory().use_parallel);
    }

    #[test]
    fn test_update_is_read_your_writes() {
        let manager = CipherConfigManager::new();

        manager
            .update(|c| {
                c.block_size = 8 * 1024;
                c.max_retries = 7;
            })
            .unwrap();

        let snapshot = manager.current();
        assert_eq!(snapshot.block_size, 8 * 1024);
        assert_eq!(snapshot.max_retries, 7);
    }

    #[test]
    fn test_invalid_update_rolls_back() {
        let manager = CipherConfigManager::new();
        let before = manager.current();

        let result = manager.update(|c| c.block_size = 16);
        assert!(result.is_err());
        assert_eq!(manager.current(), before);
    }

    #[test]
    fn test_apply_preset() {
        let manager = CipherConfigManager::new();
        manager.apply_preset(ConfigPreset::SmallMemory);
        assert_eq!(manager.current(), CipherConfig::small_memory());
    }

    #[test]
    fn test_persist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("engine.json"));

        let manager = CipherConfigManager::new();
        manager.update(|c| c.block_size = 2048).unwrap();
        manager.persist(&store).unwrap();

        let reloaded = CipherConfigManager::load(&store);
        assert_eq!(reloaded.current().block_size, 2048);
    }

    #[test]
    fn test_load_falls_back_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, b"{\"cipher.config\": \"not a config\"}").unwrap();

        let manager = CipherConfigManager::load(&KvStore::open(path));
        assert_eq!(manager.current(), CipherConfig::default());
    }
}
