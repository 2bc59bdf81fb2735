//! Key-value persistence for tunable configuration.
//!
//! Configs are stored as a single JSON object file mapping documented keys
//! to encoded blobs. Decode failures are deliberately non-fatal: a corrupt
//! or stale entry yields `None` and the caller falls back to its documented
//! defaults, so a bad write can never wedge process startup.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Storage key for the persisted [`crate::config::CipherConfig`].
pub const CIPHER_CONFIG_KEY: &str = "cipher.config";

/// Storage key for the persisted [`crate::memory::MemoryConfig`].
pub const MEMORY_CONFIG_KEY: &str = "memory.config";

/// A flat JSON-backed key-value store.
pub struct KvStore {
    path: PathBuf,
}

impl KvStore {
    /// Open a store at the given path. The file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetch and decode a value, or `None` when the file, key, or decode
    /// is missing/broken.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.read_map().ok()?.remove(key)?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding undecodable persisted entry");
                None
            }
        }
    }

    /// Encode and store a value under the given key.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut map = self.read_map().unwrap_or_default();
        let encoded = serde_json::to_value(value)
            .map_err(|e| Error::Unknown(format!("config encode failed: {e}")))?;
        map.insert(key.to_string(), encoded);

        let body = serde_json::to_vec_pretty(&Value::Object(map))
            .map_err(|e| Error::Unknown(format!("config encode failed: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, body)?;
        Ok(())
    }

    /// Remove a key. Missing keys are not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        let mut map = match self.read_map() {
            Ok(map) => map,
            Err(_) => return Ok(()),
        };
        if map.remove(key).is_some() {
            let body = serde_json::to_vec_pretty(&Value::Object(map))
                .map_err(|e| Error::Unknown(format!("config encode failed: {e}")))?;
            std::fs::write(&self.path, body)?;
        }
        Ok(())
    }

    fn read_map(&self) -> std::io::Result<Map<String, Value>> {
        let body = std::fs::read(&self.path)?;
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Ok(Map::new()),
        }
    }
}
