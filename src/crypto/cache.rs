//! Bounded cache for derived cipher material.
//!
//! Key derivation is an iterated-MD5 loop and table derivation runs 1024
//! sort rounds, so both are worth caching across sessions to the same
//! server. The cache is an explicit LRU keyed by a content hash of the
//! inputs, bounded in bytes, and registered with the memory optimizer so
//! pressure reclaim can empty it.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::memory::ReclaimableCache;

use super::kdf::{self, content_hash};
use super::table::TranslationTable;
use super::{Method, SessionKey};

/// Approximate per-entry cost of a cached key (hash + material + map slot).
const KEY_ENTRY_COST: u64 = 96;

/// Approximate per-entry cost of a cached table.
const TABLE_ENTRY_COST: u64 = TranslationTable::size_bytes() + 128;

/// Shared cache for derived keys and translation tables.
pub struct CipherCache {
    keys: Mutex<LruCache<[u8; 16], SessionKey>>,
    tables: Mutex<LruCache<[u8; 16], Arc<TranslationTable>>>,
}

impl CipherCache {
    /// Create a cache bounded by `max_bytes`, split evenly between keys
    /// and tables. Eviction is least-recently-used per pool.
    pub fn new(max_bytes: u64) -> Self {
        let key_slots = ((max_bytes / 2) / KEY_ENTRY_COST).max(4) as usize;
        let table_slots = ((max_bytes / 2) / TABLE_ENTRY_COST).max(2) as usize;

        Self {
            keys: Mutex::new(LruCache::new(
                NonZeroUsize::new(key_slots).expect("slot count is non-zero"),
            )),
            tables: Mutex::new(LruCache::new(
                NonZeroUsize::new(table_slots).expect("slot count is non-zero"),
            )),
        }
    }

    /// Fetch or derive the session key for `(password, method)`.
    pub fn derived_key(&self, password: &str, method: Method) -> SessionKey {
        let hash = content_hash(&[password.as_bytes(), method.as_str().as_bytes()]);

        if let Some(key) = self.keys.lock().get(&hash) {
            return key.clone();
        }

        let key = SessionKey::new(
            kdf::evp_bytes_to_key(password.as_bytes(), method.key_len()).to_vec(),
        );
        self.keys.lock().put(hash, key.clone());
        key
    }

    /// Fetch or derive the translation table for a password.
    pub fn table(&self, password: &str) -> Arc<TranslationTable> {
        let hash = content_hash(&[b"table", password.as_bytes()]);

        if let Some(table) = self.tables.lock().get(&hash) {
            return Arc::clone(table);
        }

        let table = Arc::new(TranslationTable::derive(password));
        self.tables.lock().put(hash, Arc::clone(&table));
        table
    }

    /// Number of cached entries across both pools.
    pub fn entry_count(&self) -> usize {
        self.keys.lock().len() + self.tables.lock().len()
    }
}

impl ReclaimableCache for CipherCache {
    fn name(&self) -> &'static str {
        "cipher"
    }

    fn owned_bytes(&self) -> u64 {
        let keys = self.keys.lock().len() as u64 * KEY_ENTRY_COST;
        let tables = self.tables.lock().len() as u64 * TABLE_ENTRY_COST;
        keys + tables
    }

    fn trim(&self) {
        let mut keys = self.keys.lock();
        for _ in 0..keys.len().div_ceil(2) {
            keys.pop_lru();
        }
        drop(keys);

        let mut tables = self.tables.lock();
        for _ in 0..tables.len().div_ceil(2) {
            tables.pop_lru();
        }
    }

    fn clear(&self) {
        self.keys.lock().clear();
        self.tables.lock().clear();
    }
}
