//! Cipher subsystem.
//!
//! This module provides:
//! - [`Method`], the closed set of interchangeable cipher algorithms
//! - [`CryptoEngine`], per-session encrypt/decrypt state
//! - `EVP_BytesToKey` password derivation and the legacy translation table
//! - [`CipherCache`], a bounded LRU for derived material
//!
//! Every construction is deterministic and reversible: `decrypt ∘ encrypt`
//! is the identity for the same `(key, IV)` pair, and ciphertext length
//! always equals plaintext length. Key and IV material is exclusively owned
//! by the session that created it and zeroized on teardown.

mod cache;
mod cfb;
mod engine;
pub(crate) mod kdf;
mod stream;
mod table;

pub use cache::CipherCache;
pub use engine::{CryptoEngine, DecryptHalf, EncryptHalf};
pub use table::TranslationTable;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Longest key any method uses (bytes).
pub const MAX_KEY_LEN: usize = 32;

/// Longest IV any method uses (bytes).
pub const MAX_IV_LEN: usize = 16;

/// The closed set of cipher methods.
///
/// Each method fixes its own key length, IV length, and construction
/// family. Matching on this enum is exhaustive, so adding a method is a
/// compile-time event rather than a runtime dispatch surprise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Method {
    /// Identity transform, for debugging against plain servers
    None,
    /// Password-derived byte permutation
    Table,
    /// RC4 with the derived key used directly
    Rc4,
    /// RC4 keyed per session with `md5(key ‖ iv)`
    Rc4Md5,
    /// AES-128 in CFB mode
    Aes128Cfb,
    /// AES-192 in CFB mode
    Aes192Cfb,
    /// AES-256 in CFB mode
    Aes256Cfb,
    /// Blowfish in CFB mode
    BfCfb,
    /// Camellia-128 in CFB mode
    Camellia128Cfb,
    /// Camellia-192 in CFB mode
    Camellia192Cfb,
    /// Camellia-256 in CFB mode
    Camellia256Cfb,
    /// CAST5 in CFB mode
    Cast5Cfb,
    /// DES in CFB mode
    DesCfb,
    /// IDEA in CFB mode
    IdeaCfb,
    /// RC2 in CFB mode
    Rc2Cfb,
    /// SEED in CFB mode — recognized but not implemented
    SeedCfb,
    /// Original djb ChaCha20 (8-byte nonce)
    ChaCha20,
    /// RFC 8439 ChaCha20 (12-byte nonce)
    ChaCha20Ietf,
    /// Salsa20/20
    Salsa20,
}

/// Every recognized method, in configuration-surface order.
pub const ALL_METHODS: [Method; 19] = [
    Method::None,
    Method::Table,
    Method::Rc4,
    Method::Rc4Md5,
    Method::Aes128Cfb,
    Method::Aes192Cfb,
    Method::Aes256Cfb,
    Method::ChaCha20,
    Method::ChaCha20Ietf,
    Method::Salsa20,
    Method::BfCfb,
    Method::Camellia128Cfb,
    Method::Camellia192Cfb,
    Method::Camellia256Cfb,
    Method::Cast5Cfb,
    Method::DesCfb,
    Method::IdeaCfb,
    Method::Rc2Cfb,
    Method::SeedCfb,
];

impl Method {
    /// Canonical configuration-surface name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::None => "none",
            Method::Table => "table",
            Method::Rc4 => "rc4",
            Method::Rc4Md5 => "rc4-md5",
            Method::Aes128Cfb => "aes-128-cfb",
            Method::Aes192Cfb => "aes-192-cfb",
            Method::Aes256Cfb => "aes-256-cfb",
            Method::BfCfb => "bf-cfb",
            Method::Camellia128Cfb => "camellia-128-cfb",
            Method::Camellia192Cfb => "camellia-192-cfb",
            Method::Camellia256Cfb => "camellia-256-cfb",
            Method::Cast5Cfb => "cast5-cfb",
            Method::DesCfb => "des-cfb",
            Method::IdeaCfb => "idea-cfb",
            Method::Rc2Cfb => "rc2-cfb",
            Method::SeedCfb => "seed-cfb",
            Method::ChaCha20 => "chacha20",
            Method::ChaCha20Ietf => "chacha20-ietf",
            Method::Salsa20 => "salsa20",
        }
    }

    /// Derived key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            Method::None | Method::Table => 0,
            Method::Rc4 | Method::Rc4Md5 => 16,
            Method::Aes128Cfb | Method::Camellia128Cfb => 16,
            Method::Aes192Cfb | Method::Camellia192Cfb => 24,
            Method::Aes256Cfb | Method::Camellia256Cfb => 32,
            Method::BfCfb | Method::Cast5Cfb | Method::IdeaCfb | Method::Rc2Cfb => 16,
            Method::DesCfb => 8,
            Method::SeedCfb => 16,
            Method::ChaCha20 | Method::ChaCha20Ietf | Method::Salsa20 => 32,
        }
    }

    /// Per-session IV length in bytes.
    pub fn iv_len(&self) -> usize {
        match self {
            Method::None | Method::Table | Method::Rc4 => 0,
            Method::Rc4Md5 => 16,
            Method::Aes128Cfb | Method::Aes192Cfb | Method::Aes256Cfb => 16,
            Method::Camellia128Cfb | Method::Camellia192Cfb | Method::Camellia256Cfb => 16,
            Method::SeedCfb => 16,
            Method::BfCfb | Method::Cast5Cfb | Method::IdeaCfb | Method::Rc2Cfb => 8,
            Method::DesCfb => 8,
            Method::ChaCha20 | Method::Salsa20 => 8,
            Method::ChaCha20Ietf => 12,
        }
    }

    /// Whether the method derives key material from the password.
    pub fn requires_key(&self) -> bool {
        !matches!(self, Method::None)
    }

    /// Whether the method is a keystream-XOR construction.
    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            Method::Rc4
                | Method::Rc4Md5
                | Method::ChaCha20
                | Method::ChaCha20Ietf
                | Method::Salsa20
        )
    }

    /// Whether the method is a block cipher chained in CFB mode.
    pub fn is_cfb(&self) -> bool {
        matches!(
            self,
            Method::Aes128Cfb
                | Method::Aes192Cfb
                | Method::Aes256Cfb
                | Method::BfCfb
                | Method::Camellia128Cfb
                | Method::Camellia192Cfb
                | Method::Camellia256Cfb
                | Method::Cast5Cfb
                | Method::DesCfb
                | Method::IdeaCfb
                | Method::Rc2Cfb
                | Method::SeedCfb
        )
    }

    /// Whether large inputs may be processed as concurrent chunks.
    ///
    /// Only constructions whose output at byte `n` depends on nothing but
    /// `(key, IV, n)` qualify: the counter-mode keystreams and the
    /// stateless table map. RC4's running state and CFB's ciphertext
    /// chaining must serialize.
    pub fn is_seekable(&self) -> bool {
        matches!(
            self,
            Method::None
                | Method::Table
                | Method::ChaCha20
                | Method::ChaCha20Ietf
                | Method::Salsa20
        )
    }

    /// Whether a working implementation exists.
    ///
    /// `seed-cfb` is recognized for configuration compatibility but has no
    /// vetted primitive available; sessions must refuse it rather than
    /// silently substitute another cipher.
    pub fn is_implemented(&self) -> bool {
        !matches!(self, Method::SeedCfb)
    }
}

impl std::str::FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // Both spellings seen in the wild are accepted: "rc4-md5"/"rc4_md5"
        let normalized = s.to_ascii_lowercase().replace('_', "-");
        ALL_METHODS
            .iter()
            .find(|m| m.as_str() == normalized)
            .copied()
            .ok_or_else(|| Error::UnsupportedMethod(s.to_string()))
    }
}

impl TryFrom<String> for Method {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Method> for String {
    fn from(m: Method) -> String {
        m.as_str().to_string()
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session key material, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    /// Wrap derived key bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw key bytes. Secret material, handle with care.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is empty (only valid for `none` and `table`).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key bytes
        write!(f, "SessionKey({} bytes)", self.0.len())
    }
}
