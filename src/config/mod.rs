//! Session and engine configuration.
//!
//! Three layers of configuration with different lifetimes:
//!
//! 1. [`SsrConfig`] — one immutable value per tunnel session, created at
//!    connect time and dropped at disconnect.
//! 2. [`CipherConfig`] — process-wide cipher execution tuning, mutable only
//!    through [`CipherConfigManager`].
//! 3. [`KvStore`] — on-disk persistence for the tunable configs, reloaded
//!    at process start with documented defaults on decode failure.

mod cipher;
mod persist;

pub use cipher::{CipherConfig, CipherConfigManager, ConfigPreset};
pub use persist::{KvStore, CIPHER_CONFIG_KEY, MEMORY_CONFIG_KEY};

use serde::{Deserialize, Serialize};

use crate::crypto::Method;
use crate::error::{Error, Result};
use crate::obfs::ObfsMethod;

/// Protocol plugin layered between cipher and obfuscation.
///
/// Only `origin` (no plugin framing) is currently implemented; the
/// authenticated variants are recognized so configurations parse, but
/// [`SsrConfig::validate`] rejects them until a real implementation exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Protocol {
    /// Plain SSR stream, no protocol framing
    Origin,
    /// SHA1-HMAC per-connection authentication
    AuthSha1V4,
    /// AES-128 + MD5 packet authentication
    AuthAes128Md5,
    /// AES-128 + SHA1 packet authentication
    AuthAes128Sha1,
    /// Chained-hash authentication, variant A
    AuthChainA,
    /// Chained-hash authentication, variant B
    AuthChainB,
}

impl Protocol {
    /// Canonical configuration-surface name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Origin => "origin",
            Protocol::AuthSha1V4 => "auth_sha1_v4",
            Protocol::AuthAes128Md5 => "auth_aes128_md5",
            Protocol::AuthAes128Sha1 => "auth_aes128_sha1",
            Protocol::AuthChainA => "auth_chain_a",
            Protocol::AuthChainB => "auth_chain_b",
        }
    }

    /// Whether this plugin has a working implementation.
    pub fn is_implemented(&self) -> bool {
        matches!(self, Protocol::Origin)
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "origin" => Ok(Protocol::Origin),
            "auth_sha1_v4" => Ok(Protocol::AuthSha1V4),
            "auth_aes128_md5" => Ok(Protocol::AuthAes128Md5),
            "auth_aes128_sha1" => Ok(Protocol::AuthAes128Sha1),
            "auth_chain_a" => Ok(Protocol::AuthChainA),
            "auth_chain_b" => Ok(Protocol::AuthChainB),
            other => Err(Error::InvalidConfiguration(format!(
                "unknown protocol: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Protocol> for String {
    fn from(p: Protocol) -> String {
        p.as_str().to_string()
    }
}

/// Immutable per-session tunnel configuration.
///
/// Created when the host asks for a connection and dropped on disconnect.
/// All tunables that outlive a session live in [`CipherConfig`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsrConfig {
    /// Remote SSR server hostname or IP
    pub server_address: String,
    /// Remote SSR server port
    pub server_port: u16,
    /// Local listen port for application traffic
    pub local_port: u16,
    /// Shared password the session key is derived from
    pub password: String,
    /// Cipher method
    pub method: Method,
    /// Protocol plugin
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    /// Protocol plugin parameter
    #[serde(default)]
    pub protocol_param: Option<String>,
    /// Obfuscation mode
    #[serde(default = "default_obfs")]
    pub obfs: ObfsMethod,
    /// Obfuscation parameter (e.g. the Host header to present)
    #[serde(default)]
    pub obfs_param: Option<String>,
    /// Free-form label shown by the host UI
    #[serde(default)]
    pub remarks: String,
}

fn default_protocol() -> Protocol {
    Protocol::Origin
}

fn default_obfs() -> ObfsMethod {
    ObfsMethod::Plain
}

impl SsrConfig {
    /// Validate the configuration before a session is built from it.
    ///
    /// Construction-time validation failures are fatal to session setup;
    /// callers abort rather than retry.
    pub fn validate(&self) -> Result<()> {
        if self.server_address.is_empty() {
            return Err(Error::InvalidAddress("server address is empty".into()));
        }
        if self.server_address.contains(char::is_whitespace) {
            return Err(Error::InvalidAddress(self.server_address.clone()));
        }
        if self.server_port == 0 {
            return Err(Error::InvalidPort(self.server_port));
        }
        if self.local_port == 0 {
            return Err(Error::InvalidPort(self.local_port));
        }
        if self.password.is_empty() && self.method.requires_key() {
            return Err(Error::InvalidConfiguration(
                "password required for keyed cipher methods".into(),
            ));
        }
        if !self.protocol.is_implemented() {
            return Err(Error::InvalidConfiguration(format!(
                "protocol plugin {} is not implemented",
                self.protocol.as_str()
            )));
        }
        Ok(())
    }

    /// Upstream endpoint in `host:port` form, the connection-pool key.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }

    /// The hostname the obfuscator should present to observers.
    pub fn obfs_host(&self) -> &str {
        self.obfs_param
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.server_address)
    }
}
