//! # SSR Tunneling Engine
//!
//! A ShadowsocksR-style tunnel core: a pluggable symmetric-cipher
//! subsystem, a traffic-obfuscation layer, a pooled upstream transport,
//! and the resource governors that keep a proxy client inside tight
//! memory and CPU ceilings.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           LocalServer (per-connection sessions)          │
//! ├─────────────────────────────────────────────────────────┤
//! │  ProtocolHandler (encrypt→obfuscate out, reverse in)    │
//! ├────────────────────────────┬────────────────────────────┤
//! │  CryptoEngine (18 methods) │  Obfuscator (HTTP / TLS)   │
//! ├────────────────────────────┴────────────────────────────┤
//! │        ConnectionPool (reusable upstream TCP)           │
//! ├─────────────────────────────────────────────────────────┤
//! │   MemoryOptimizer · PerformanceMonitor · ConfigManager  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Interchangeable ciphers**: one encrypt/decrypt contract across
//!    stream, CFB-block, table, and identity constructions
//! 2. **Unobservability**: ciphertext disguised as HTTP requests or TLS 1.2
//!    records
//! 3. **Bounded resources**: adaptive cache reclaim under OS memory
//!    pressure, pooled upstream connections with explicit check-in
//!
//! Session secrets are zeroized on teardown and never shared across
//! sessions.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod local;
pub mod memory;
pub mod obfs;
pub mod perf;
pub mod pool;
pub mod protocol;

pub use config::{CipherConfig, CipherConfigManager, SsrConfig};
pub use crypto::{CryptoEngine, Method};
pub use error::{Error, Result};
pub use obfs::{ObfsMethod, Obfuscator};
pub use protocol::{TunnelObserver, TunnelState};

/// Default upstream connect timeout (milliseconds).
pub const CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Default latency-probe timeout (milliseconds).
pub const PROBE_TIMEOUT_MS: u64 = 1_000;

/// Relay read buffer size per direction.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;
