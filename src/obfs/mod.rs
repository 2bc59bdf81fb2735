//! Traffic obfuscation layer.
//!
//! Wraps ciphertext inside disguise framing so a passive observer sees an
//! innocuous protocol instead of an opaque byte stream:
//!
//! - `plain` — no framing
//! - `http_simple` / `http_post` — an HTTP request header, ciphertext as body
//! - `tls1.2_ticket_auth` — a fake TLS 1.2 ClientHello carrying the first
//!   bytes in a session-ticket extension, then ApplicationData records
//!
//! An [`Obfuscator`] is stateful per session and per direction: the first
//! outbound chunk carries the disguise header, later chunks continue the
//! established framing. Framing errors are protocol violations, never
//! transient: the session is torn down, not repaired.

mod http;
mod tls;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use http::HttpObfs;
use tls::TlsObfs;

/// The closed set of obfuscation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ObfsMethod {
    /// Ciphertext on the wire unchanged
    Plain,
    /// Disguise as an HTTP GET request
    HttpSimple,
    /// Disguise as an HTTP POST upload
    HttpPost,
    /// Disguise as a TLS 1.2 session-ticket handshake
    Tls12TicketAuth,
}

/// Every recognized obfuscation mode.
pub const ALL_OBFS: [ObfsMethod; 4] = [
    ObfsMethod::Plain,
    ObfsMethod::HttpSimple,
    ObfsMethod::HttpPost,
    ObfsMethod::Tls12TicketAuth,
];

impl ObfsMethod {
    /// Canonical configuration-surface name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObfsMethod::Plain => "plain",
            ObfsMethod::HttpSimple => "http_simple",
            ObfsMethod::HttpPost => "http_post",
            ObfsMethod::Tls12TicketAuth => "tls1.2_ticket_auth",
        }
    }
}

impl std::str::FromStr for ObfsMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "" => Ok(ObfsMethod::Plain),
            "http_simple" => Ok(ObfsMethod::HttpSimple),
            "http_post" => Ok(ObfsMethod::HttpPost),
            "tls1.2_ticket_auth" | "tls1_2_ticket_auth" => Ok(ObfsMethod::Tls12TicketAuth),
            other => Err(Error::UnsupportedObfs(other.to_string())),
        }
    }
}

impl TryFrom<String> for ObfsMethod {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ObfsMethod> for String {
    fn from(m: ObfsMethod) -> String {
        m.as_str().to_string()
    }
}

impl std::fmt::Display for ObfsMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum ObfsState {
    Plain,
    Http(HttpObfs),
    Tls(TlsObfs),
}

/// Per-session disguise framing for one of the obfuscation modes.
pub struct Obfuscator {
    method: ObfsMethod,
    state: ObfsState,
}

impl Obfuscator {
    /// Create an obfuscator presenting `host` to observers.
    ///
    /// `host` is what lands in the `Host:` header or TLS SNI; tunnels pass
    /// the obfs param when set, the server address otherwise.
    pub fn new(method: ObfsMethod, host: &str, port: u16) -> Self {
        let state = match method {
            ObfsMethod::Plain => ObfsState::Plain,
            ObfsMethod::HttpSimple => ObfsState::Http(HttpObfs::get(host, port)),
            ObfsMethod::HttpPost => ObfsState::Http(HttpObfs::post(host, port)),
            ObfsMethod::Tls12TicketAuth => ObfsState::Tls(TlsObfs::new(host)),
        };
        Self { method, state }
    }

    /// Obfuscation mode this instance frames for.
    pub fn method(&self) -> ObfsMethod {
        self.method
    }

    /// Wrap an outbound ciphertext chunk in disguise framing.
    pub fn obfuscate(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        match &mut self.state {
            ObfsState::Plain => ciphertext.to_vec(),
            ObfsState::Http(http) => http.wrap(ciphertext),
            ObfsState::Tls(tls) => tls.wrap(ciphertext),
        }
    }

    /// Strip disguise framing from an inbound chunk.
    ///
    /// HTTP modes require the complete header in the first call and fail
    /// with [`Error::InvalidProtocol`] when the `\r\n\r\n` delimiter is
    /// absent — truncated framing never yields partial data. The TLS mode
    /// reassembles records internally and returns whatever payload is
    /// complete so far.
    pub fn deobfuscate(&mut self, framed: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            ObfsState::Plain => Ok(framed.to_vec()),
            ObfsState::Http(http) => http.unwrap(framed),
            ObfsState::Tls(tls) => tls.unwrap(framed),
        }
    }

    /// Streaming unframe for relay reads.
    ///
    /// Unlike [`Self::deobfuscate`], a frame header split across reads is
    /// reassembled internally and the call yields an empty chunk until
    /// enough bytes arrive. Corrupt framing still fails with
    /// [`Error::InvalidProtocol`].
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            ObfsState::Plain => Ok(chunk.to_vec()),
            ObfsState::Http(http) => http.feed(chunk),
            ObfsState::Tls(tls) => tls.unwrap(chunk),
        }
    }
}

/// Format bytes as lowercase hex, for disguise tokens.
pub(crate) fn hex_token(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
