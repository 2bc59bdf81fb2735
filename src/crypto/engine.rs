//! Per-session cipher engine.
//!
//! A [`CryptoEngine`] owns everything one tunnel session needs to transform
//! bytes in both directions: the derived key, a fresh random IV, and an
//! independent running state per direction. The engine can be split into
//! its two halves so the outbound and inbound relay tasks each own exactly
//! the state they touch.
//!
//! Failure semantics: construction errors are fatal to session setup. A
//! mid-stream `OperationFailed` leaves the keystream position unknown —
//! callers tear the session down and reconnect instead of retrying.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::CipherConfig;
use crate::error::{Error, Result};

use super::cache::CipherCache;
use super::cfb::{CfbDecryptor, CfbEncryptor};
use super::kdf;
use super::stream::{StreamKind, StreamState};
use super::table::TranslationTable;
use super::{Method, SessionKey};

/// Upper bound on cipher worker threads per operation.
const MAX_CIPHER_WORKERS: usize = 8;

enum EncState {
    Identity,
    Table(Arc<TranslationTable>),
    Stream(StreamState),
    Cfb(CfbEncryptor),
}

enum DecState {
    Identity,
    Table(Arc<TranslationTable>),
    Stream(StreamState),
    Cfb(CfbDecryptor),
}

fn stream_kind(method: Method) -> Option<StreamKind> {
    match method {
        Method::Rc4 | Method::Rc4Md5 => Some(StreamKind::Rc4),
        Method::ChaCha20 => Some(StreamKind::ChaCha20Legacy),
        Method::ChaCha20Ietf => Some(StreamKind::ChaCha20Ietf),
        Method::Salsa20 => Some(StreamKind::Salsa20),
        _ => None,
    }
}

/// The key actually fed to the keystream, after per-session mixing.
fn stream_session_key(method: Method, key: &SessionKey, iv: &[u8]) -> SessionKey {
    if method == Method::Rc4Md5 {
        SessionKey::new(kdf::rc4_md5_session_key(key.as_bytes(), iv).to_vec())
    } else {
        key.clone()
    }
}

fn build_enc_state(
    method: Method,
    key: &SessionKey,
    iv: &[u8],
    table: Option<&Arc<TranslationTable>>,
) -> Result<EncState> {
    if method == Method::None {
        return Ok(EncState::Identity);
    }
    if method == Method::Table {
        let table = table.ok_or_else(|| Error::invalid_parameter("missing translation table"))?;
        return Ok(EncState::Table(Arc::clone(table)));
    }
    if let Some(kind) = stream_kind(method) {
        let session_key = stream_session_key(method, key, iv);
        let nonce = if method == Method::Rc4Md5 {
            // IV already folded into the key
            Vec::new()
        } else {
            iv.to_vec()
        };
        return Ok(EncState::Stream(StreamState::new(kind, session_key, nonce)?));
    }
    Ok(EncState::Cfb(CfbEncryptor::new(method, key.as_bytes(), iv)?))
}

fn build_dec_state(
    method: Method,
    key: &SessionKey,
    iv: &[u8],
    table: Option<&Arc<TranslationTable>>,
) -> Result<DecState> {
    if method == Method::None {
        return Ok(DecState::Identity);
    }
    if method == Method::Table {
        let table = table.ok_or_else(|| Error::invalid_parameter("missing translation table"))?;
        return Ok(DecState::Table(Arc::clone(table)));
    }
    if let Some(kind) = stream_kind(method) {
        let session_key = stream_session_key(method, key, iv);
        let nonce = if method == Method::Rc4Md5 {
            Vec::new()
        } else {
            iv.to_vec()
        };
        return Ok(DecState::Stream(StreamState::new(kind, session_key, nonce)?));
    }
    Ok(DecState::Cfb(CfbDecryptor::new(method, key.as_bytes(), iv)?))
}

/// Map table bytes across scoped worker threads.
fn table_chunked(table: &TranslationTable, data: &mut [u8], span: usize, decode: bool) {
    std::thread::scope(|scope| {
        for chunk in data.chunks_mut(span) {
            scope.spawn(move || {
                if decode {
                    table.decode(chunk);
                } else {
                    table.encode(chunk);
                }
            });
        }
    });
}

/// Outbound half of a cipher session.
pub struct EncryptHalf {
    method: Method,
    config: CipherConfig,
    iv: Vec<u8>,
    state: EncState,
    max_workers: usize,
}

impl EncryptHalf {
    /// The session IV the peer needs to decrypt this direction.
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Cipher method this half was built for.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Encrypt a chunk, advancing the running state.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let started = Instant::now();
        let mut out = plaintext.to_vec();

        let chunked = self.config.use_parallel
            && out.len() > self.config.block_size
            && self.method.is_seekable();

        match &mut self.state {
            EncState::Identity => {}
            EncState::Table(table) => {
                if chunked {
                    table_chunked(table, &mut out, self.config.block_size, false);
                } else {
                    table.encode(&mut out);
                }
            }
            EncState::Stream(stream) => {
                if chunked {
                    stream.apply_chunked(&mut out, self.config.block_size, self.max_workers)?;
                } else {
                    stream.apply(&mut out)?;
                }
            }
            EncState::Cfb(cfb) => cfb.encrypt(&mut out),
        }

        if started.elapsed() > self.config.timeout {
            return Err(Error::OperationTimeout);
        }
        Ok(out)
    }
}

/// Inbound half of a cipher session.
///
/// The direction stays unkeyed until the peer's IV arrives; [`Self::prime`]
/// binds it. Decrypting before priming falls back to the session's own IV,
/// which is what a loopback round trip uses.
pub struct DecryptHalf {
    method: Method,
    config: CipherConfig,
    key: SessionKey,
    table: Option<Arc<TranslationTable>>,
    local_iv: Vec<u8>,
    state: Option<DecState>,
    max_workers: usize,
}

impl DecryptHalf {
    /// IV length the peer must send before ciphertext.
    pub fn iv_len(&self) -> usize {
        self.method.iv_len()
    }

    /// Whether the direction is already bound to an IV.
    pub fn is_primed(&self) -> bool {
        self.state.is_some()
    }

    /// Bind the inbound direction to the peer's IV.
    ///
    /// Must happen before the first `decrypt`; the keystream position is
    /// not rewindable once bytes are consumed.
    pub fn prime(&mut self, remote_iv: &[u8]) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::invalid_parameter(
                "decrypt direction already keyed",
            ));
        }
        if remote_iv.len() != self.method.iv_len() {
            return Err(Error::invalid_parameter(format!(
                "iv length {} does not match method {}",
                remote_iv.len(),
                self.method.as_str()
            )));
        }
        self.state = Some(build_dec_state(
            self.method,
            &self.key,
            remote_iv,
            self.table.as_ref(),
        )?);
        Ok(())
    }

    /// Decrypt a chunk, advancing the running state.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if self.state.is_none() {
            let local_iv = self.local_iv.clone();
            self.state = Some(build_dec_state(
                self.method,
                &self.key,
                &local_iv,
                self.table.as_ref(),
            )?);
        }

        let started = Instant::now();
        let mut out = ciphertext.to_vec();

        let chunked = self.config.use_parallel
            && out.len() > self.config.block_size
            && self.method.is_seekable();

        match self.state.as_mut().expect("state initialized above") {
            DecState::Identity => {}
            DecState::Table(table) => {
                if chunked {
                    table_chunked(table, &mut out, self.config.block_size, true);
                } else {
                    table.decode(&mut out);
                }
            }
            DecState::Stream(stream) => {
                if chunked {
                    stream.apply_chunked(&mut out, self.config.block_size, self.max_workers)?;
                } else {
                    stream.apply(&mut out)?;
                }
            }
            DecState::Cfb(cfb) => cfb.decrypt(&mut out),
        }

        if started.elapsed() > self.config.timeout {
            return Err(Error::OperationTimeout);
        }
        Ok(out)
    }
}

/// Per-session cipher state for one of the supported methods.
pub struct CryptoEngine {
    enc: EncryptHalf,
    dec: DecryptHalf,
}

impl CryptoEngine {
    /// Build a session with a fresh random IV.
    pub fn new(method: Method, password: &str, config: CipherConfig) -> Result<Self> {
        Self::build(method, password, config, None, None)
    }

    /// Build a session, reusing derived material from the shared cache.
    pub fn with_cache(
        method: Method,
        password: &str,
        config: CipherConfig,
        cache: &CipherCache,
    ) -> Result<Self> {
        Self::build(method, password, config, Some(cache), None)
    }

    /// Build a session with an explicit IV instead of a random one.
    ///
    /// Only for reconstructing a peer's direction or for deterministic
    /// tests; normal sessions must let the engine generate the IV so it is
    /// never reused.
    pub fn with_iv(
        method: Method,
        password: &str,
        config: CipherConfig,
        iv: Vec<u8>,
    ) -> Result<Self> {
        Self::build(method, password, config, None, Some(iv))
    }

    fn build(
        method: Method,
        password: &str,
        config: CipherConfig,
        cache: Option<&CipherCache>,
        iv: Option<Vec<u8>>,
    ) -> Result<Self> {
        if !method.is_implemented() {
            return Err(Error::UnsupportedMethod(method.as_str().to_string()));
        }
        if method.requires_key() && password.is_empty() {
            return Err(Error::invalid_parameter("password must not be empty"));
        }

        let key = if method.key_len() > 0 {
            match (cache, config.enable_cache) {
                (Some(cache), true) => cache.derived_key(password, method),
                _ => SessionKey::new(
                    kdf::evp_bytes_to_key(password.as_bytes(), method.key_len()).to_vec(),
                ),
            }
        } else {
            SessionKey::new(Vec::new())
        };
        debug_assert_eq!(key.len(), method.key_len());

        let iv = match iv {
            Some(iv) => {
                if iv.len() != method.iv_len() {
                    return Err(Error::invalid_parameter(format!(
                        "iv length {} does not match method {}",
                        iv.len(),
                        method.as_str()
                    )));
                }
                iv
            }
            None => {
                let mut iv = vec![0u8; method.iv_len()];
                OsRng.fill_bytes(&mut iv);
                iv
            }
        };

        let table = if method == Method::Table {
            Some(match (cache, config.enable_cache) {
                (Some(cache), true) => cache.table(password),
                _ => Arc::new(TranslationTable::derive(password)),
            })
        } else {
            None
        };

        let max_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_CIPHER_WORKERS);

        let enc_state = build_enc_state(method, &key, &iv, table.as_ref())?;

        Ok(Self {
            enc: EncryptHalf {
                method,
                config,
                iv: iv.clone(),
                state: enc_state,
                max_workers,
            },
            dec: DecryptHalf {
                method,
                config,
                key,
                table,
                local_iv: iv,
                state: None,
                max_workers,
            },
        })
    }

    /// Cipher method of this session.
    pub fn method(&self) -> Method {
        self.enc.method
    }

    /// The outbound session IV.
    pub fn iv(&self) -> &[u8] {
        self.enc.iv()
    }

    /// Encrypt a plaintext chunk.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.enc.encrypt(plaintext)
    }

    /// Decrypt a ciphertext chunk.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.dec.decrypt(ciphertext)
    }

    /// Bind the inbound direction to the peer's IV.
    pub fn prime_decrypt(&mut self, remote_iv: &[u8]) -> Result<()> {
        self.dec.prime(remote_iv)
    }

    /// Split into independently owned halves for the two relay tasks.
    pub fn into_split(self) -> (EncryptHalf, DecryptHalf) {
        (self.enc, self.dec)
    }
}
