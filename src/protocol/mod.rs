//! Session orchestration.
//!
//! A [`ProtocolHandler`] drives one logical connection end to end:
//!
//! ```text
//! local bytes ──▶ encrypt ──▶ obfuscate ──▶ pooled upstream
//! local bytes ◀── decrypt ◀── deobfuscate ◀── pooled upstream
//! ```
//!
//! The outbound stream opens with the session IV so the server can key its
//! inbound direction; symmetrically, the first `iv_len` deobfuscated bytes
//! from the server prime our decrypt half. State transitions, traffic
//! deltas, and reports reach the host through the [`TunnelObserver`] it
//! registered — no platform notification bus.

mod metrics;

pub use metrics::TunnelMetrics;

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{CipherConfigManager, SsrConfig};
use crate::crypto::{CipherCache, CryptoEngine, DecryptHalf, EncryptHalf};
use crate::error::{Error, Result};
use crate::memory::{MemoryConfig, MemoryOptimizer};
use crate::obfs::Obfuscator;
use crate::pool::{ConnectionPool, PooledConnection};

/// Connection lifecycle states reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Upstream connection being established
    Connecting,
    /// Relay loop running
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Session over, resources released
    Disconnected,
    /// Session ended on an unrecoverable error
    Error,
}

/// Status surface the host registers.
///
/// All methods default to no-ops so hosts implement only what they render.
/// Traffic deltas are signed so a host can feed them straight into
/// gauge-style counters.
pub trait TunnelObserver: Send + Sync {
    /// Connection state transition.
    fn on_state(&self, _state: TunnelState) {}
    /// Bytes moved since the last call (sent, received).
    fn on_traffic(&self, _bytes_sent: i64, _bytes_received: i64) {}
    /// Textual diagnostic or performance report.
    fn on_report(&self, _report: &str) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl TunnelObserver for NoopObserver {}

/// The process-wide service objects a handler runs against.
///
/// Constructed once and injected, never reached through globals; tests get
/// isolation by building their own set.
#[derive(Clone)]
pub struct Services {
    /// Cipher execution tuning
    pub cipher_config: Arc<CipherConfigManager>,
    /// Derived-material cache
    pub cipher_cache: Arc<CipherCache>,
    /// Upstream connection pool
    pub pool: Arc<ConnectionPool>,
    /// Memory governor
    pub memory: Arc<MemoryOptimizer>,
    /// Aggregate counters
    pub metrics: Arc<TunnelMetrics>,
}

impl Services {
    /// Build the default service set and wire the cipher cache into the
    /// memory governor.
    pub fn new() -> Self {
        let cipher_config = Arc::new(CipherConfigManager::new());
        let cipher_cache = Arc::new(CipherCache::new(
            cipher_config.current().max_cache_size,
        ));
        let memory = Arc::new(MemoryOptimizer::new(MemoryConfig::default()));
        memory.register_cache(Arc::clone(&cipher_cache) as Arc<_>);

        Self {
            cipher_config,
            cipher_cache,
            pool: Arc::new(ConnectionPool::default()),
            memory,
            metrics: Arc::new(TunnelMetrics::new()),
        }
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new()
    }
}

/// How a relay loop ended.
enum RelayOutcome {
    /// The local application closed its side
    LocalClosed,
    /// The upstream server closed its side
    UpstreamClosed,
}

/// Buffers inbound ciphertext until the peer IV is complete, then decrypts.
struct InboundDecryptor {
    dec: DecryptHalf,
    iv_buf: Vec<u8>,
}

impl InboundDecryptor {
    fn new(dec: DecryptHalf) -> Self {
        Self {
            dec,
            iv_buf: Vec::new(),
        }
    }

    fn push(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut data = ciphertext;

        if !self.dec.is_primed() {
            let needed = self.dec.iv_len() - self.iv_buf.len();
            let take = needed.min(data.len());
            self.iv_buf.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.iv_buf.len() < self.dec.iv_len() {
                return Ok(Vec::new());
            }
            let iv = std::mem::take(&mut self.iv_buf);
            self.dec.prime(&iv)?;
        }

        if data.is_empty() {
            return Ok(Vec::new());
        }
        self.dec.decrypt(data)
    }
}

/// Drives obfuscate→encrypt→send and receive→decrypt→deobfuscate for one
/// logical connection.
pub struct ProtocolHandler {
    config: Arc<SsrConfig>,
    services: Services,
    observer: Arc<dyn TunnelObserver>,
}

impl ProtocolHandler {
    /// Validate the configuration and bind the handler to its services.
    pub fn new(
        config: Arc<SsrConfig>,
        services: Services,
        observer: Arc<dyn TunnelObserver>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            services,
            observer,
        })
    }

    /// The session configuration this handler runs.
    pub fn config(&self) -> &SsrConfig {
        &self.config
    }

    /// Tunnel one local stream through the SSR server until either side
    /// closes or the session fails.
    pub async fn run(&self, local: TcpStream) -> Result<()> {
        self.observer.on_state(TunnelState::Connecting);

        if !self.services.memory.can_allocate() {
            self.observer.on_state(TunnelState::Error);
            return Err(Error::TooManyConnections);
        }

        let cipher_cfg = self.services.cipher_config.current();

        // Bounded retry on transient connect failures only
        let mut attempt = 0u32;
        let upstream = loop {
            match self
                .services
                .pool
                .get(&self.config.server_address, self.config.server_port)
                .await
            {
                Ok(conn) => break conn,
                Err(e) if e.is_recoverable() && attempt < cipher_cfg.max_retries => {
                    attempt += 1;
                    self.services.metrics.record_connect_failure();
                    tracing::debug!(attempt, error = %e, "retrying upstream connection");
                }
                Err(e) => {
                    self.services.metrics.record_connect_failure();
                    self.observer.on_state(TunnelState::Error);
                    return Err(e);
                }
            }
        };

        // Per-session cipher and disguise state; construction failures are
        // fatal to setup, no retry
        let engine = CryptoEngine::with_cache(
            self.config.method,
            &self.config.password,
            cipher_cfg,
            &self.services.cipher_cache,
        )?;
        let (enc, dec) = engine.into_split();

        let obfs_host = self.config.obfs_host().to_string();
        let out_obfs = Obfuscator::new(self.config.obfs, &obfs_host, self.config.server_port);
        let in_obfs = Obfuscator::new(self.config.obfs, &obfs_host, self.config.server_port);

        self.observer.on_state(TunnelState::Connected);
        self.services.metrics.session_opened();
        tracing::info!(
            endpoint = %upstream.endpoint(),
            method = %self.config.method,
            obfs = %self.config.obfs,
            reused = upstream.was_reused(),
            "session established"
        );

        let result = self
            .relay(local, upstream, enc, InboundDecryptor::new(dec), out_obfs, in_obfs)
            .await;
        self.services.metrics.session_closed();
        self.observer.on_state(TunnelState::Disconnecting);

        match result {
            Ok(()) => {
                self.observer.on_state(TunnelState::Disconnected);
                Ok(())
            }
            Err(e) => {
                if e.poisons_session() {
                    self.services.metrics.record_protocol_error();
                }
                tracing::debug!(error = %e, "session ended with error");
                self.observer.on_state(TunnelState::Error);
                Err(e)
            }
        }
    }

    async fn relay(
        &self,
        mut local: TcpStream,
        mut upstream: PooledConnection,
        mut enc: EncryptHalf,
        mut dec: InboundDecryptor,
        mut out_obfs: Obfuscator,
        mut in_obfs: Obfuscator,
    ) -> Result<()> {
        let outcome = {
            let (mut local_rd, mut local_wr) = local.split();
            let (mut up_rd, mut up_wr) = upstream.stream_mut().split();

            let mut local_buf = vec![0u8; crate::RELAY_BUFFER_SIZE];
            let mut up_buf = vec![0u8; crate::RELAY_BUFFER_SIZE];
            let mut iv_sent = false;

            loop {
                tokio::select! {
                    read = local_rd.read(&mut local_buf) => {
                        let n = read?;
                        if n == 0 {
                            break RelayOutcome::LocalClosed;
                        }

                        let mut ciphertext = Vec::with_capacity(n + enc.iv().len());
                        if !iv_sent {
                            ciphertext.extend_from_slice(enc.iv());
                            iv_sent = true;
                        }
                        ciphertext.extend(enc.encrypt(&local_buf[..n])?);

                        let framed = out_obfs.obfuscate(&ciphertext);
                        up_wr.write_all(&framed).await?;

                        self.services.metrics.add_bytes_sent(n as u64);
                        self.observer.on_traffic(n as i64, 0);
                    }
                    read = up_rd.read(&mut up_buf) => {
                        let n = read?;
                        if n == 0 {
                            break RelayOutcome::UpstreamClosed;
                        }

                        let ciphertext = in_obfs.feed(&up_buf[..n])?;
                        if ciphertext.is_empty() {
                            continue;
                        }
                        let plaintext = dec.push(&ciphertext)?;
                        if plaintext.is_empty() {
                            continue;
                        }
                        local_wr.write_all(&plaintext).await?;

                        self.services.metrics.add_bytes_received(plaintext.len() as u64);
                        self.observer.on_traffic(0, plaintext.len() as i64);
                    }
                }
            }
        };

        match outcome {
            RelayOutcome::LocalClosed => {
                // Upstream socket is still healthy; make it reusable
                self.services.pool.checkin(upstream);
            }
            RelayOutcome::UpstreamClosed => {
                // Dropping closes the dead socket without re-registering it
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::crypto::Method;
    use crate::obfs::ObfsMethod;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    #[test]
    fn test_inbound_decryptor_iv_split_across_reads() {
        let config = crate::config::CipherConfig::default();
        let mut sender =
            CryptoEngine::new(Method::Aes256Cfb, "hunter2", config).unwrap();
        let receiver = CryptoEngine::new(Method::Aes256Cfb, "hunter2", config).unwrap();
        let (_, dec) = receiver.into_split();
        let mut inbound = InboundDecryptor::new(dec);

        let mut wire = sender.iv().to_vec();
        wire.extend(sender.encrypt(b"split iv delivery").unwrap());

        // Half the IV, then the rest
        assert_eq!(inbound.push(&wire[..8]).unwrap(), Vec::<u8>::new());
        assert_eq!(inbound.push(&wire[8..]).unwrap(), b"split iv delivery");
    }

    #[test]
    fn test_inbound_decryptor_zero_iv_method() {
        let config = crate::config::CipherConfig::default();
        let mut sender = CryptoEngine::new(Method::Rc4, "hunter2", config).unwrap();
        let receiver = CryptoEngine::new(Method::Rc4, "hunter2", config).unwrap();
        let (_, dec) = receiver.into_split();
        let mut inbound = InboundDecryptor::new(dec);

        let wire = sender.encrypt(b"no iv at all").unwrap();
        assert_eq!(inbound.push(&wire).unwrap(), b"no iv at all");
    }

    /// Observer that records state transitions.
    struct RecordingObserver {
        states: Mutex<Vec<TunnelState>>,
    }

    impl RecordingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(Vec::new()),
            })
        }
    }

    impl TunnelObserver for RecordingObserver {
        fn on_state(&self, state: TunnelState) {
            self.states.lock().push(state);
        }
    }

    fn test_config(server_port: u16, local_port: u16) -> SsrConfig {
        SsrConfig {
            server_address: "127.0.0.1".into(),
            server_port,
            local_port,
            password: "hunter2".into(),
            method: Method::Aes256Cfb,
            protocol: Protocol::Origin,
            protocol_param: None,
            obfs: ObfsMethod::HttpSimple,
            obfs_param: None,
            remarks: String::new(),
        }
    }

    /// Minimal SSR peer: unwraps, decrypts, and echoes the plaintext back
    /// through its own freshly keyed outbound direction.
    async fn echo_ssr_server(listener: TcpListener, config: SsrConfig) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let config = config.clone();

            tokio::spawn(async move {
                let cipher_cfg = crate::config::CipherConfig::default();
                let engine =
                    CryptoEngine::new(config.method, &config.password, cipher_cfg).unwrap();
                let (mut enc, dec) = engine.into_split();
                let mut inbound = InboundDecryptor::new(dec);
                let mut in_obfs =
                    Obfuscator::new(config.obfs, config.obfs_host(), config.server_port);
                let mut out_obfs =
                    Obfuscator::new(config.obfs, config.obfs_host(), config.server_port);

                let mut buf = vec![0u8; 16 * 1024];
                let mut iv_sent = false;
                loop {
                    let Ok(n) = stream.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }

                    let ciphertext = in_obfs.feed(&buf[..n]).unwrap();
                    if ciphertext.is_empty() {
                        continue;
                    }
                    let plaintext = inbound.push(&ciphertext).unwrap();
                    if plaintext.is_empty() {
                        continue;
                    }

                    let mut reply = Vec::new();
                    if !iv_sent {
                        reply.extend_from_slice(enc.iv());
                        iv_sent = true;
                    }
                    reply.extend(enc.encrypt(&plaintext).unwrap());
                    let framed = out_obfs.obfuscate(&reply);
                    if stream.write_all(&framed).await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_end_to_end_echo_session() {
        // Fake SSR server
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_port = server.local_addr().unwrap().port();
        let config = test_config(server_port, 1);
        tokio::spawn(echo_ssr_server(server, config.clone()));

        // Local side: a connected socket pair stands in for the app
        let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_listener.local_addr().unwrap();

        let observer = RecordingObserver::new();
        let services = Services::new();
        let handler = ProtocolHandler::new(
            Arc::new(config),
            services.clone(),
            observer.clone() as Arc<dyn TunnelObserver>,
        )
        .unwrap();

        let session = tokio::spawn(async move {
            let (stream, _) = local_listener.accept().await.unwrap();
            handler.run(stream).await
        });

        let mut app = TcpStream::connect(local_addr).await.unwrap();
        app.write_all(b"hello through the tunnel").await.unwrap();

        let mut reply = vec![0u8; 64];
        let n = app.read(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"hello through the tunnel");

        // Second exchange over the same session
        app.write_all(b"second message").await.unwrap();
        let n = app.read(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"second message");

        drop(app);
        session.await.unwrap().unwrap();

        let states = observer.states.lock().clone();
        assert_eq!(states.first(), Some(&TunnelState::Connecting));
        assert!(states.contains(&TunnelState::Connected));
        assert_eq!(states.last(), Some(&TunnelState::Disconnected));

        assert_eq!(services.metrics.bytes_sent(), 38);
        assert_eq!(services.metrics.bytes_received(), 38);
        assert_eq!(services.metrics.active_sessions(), 0);
        // Clean local close returned the upstream connection to the pool
        assert_eq!(services.pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error_state() {
        // Bind then drop for a dead port
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_listener.local_addr().unwrap();

        let observer = RecordingObserver::new();
        let services = Services::new();
        services
            .cipher_config
            .update(|c| c.max_retries = 1)
            .unwrap();

        let handler = ProtocolHandler::new(
            Arc::new(test_config(dead_port, 1)),
            services.clone(),
            observer.clone() as Arc<dyn TunnelObserver>,
        )
        .unwrap();

        let session = tokio::spawn(async move {
            let (stream, _) = local_listener.accept().await.unwrap();
            handler.run(stream).await
        });

        let _app = TcpStream::connect(local_addr).await.unwrap();
        let result = session.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionFailed(_))));

        let states = observer.states.lock().clone();
        assert_eq!(states.last(), Some(&TunnelState::Error));
        // One retry plus the final failure
        assert_eq!(services.metrics.connect_failures(), 2);
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut config = test_config(8388, 1080);
        config.password.clear();

        let result = ProtocolHandler::new(
            Arc::new(config),
            Services::new(),
            Arc::new(NoopObserver),
        );
        assert!(result.is_err());
    }
}
