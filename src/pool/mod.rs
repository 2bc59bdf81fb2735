//! Reusable upstream TCP connections.
//!
//! Connections are keyed by `"host:port"` and amortize handshake cost
//! across sessions. The checkout contract is explicit:
//!
//! - [`ConnectionPool::get`] hands an idle connection to exactly one caller
//!   (it leaves the idle list atomically) or dials a new one under a
//!   bounded timeout; a connection is registered only after the dial
//!   succeeds, so half-open sockets never enter the bookkeeping.
//! - [`ConnectionPool::checkin`] returns a still-healthy connection to the
//!   idle list. Dropping a [`PooledConnection`] without check-in closes the
//!   socket.
//!
//! All map mutations serialize on one lock; the dial itself happens outside
//! it so slow handshakes never block other callers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Pool tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Bound on connection establishment
    pub connect_timeout: Duration,
    /// Idle connections retained per endpoint
    pub max_idle_per_endpoint: usize,
    /// Idle connections older than this are discarded on checkout
    pub max_idle_age: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(crate::CONNECT_TIMEOUT_MS),
            max_idle_per_endpoint: 4,
            max_idle_age: Duration::from_secs(60),
        }
    }
}

struct IdleConn {
    stream: TcpStream,
    created_at: Instant,
}

/// A connection checked out of the pool.
///
/// Held exclusively by one caller until checked back in or dropped.
pub struct PooledConnection {
    stream: TcpStream,
    endpoint: String,
    created_at: Instant,
    reused: bool,
}

impl PooledConnection {
    /// The `"host:port"` key this connection belongs to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether this connection came from the idle list.
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    /// Time since the underlying socket was established.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Mutable access to the underlying stream.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Upstream connection pool.
pub struct ConnectionPool {
    config: PoolConfig,
    idle: Mutex<HashMap<String, Vec<IdleConn>>>,
}

impl ConnectionPool {
    /// Create a pool with the given tuning.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Checkout a connection for `host:port`.
    ///
    /// Prefers the most recently checked-in idle connection; stale entries
    /// found on the way are discarded. Otherwise dials a fresh connection
    /// bounded by `connect_timeout`, returning [`Error::Timeout`] or
    /// [`Error::ConnectionFailed`] without registering anything on failure.
    pub async fn get(&self, host: &str, port: u16) -> Result<PooledConnection> {
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(Error::InvalidEndpoint(format!("bad host {host:?}")));
        }
        if port == 0 {
            return Err(Error::InvalidEndpoint("port 0".into()));
        }

        let endpoint = format!("{host}:{port}");

        if let Some(idle) = self.take_idle(&endpoint) {
            tracing::debug!(%endpoint, "reusing pooled connection");
            return Ok(PooledConnection {
                stream: idle.stream,
                endpoint,
                created_at: idle.created_at,
                reused: true,
            });
        }

        let dial = TcpStream::connect((host, port));
        let stream = tokio::time::timeout(self.config.connect_timeout, dial)
            .await
            .map_err(|_| Error::Timeout(self.config.connect_timeout.as_millis() as u64))?
            .map_err(|e| Error::ConnectionFailed(format!("{endpoint}: {e}")))?;
        stream.set_nodelay(true)?;

        tracing::debug!(%endpoint, "established upstream connection");
        Ok(PooledConnection {
            stream,
            endpoint,
            created_at: Instant::now(),
            reused: false,
        })
    }

    /// Return a healthy connection to the idle list.
    ///
    /// Callers must only check in connections whose stream is still in a
    /// clean state; anything that saw an error mid-relay should be dropped
    /// instead. Past the per-endpoint cap the connection is closed.
    pub fn checkin(&self, conn: PooledConnection) {
        let mut idle = self.idle.lock();
        let list = idle.entry(conn.endpoint.clone()).or_default();
        if list.len() >= self.config.max_idle_per_endpoint {
            tracing::debug!(endpoint = %conn.endpoint, "idle list full, closing connection");
            return;
        }
        list.push(IdleConn {
            stream: conn.stream,
            created_at: conn.created_at,
        });
    }

    /// Close every tracked idle connection and clear all bookkeeping.
    pub fn cleanup(&self) {
        let dropped: usize = {
            let mut idle = self.idle.lock();
            let count = idle.values().map(Vec::len).sum();
            idle.clear();
            count
        };
        if dropped > 0 {
            tracing::debug!(dropped, "connection pool cleaned up");
        }
    }

    /// Discard idle connections past their age limit.
    pub fn prune_stale(&self) {
        let mut idle = self.idle.lock();
        let cutoff = self.config.max_idle_age;
        for list in idle.values_mut() {
            list.retain(|c| c.created_at.elapsed() < cutoff);
        }
        idle.retain(|_, list| !list.is_empty());
    }

    /// Total idle connections across all endpoints.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }

    fn take_idle(&self, endpoint: &str) -> Option<IdleConn> {
        let mut idle = self.idle.lock();
        let list = idle.get_mut(endpoint)?;

        let mut found = None;
        while let Some(conn) = list.pop() {
            if conn.created_at.elapsed() >= self.config.max_idle_age {
                // Stale; dropping closes the socket
                continue;
            }
            found = Some(conn);
            break;
        }

        if list.is_empty() {
            idle.remove(endpoint);
        }
        found
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Listener that accepts and holds connections open.
    async fn sink_listener() -> (TcpListener, String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr.ip().to_string(), addr.port())
    }

    fn accept_forever(listener: TcpListener) {
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
    }

    #[tokio::test]
    async fn test_reuse_after_checkin() {
        let (listener, host, port) = sink_listener().await;
        accept_forever(listener);
        let pool = ConnectionPool::default();

        let first = pool.get(&host, port).await.unwrap();
        assert!(!first.was_reused());
        let first_addr = first.stream.local_addr().unwrap();

        pool.checkin(first);
        assert_eq!(pool.idle_count(), 1);

        let second = pool.get(&host, port).await.unwrap();
        assert!(second.was_reused());
        assert_eq!(second.stream.local_addr().unwrap(), first_addr);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_dials_fresh() {
        let (l1, host, port1) = sink_listener().await;
        let (l2, _, port2) = sink_listener().await;
        accept_forever(l1);
        accept_forever(l2);
        let pool = ConnectionPool::default();

        let first = pool.get(&host, port1).await.unwrap();
        pool.checkin(first);

        // Different endpoint never sees the idle entry
        let other = pool.get(&host, port2).await.unwrap();
        assert!(!other.was_reused());
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_no_double_checkout() {
        let (listener, host, port) = sink_listener().await;
        accept_forever(listener);
        let pool = ConnectionPool::default();

        let conn = pool.get(&host, port).await.unwrap();
        pool.checkin(conn);

        let a = pool.get(&host, port).await.unwrap();
        let b = pool.get(&host, port).await.unwrap();
        // Only one of the two can be the pooled socket
        assert!(a.was_reused());
        assert!(!b.was_reused());
        assert_ne!(
            a.stream.local_addr().unwrap(),
            b.stream.local_addr().unwrap()
        );
    }

    #[tokio::test]
    async fn test_cleanup_discards_pooled_connections() {
        let (listener, host, port) = sink_listener().await;
        accept_forever(listener);
        let pool = ConnectionPool::default();

        let conn = pool.get(&host, port).await.unwrap();
        pool.checkin(conn);

        pool.cleanup();
        assert_eq!(pool.idle_count(), 0);

        // A later checkout gets a fresh socket, never a cancelled one
        let fresh = pool.get(&host, port).await.unwrap();
        assert!(!fresh.was_reused());
    }

    #[tokio::test]
    async fn test_stale_idle_discarded_on_checkout() {
        let (listener, host, port) = sink_listener().await;
        accept_forever(listener);
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_age: Duration::ZERO,
            ..Default::default()
        });

        let conn = pool.get(&host, port).await.unwrap();
        pool.checkin(conn);

        let next = pool.get(&host, port).await.unwrap();
        assert!(!next.was_reused());
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_cap_per_endpoint() {
        let (listener, host, port) = sink_listener().await;
        accept_forever(listener);
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_endpoint: 2,
            ..Default::default()
        });

        let a = pool.get(&host, port).await.unwrap();
        let b = pool.get(&host, port).await.unwrap();
        let c = pool.get(&host, port).await.unwrap();
        pool.checkin(a);
        pool.checkin(b);
        pool.checkin(c);

        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_rejected() {
        let pool = ConnectionPool::default();

        assert!(matches!(
            pool.get("", 80).await,
            Err(Error::InvalidEndpoint(_))
        ));
        assert!(matches!(
            pool.get("ssr.example.com", 0).await,
            Err(Error::InvalidEndpoint(_))
        ));
        assert!(matches!(
            pool.get("bad host", 80).await,
            Err(Error::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_typed_error() {
        // Bind then drop to find a port with nothing listening
        let (listener, host, port) = sink_listener().await;
        drop(listener);

        let pool = ConnectionPool::default();
        let result = pool.get(&host, port).await;
        assert!(matches!(result, Err(Error::ConnectionFailed(_))));
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_timeout_is_bounded() {
        let pool = ConnectionPool::new(PoolConfig {
            connect_timeout: Duration::from_millis(50),
            ..Default::default()
        });

        // RFC 5737 TEST-NET-1 address black-holes the SYN
        let result = pool.get("192.0.2.1", 81).await;
        assert!(matches!(
            result,
            Err(Error::Timeout(50)) | Err(Error::ConnectionFailed(_))
        ));
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_prune_stale() {
        let (listener, host, port) = sink_listener().await;
        accept_forever(listener);
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_age: Duration::ZERO,
            ..Default::default()
        });

        let conn = pool.get(&host, port).await.unwrap();
        pool.checkin(conn);
        assert_eq!(pool.idle_count(), 1);

        pool.prune_stale();
        assert_eq!(pool.idle_count(), 0);
    }
}
