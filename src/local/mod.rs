//! Local listener.
//!
//! Accepts application TCP streams on the configured local port and drives
//! one [`ProtocolHandler`] session per accepted connection. The accept loop
//! runs until [`LocalServer::shutdown`], which also stops the pool and the
//! background governors deterministically.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::SsrConfig;
use crate::error::Result;
use crate::protocol::{ProtocolHandler, Services, TunnelMetrics, TunnelObserver};

/// Cadence for discarding stale idle pool connections.
const POOL_PRUNE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Accepts local application traffic and tunnels it upstream.
pub struct LocalServer {
    config: Arc<SsrConfig>,
    services: Services,
    observer: Arc<dyn TunnelObserver>,
    shutdown_tx: watch::Sender<bool>,
}

impl LocalServer {
    /// Create a server with a fresh default service set.
    pub fn new(config: SsrConfig, observer: Arc<dyn TunnelObserver>) -> Result<Self> {
        Self::with_services(config, Services::new(), observer)
    }

    /// Create a server against an injected service set.
    pub fn with_services(
        config: SsrConfig,
        services: Services,
        observer: Arc<dyn TunnelObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            services,
            observer,
            shutdown_tx,
        })
    }

    /// The service objects this server runs against.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Aggregate tunnel counters.
    pub fn metrics(&self) -> Arc<TunnelMetrics> {
        Arc::clone(&self.services.metrics)
    }

    /// Run the accept loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener =
            TcpListener::bind(("127.0.0.1", self.config.local_port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            %local_addr,
            upstream = %self.config.endpoint(),
            method = %self.config.method,
            "local server listening"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut prune_ticker = tokio::time::interval(POOL_PRUNE_INTERVAL);
        prune_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = prune_ticker.tick() => {
                    self.services.pool.prune_stale();
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "accepted local connection");
                            self.spawn_session(stream);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        tracing::info!("local server shutting down");
        self.services.pool.cleanup();
        self.observer
            .on_report(&self.services.metrics.format_report());
        Ok(())
    }

    fn spawn_session(&self, stream: tokio::net::TcpStream) {
        let handler = match ProtocolHandler::new(
            Arc::clone(&self.config),
            self.services.clone(),
            Arc::clone(&self.observer),
        ) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(error = %e, "session setup rejected");
                return;
            }
        };

        tokio::spawn(async move {
            if let Err(e) = handler.run(stream).await {
                tracing::debug!(error = %e, "session ended");
            }
        });
    }

    /// Stop the accept loop; in-flight sessions drain on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::crypto::Method;
    use crate::obfs::ObfsMethod;
    use crate::protocol::NoopObserver;
    use std::time::Duration;

    fn config_on(local_port: u16) -> SsrConfig {
        SsrConfig {
            server_address: "127.0.0.1".into(),
            server_port: 65_000,
            local_port,
            password: "hunter2".into(),
            method: Method::ChaCha20Ietf,
            protocol: Protocol::Origin,
            protocol_param: None,
            obfs: ObfsMethod::Plain,
            obfs_param: None,
            remarks: String::new(),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config_on(1080);
        config.local_port = 0;
        assert!(LocalServer::new(config, Arc::new(NoopObserver)).is_err());
    }

    #[tokio::test]
    async fn test_run_and_shutdown() {
        // An uncommon fixed port keeps the test hermetic enough; collisions
        // just surface as a bind error
        let config = config_on(36_218);
        let server = Arc::new(LocalServer::new(config, Arc::new(NoopObserver)).unwrap());

        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };

        // Give the listener time to bind, then connect and shut down
        tokio::time::sleep(Duration::from_millis(50)).await;
        let probe = tokio::net::TcpStream::connect(("127.0.0.1", 36_218)).await;
        assert!(probe.is_ok());

        server.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("shutdown must terminate the accept loop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_cleans_pool() {
        let config = config_on(36_219);
        let server = Arc::new(LocalServer::new(config, Arc::new(NoopObserver)).unwrap());
        let services = server.services().clone();

        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), runner).await;
        assert_eq!(services.pool.idle_count(), 0);
    }
}
