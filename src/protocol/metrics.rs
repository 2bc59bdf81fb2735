//! Aggregate tunnel metrics.
//!
//! Counters are plain atomics updated from the relay paths; nothing here
//! stores user traffic or addresses, only aggregates safe to surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Tunnel-wide counters.
pub struct TunnelMetrics {
    start_time: Instant,
    total_sessions: AtomicU64,
    active_sessions: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connect_failures: AtomicU64,
    protocol_errors: AtomicU64,
}

impl TunnelMetrics {
    /// Create a zeroed collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_sessions: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
        }
    }

    /// Record a session entering the relay loop.
    pub fn session_opened(&self) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session leaving the relay loop.
    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Add to the outbound byte counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add to the inbound byte counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a failed upstream connection attempt.
    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a framing or cipher protocol violation.
    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds since the collector was created.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Sessions ever opened.
    pub fn total_sessions(&self) -> u64 {
        self.total_sessions.load(Ordering::Relaxed)
    }

    /// Sessions currently relaying.
    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Total bytes sent upstream.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total bytes received from upstream.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Failed connection attempts.
    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    /// Protocol violations observed.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Render the counters for the diagnostics surface.
    pub fn format_report(&self) -> String {
        format!(
            r#"Tunnel Metrics
==============
Uptime: {} seconds

Sessions:
  Total:  {}
  Active: {}

Traffic:
  Sent:     {} bytes
  Received: {} bytes

Errors:
  Connect Failures: {}
  Protocol Errors:  {}
"#,
            self.uptime_secs(),
            self.total_sessions(),
            self.active_sessions(),
            self.bytes_sent(),
            self.bytes_received(),
            self.connect_failures(),
            self.protocol_errors(),
        )
    }
}

impl Default for TunnelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counting() {
        let metrics = TunnelMetrics::new();

        metrics.session_opened();
        metrics.session_opened();
        assert_eq!(metrics.total_sessions(), 2);
        assert_eq!(metrics.active_sessions(), 2);

        metrics.session_closed();
        assert_eq!(metrics.total_sessions(), 2);
        assert_eq!(metrics.active_sessions(), 1);
    }

    #[test]
    fn test_traffic_counters() {
        let metrics = TunnelMetrics::new();
        metrics.add_bytes_sent(1500);
        metrics.add_bytes_received(64_000);

        assert_eq!(metrics.bytes_sent(), 1500);
        assert_eq!(metrics.bytes_received(), 64_000);
    }

    #[test]
    fn test_report_contains_counters() {
        let metrics = TunnelMetrics::new();
        metrics.session_opened();
        metrics.add_bytes_sent(42);
        metrics.record_connect_failure();

        let report = metrics.format_report();
        assert!(report.contains("Tunnel Metrics"));
        assert!(report.contains("Total:  1"));
        assert!(report.contains("Sent:     42 bytes"));
        assert!(report.contains("Connect Failures: 1"));
    }
}
