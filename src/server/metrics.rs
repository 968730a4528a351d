//! Gateway metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client or destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::proxy::{Protocol, RelayEnd, RelayStats};

/// Gateway metrics collector.
pub struct GatewayMetrics {
    /// Server start time
    start_time: Instant,
    /// Total connections accepted
    total_connections: AtomicU64,
    /// Current active connections
    active_connections: AtomicU64,
    /// Connections classified as HTTP
    http_connections: AtomicU64,
    /// HTTP requests answered with 200
    health_checks: AtomicU64,
    /// Connections classified as SOCKS5
    socks_connections: AtomicU64,
    /// Connections that were neither HTTP nor SOCKS5
    unknown_connections: AtomicU64,
    /// SOCKS5 handshakes that failed before connecting
    handshake_errors: AtomicU64,
    /// Destination resolve or connect failures
    connect_failures: AtomicU64,
    /// Relay sessions ended by the idle timeout
    idle_timeouts: AtomicU64,
    /// Bytes relayed client to destination
    bytes_upstream: AtomicU64,
    /// Bytes relayed destination to client
    bytes_downstream: AtomicU64,
}

impl GatewayMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            http_connections: AtomicU64::new(0),
            health_checks: AtomicU64::new(0),
            socks_connections: AtomicU64::new(0),
            unknown_connections: AtomicU64::new(0),
            handshake_errors: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            idle_timeouts: AtomicU64::new(0),
            bytes_upstream: AtomicU64::new(0),
            bytes_downstream: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a sniffer verdict.
    pub fn record_protocol(&self, protocol: Protocol) {
        let counter = match protocol {
            Protocol::Http => &self.http_connections,
            Protocol::Socks5 => &self.socks_connections,
            Protocol::Unknown => &self.unknown_connections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment health check count.
    pub fn increment_health_checks(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment handshake error count.
    pub fn increment_handshake_errors(&self) {
        self.handshake_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment connect failure count.
    pub fn increment_connect_failures(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished relay session into the totals.
    pub fn record_relay(&self, stats: &RelayStats) {
        self.bytes_upstream
            .fetch_add(stats.client_to_target, Ordering::Relaxed);
        self.bytes_downstream
            .fetch_add(stats.target_to_client, Ordering::Relaxed);
        if stats.end == RelayEnd::IdleTimeout {
            self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            http_connections: self.http_connections.load(Ordering::Relaxed),
            health_checks: self.health_checks.load(Ordering::Relaxed),
            socks_connections: self.socks_connections.load(Ordering::Relaxed),
            unknown_connections: self.unknown_connections.load(Ordering::Relaxed),
            handshake_errors: self.handshake_errors.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            idle_timeouts: self.idle_timeouts.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"Gateway Metrics
===============
Uptime: {} seconds

Connections:
  Total:   {}
  Active:  {}
  HTTP:    {}
  SOCKS5:  {}
  Unknown: {}

Health checks: {}

Traffic:
  Upstream:   {} bytes
  Downstream: {} bytes

Errors:
  Handshake Errors: {}
  Connect Failures: {} ({:.1}% of SOCKS5)
  Idle Timeouts:    {}

Rates:
  Connections: {:.2}/s
  Throughput:  {:.0} bytes/s
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.http_connections,
            snapshot.socks_connections,
            snapshot.unknown_connections,
            snapshot.health_checks,
            snapshot.bytes_upstream,
            snapshot.bytes_downstream,
            snapshot.handshake_errors,
            snapshot.connect_failures,
            snapshot.connect_failure_rate() * 100.0,
            snapshot.idle_timeouts,
            snapshot.connections_per_second(),
            snapshot.throughput_bps(),
        )
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Seconds since the gateway started
    pub uptime_secs: u64,
    /// Connections accepted
    pub total_connections: u64,
    /// Connections currently open
    pub active_connections: u64,
    /// Connections classified as HTTP
    pub http_connections: u64,
    /// Requests answered by the health route
    pub health_checks: u64,
    /// Connections classified as SOCKS5
    pub socks_connections: u64,
    /// Connections closed unclassified
    pub unknown_connections: u64,
    /// SOCKS5 negotiations that failed
    pub handshake_errors: u64,
    /// Destinations that could not be reached
    pub connect_failures: u64,
    /// Relay sessions ended by inactivity
    pub idle_timeouts: u64,
    /// Bytes relayed client to destination
    pub bytes_upstream: u64,
    /// Bytes relayed destination to client
    pub bytes_downstream: u64,
}

impl MetricsSnapshot {
    /// Share of SOCKS5 connections whose destination could not be reached.
    pub fn connect_failure_rate(&self) -> f64 {
        if self.socks_connections == 0 {
            0.0
        } else {
            self.connect_failures as f64 / self.socks_connections as f64
        }
    }

    /// Calculate connections per second.
    pub fn connections_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.total_connections as f64 / self.uptime_secs as f64
        }
    }

    /// Calculate relayed throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_upstream + self.bytes_downstream) as f64 / self.uptime_secs as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counting() {
        let metrics = GatewayMetrics::new();

        metrics.increment_connections();
        metrics.increment_connections();
        assert_eq!(metrics.total_connections(), 2);
        assert_eq!(metrics.active_connections(), 2);

        metrics.decrement_connections();
        assert_eq!(metrics.total_connections(), 2);
        assert_eq!(metrics.active_connections(), 1);
    }

    #[test]
    fn test_protocol_counting() {
        let metrics = GatewayMetrics::new();

        metrics.record_protocol(Protocol::Http);
        metrics.record_protocol(Protocol::Socks5);
        metrics.record_protocol(Protocol::Socks5);
        metrics.record_protocol(Protocol::Unknown);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.http_connections, 1);
        assert_eq!(snapshot.socks_connections, 2);
        assert_eq!(snapshot.unknown_connections, 1);
    }

    #[test]
    fn test_relay_recording() {
        let metrics = GatewayMetrics::new();

        metrics.record_relay(&RelayStats {
            client_to_target: 100,
            target_to_client: 2000,
            end: RelayEnd::IdleTimeout,
        });
        metrics.record_relay(&RelayStats {
            client_to_target: 1,
            target_to_client: 0,
            end: RelayEnd::ClientClosed,
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_upstream, 101);
        assert_eq!(snapshot.bytes_downstream, 2000);
        assert_eq!(snapshot.idle_timeouts, 1);
    }

    #[test]
    fn test_snapshot_rates() {
        let snapshot = MetricsSnapshot {
            uptime_secs: 100,
            total_connections: 200,
            socks_connections: 50,
            connect_failures: 5,
            bytes_upstream: 10000,
            bytes_downstream: 20000,
            ..Default::default()
        };

        assert!((snapshot.connect_failure_rate() - 0.1).abs() < 0.01);
        assert!((snapshot.connections_per_second() - 2.0).abs() < 0.01);
        assert!((snapshot.throughput_bps() - 300.0).abs() < 0.01);
        assert_eq!(MetricsSnapshot::default().connect_failure_rate(), 0.0);
    }

    #[test]
    fn test_format_report() {
        let metrics = GatewayMetrics::new();
        metrics.increment_connections();

        metrics.record_protocol(Protocol::Socks5);
        metrics.record_protocol(Protocol::Socks5);
        metrics.increment_connect_failures();

        let report = metrics.format_report();
        assert!(report.contains("Gateway Metrics"));
        assert!(report.contains("Total:   1"));
        assert!(report.contains("Connect Failures: 1 (50.0% of SOCKS5)"));
        assert!(report.contains("Connections: 0.00/s"));
        assert!(report.contains("Throughput:  0 bytes/s"));
    }
}
