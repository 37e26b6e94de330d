//! Relay metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client or destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Relay metrics collector.
pub struct ServerMetrics {
    /// Start time
    start_time: Instant,
    /// TCP connections accepted
    total_connections: AtomicU64,
    /// TCP connections currently open
    active_connections: AtomicU64,
    /// TCP connections claimed by the SOCKS5 relay
    tcp_sessions: AtomicU64,
    /// UDP sessions created
    udp_sessions: AtomicU64,
    /// Connections handed to the port forwarder
    forwarded_connections: AtomicU64,
    /// Connections no service claimed
    declined_connections: AtomicU64,
    /// Plaintext bytes sent toward servers
    bytes_sent: AtomicU64,
    /// Plaintext bytes delivered to clients
    bytes_received: AtomicU64,
    /// Cipher failures
    crypto_errors: AtomicU64,
    /// Server or proxy connects that failed
    connect_failures: AtomicU64,
    /// Server or proxy connects that timed out
    connect_timeouts: AtomicU64,
    /// Handlers closed by the idle sweep
    idle_closed: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            tcp_sessions: AtomicU64::new(0),
            udp_sessions: AtomicU64::new(0),
            forwarded_connections: AtomicU64::new(0),
            declined_connections: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            crypto_errors: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            connect_timeouts: AtomicU64::new(0),
            idle_closed: AtomicU64::new(0),
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

    /// Count a connection as open until the returned guard drops.
    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.increment_connections();
        ConnectionGuard(Arc::clone(self))
    }

    /// Count a claimed SOCKS5 connection.
    pub fn increment_tcp_sessions(&self) {
        self.tcp_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a new UDP session.
    pub fn increment_udp_sessions(&self) {
        self.udp_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a forwarded connection.
    pub fn increment_forwarded(&self) {
        self.forwarded_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a connection nobody claimed.
    pub fn increment_declined(&self) {
        self.declined_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes to sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes to received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count a cipher failure.
    pub fn increment_crypto_errors(&self) {
        self.crypto_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed connect.
    pub fn increment_connect_failures(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a timed-out connect.
    pub fn increment_connect_timeouts(&self) {
        self.connect_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count handlers closed by the idle sweep.
    pub fn add_idle_closed(&self, n: usize) {
        self.idle_closed.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            tcp_sessions: self.tcp_sessions.load(Ordering::Relaxed),
            udp_sessions: self.udp_sessions.load(Ordering::Relaxed),
            forwarded_connections: self.forwarded_connections.load(Ordering::Relaxed),
            declined_connections: self.declined_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            crypto_errors: self.crypto_errors.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connect_timeouts: self.connect_timeouts.load(Ordering::Relaxed),
            idle_closed: self.idle_closed.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"ss-local Metrics
================
Uptime: {} seconds

Connections:
  Total:     {}
  Active:    {}
  SOCKS5:    {}
  UDP:       {}
  Forwarded: {}
  Declined:  {}

Traffic:
  Sent:     {} bytes
  Received: {} bytes

Errors:
  Crypto:           {}
  Connect Failures: {}
  Connect Timeouts: {}
  Idle Closed:      {}
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.tcp_sessions,
            snapshot.udp_sessions,
            snapshot.forwarded_connections,
            snapshot.declined_connections,
            snapshot.bytes_sent,
            snapshot.bytes_received,
            snapshot.crypto_errors,
            snapshot.connect_failures,
            snapshot.connect_timeouts,
            snapshot.idle_closed,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a connection counted as active.
pub struct ConnectionGuard(Arc<ServerMetrics>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.decrement_connections();
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub tcp_sessions: u64,
    pub udp_sessions: u64,
    pub forwarded_connections: u64,
    pub declined_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub crypto_errors: u64,
    pub connect_failures: u64,
    pub connect_timeouts: u64,
    pub idle_closed: u64,
}

impl MetricsSnapshot {
    /// Share of connect attempts that failed or timed out.
    pub fn connect_failure_rate(&self) -> f64 {
        if self.tcp_sessions == 0 {
            0.0
        } else {
            (self.connect_failures + self.connect_timeouts) as f64 / self.tcp_sessions as f64
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

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_sent + self.bytes_received) as f64 / self.uptime_secs as f64
        }
    }
}
