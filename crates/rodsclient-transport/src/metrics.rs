//! Connection metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of connection metrics at a point in time.
pub struct MetricsSnapshot {
    /// Total bytes sent.
    pub bytes_sent: u64,
    /// Total bytes received.
    pub bytes_received: u64,
    /// Number of request messages sent.
    pub requests_sent: u64,
    /// Number of response messages received.
    pub responses_received: u64,
    /// Requests that failed before or while being sent.
    pub request_failures: u64,
    /// Responses that failed to arrive or to decode.
    pub response_failures: u64,
    /// Number of connections opened.
    pub connections_opened: u64,
    /// Number of connections closed.
    pub connections_closed: u64,
    /// Dial, negotiation or socket failures.
    pub connection_failures: u64,
    /// Reads or writes that hit their deadline.
    pub timeouts_total: u64,
    /// Successful in-place TLS upgrades.
    pub tls_upgrades: u64,
}

/// Thread-safe connection metrics collector, shared through `Arc`.
pub struct ConnectionMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    request_failures: AtomicU64,
    response_failures: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connection_failures: AtomicU64,
    timeouts_total: AtomicU64,
    tls_upgrades: AtomicU64,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ConnectionMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            request_failures: AtomicU64::new(0),
            response_failures: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            tls_upgrades: AtomicU64::new(0),
        }
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_responses_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_request_failures(&self) {
        self.request_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_response_failures(&self) {
        self.response_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connection_failures(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeouts(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tls_upgrades(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Currently open connections, derived from the opened and closed counters.
    pub fn active_connections(&self) -> u64 {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            request_failures: self.request_failures.load(Ordering::Relaxed),
            response_failures: self.response_failures.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            tls_upgrades: self.tls_upgrades.load(Ordering::Relaxed),
        }
    }
}
