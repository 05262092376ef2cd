//! Transport counters.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct MetricsSnapshot {
    /// Calls written by a client.
    pub calls_sent: u64,
    /// Replies matched by a client.
    pub replies_received: u64,
    /// Calls decoded by a server.
    pub calls_received: u64,
    /// Replies written by a server.
    pub replies_sent: u64,
    /// Total bytes written to sockets.
    pub bytes_sent: u64,
    /// Total bytes read from sockets.
    pub bytes_received: u64,
    /// Calls completed by their timer.
    pub timeouts_total: u64,
    /// Inbound framing or decode failures.
    pub protocol_errors: u64,
    /// Batch frames written.
    pub batches_flushed: u64,
    /// Queued replies dropped because their connection closed before a flush.
    pub replies_discarded: u64,
    /// Keepalive pings written.
    pub pings_sent: u64,
    /// Keepalive answers read.
    pub pongs_received: u64,
    /// Connections opened.
    pub connections_opened: u64,
    /// Connections closed.
    pub connections_closed: u64,
    /// Connections currently open.
    pub active_connections: u32,
}

/// Thread-safe transport metrics collector.
pub struct TransportMetrics {
    calls_sent: AtomicU64,
    replies_received: AtomicU64,
    calls_received: AtomicU64,
    replies_sent: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    timeouts_total: AtomicU64,
    protocol_errors: AtomicU64,
    batches_flushed: AtomicU64,
    replies_discarded: AtomicU64,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU32,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls_sent: AtomicU64::new(0),
            replies_received: AtomicU64::new(0),
            calls_received: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            replies_discarded: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
        }
    }

    /// Increments the calls sent counter.
    pub fn inc_calls_sent(&self) {
        self.calls_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the replies received counter.
    pub fn inc_replies_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the calls received counter.
    pub fn inc_calls_received(&self) {
        self.calls_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the replies sent counter.
    pub fn inc_replies_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the bytes sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the bytes received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Increments the timeouts counter.
    pub fn inc_timeouts_total(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the protocol errors counter.
    pub fn inc_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the batches flushed counter.
    pub fn inc_batches_flushed(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the discarded replies counter.
    pub fn add_replies_discarded(&self, count: u64) {
        self.replies_discarded.fetch_add(count, Ordering::Relaxed);
    }

    /// Increments the pings sent counter.
    pub fn inc_pings_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the pongs received counter.
    pub fn inc_pongs_received(&self) {
        self.pongs_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a new connection, incrementing both the opened and active counters.
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a closed connection, decrementing the active counter.
    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            calls_sent: self.calls_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            calls_received: self.calls_received.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            replies_discarded: self.replies_discarded.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pongs_received: self.pongs_received.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}
