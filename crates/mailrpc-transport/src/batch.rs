//! Outbound batching.
//!
//! With batching enabled, encoded envelopes are appended to a per-connection
//! queue instead of being written; a periodic flush drains the whole queue into
//! one `Batch` frame, preserving enqueue order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Batching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Whether outbound envelopes are queued and flushed periodically.
    pub enabled: bool,
    /// Flush tick interval.
    pub flush_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            enabled: false,
            flush_interval_ms: 50,
        }
    }
}

impl BatchConfig {
    /// Flush tick interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// A snapshot of queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStatsSnapshot {
    /// Envelopes appended.
    pub envelopes_queued: u64,
    /// Non-empty drains.
    pub batches_drained: u64,
    /// Envelopes handed out by drains.
    pub envelopes_drained: u64,
    /// Envelopes thrown away by `discard`.
    pub envelopes_discarded: u64,
}

#[derive(Debug, Default)]
struct BatchStats {
    envelopes_queued: AtomicU64,
    batches_drained: AtomicU64,
    envelopes_drained: AtomicU64,
    envelopes_discarded: AtomicU64,
}

impl BatchStats {
    fn snapshot(&self) -> BatchStatsSnapshot {
        BatchStatsSnapshot {
            envelopes_queued: self.envelopes_queued.load(Ordering::Relaxed),
            batches_drained: self.batches_drained.load(Ordering::Relaxed),
            envelopes_drained: self.envelopes_drained.load(Ordering::Relaxed),
            envelopes_discarded: self.envelopes_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Ordered queue of encoded envelopes awaiting the next flush.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: Mutex<Vec<Bytes>>,
    stats: BatchStats,
}

impl OutboundQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Bytes>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an encoded envelope.
    pub fn push(&self, envelope: Bytes) {
        self.lock().push(envelope);
        self.stats.envelopes_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes everything queued so far, in enqueue order. Returns `None` when
    /// the queue is empty.
    pub fn drain(&self) -> Option<Vec<Bytes>> {
        let items = std::mem::take(&mut *self.lock());
        if items.is_empty() {
            return None;
        }
        self.stats.batches_drained.fetch_add(1, Ordering::Relaxed);
        self.stats
            .envelopes_drained
            .fetch_add(items.len() as u64, Ordering::Relaxed);
        Some(items)
    }

    /// Drops everything queued. Returns the number of envelopes dropped.
    pub fn discard(&self) -> usize {
        let dropped = std::mem::take(&mut *self.lock()).len();
        self.stats
            .envelopes_discarded
            .fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queue statistics.
    pub fn stats(&self) -> BatchStatsSnapshot {
        self.stats.snapshot()
    }
}
