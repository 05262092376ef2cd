//! Request/response correlation for one connection.
//!
//! Each outbound call is registered under a fresh correlation id together with
//! the sender half of a oneshot channel and a timer task. Whichever of reply,
//! timer expiry or connection teardown removes the entry from the table first
//! completes the call; the others find nothing and do nothing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::message::{CorrelationId, Reply, TraceFields};
use crate::metrics::TransportMetrics;
use crate::trace::TraceContext;
use crate::value::Value;

type Completion = oneshot::Sender<Result<Reply>>;

/// An outstanding call.
#[derive(Debug)]
pub struct PendingCall {
    completion: Completion,
    trace: Option<TraceContext>,
    timer: Option<AbortHandle>,
    registered_at: Instant,
}

impl PendingCall {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Future resolving to the outcome of one call.
#[derive(Debug)]
pub struct ReplyHandle {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<Reply>>,
}

impl ReplyHandle {
    /// Correlation id assigned to the call.
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Future for ReplyHandle {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|outcome| {
            outcome.unwrap_or_else(|_| {
                Err(TransportError::Disconnected {
                    reason: "call abandoned".to_string(),
                })
            })
        })
    }
}

#[derive(Debug, Default)]
struct CorrelatorState {
    next_id: CorrelationId,
    pending: HashMap<CorrelationId, PendingCall>,
}

/// Tracks in-flight calls of one connection.
#[derive(Debug)]
pub struct RequestCorrelator {
    state: Arc<Mutex<CorrelatorState>>,
    max_pending: usize,
    peer: String,
    metrics: Arc<TransportMetrics>,
}

fn lock(state: &Mutex<CorrelatorState>) -> MutexGuard<'_, CorrelatorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RequestCorrelator {
    /// Creates an empty correlator. `peer` only labels log lines.
    pub fn new(peer: impl Into<String>, max_pending: usize, metrics: Arc<TransportMetrics>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CorrelatorState::default())),
            max_pending: max_pending.max(1),
            peer: peer.into(),
            metrics,
        }
    }

    /// Registers a call and arms its timer.
    ///
    /// Ids count up from 0 and wrap at `u32::MAX`; an id whose call is still
    /// outstanding is skipped, so a live id is never handed out twice.
    pub fn register(
        &self,
        trace: Option<TraceContext>,
        timeout: Duration,
    ) -> Result<(CorrelationId, ReplyHandle)> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        let mut state = lock(&self.state);
        if state.pending.len() >= self.max_pending {
            return Err(TransportError::TooManyPending(state.pending.len()));
        }
        let mut id = state.next_id;
        while state.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        state.next_id = id.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        let weak = Arc::downgrade(&self.state);
        let metrics = Arc::clone(&self.metrics);
        let peer = self.peer.clone();
        // The timer cannot observe the table before the entry below is inserted:
        // expiry takes the same lock we are holding.
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(weak, id, timeout, &metrics, &peer);
        });
        state.pending.insert(
            id,
            PendingCall {
                completion: tx,
                trace,
                timer: Some(timer.abort_handle()),
                registered_at: Instant::now(),
            },
        );
        Ok((id, ReplyHandle { id, rx }))
    }

    /// Completes the call `id` with a reply. Unknown ids are ignored.
    ///
    /// The trace context registered with the call is handed back unless the
    /// wire reply carried its own trace fields.
    pub fn resolve(&self, id: CorrelationId, args: Vec<Value>, trace: Option<TraceFields>) -> bool {
        let entry = lock(&self.state).pending.remove(&id);
        let Some(mut call) = entry else {
            debug!(peer = %self.peer, id, "reply for unknown or expired call ignored");
            return false;
        };
        call.cancel_timer();
        let trace = match trace {
            Some(fields) => Some(TraceContext::from_fields(&fields)),
            None => call.trace,
        };
        debug!(
            peer = %self.peer,
            id,
            elapsed_us = call.registered_at.elapsed().as_micros() as u64,
            "call resolved"
        );
        let _ = call.completion.send(Ok(Reply { id, args, trace }));
        true
    }

    /// Drops the call `id` without completing it.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        match lock(&self.state).pending.remove(&id) {
            Some(mut call) => {
                call.cancel_timer();
                true
            }
            None => false,
        }
    }

    /// Completes every outstanding call with an error built by `make_error`.
    /// Returns the number of calls failed.
    pub fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> TransportError,
    {
        let drained: Vec<(CorrelationId, PendingCall)> = lock(&self.state).pending.drain().collect();
        let count = drained.len();
        for (_, mut call) in drained {
            call.cancel_timer();
            let _ = call.completion.send(Err(make_error()));
        }
        if count > 0 {
            debug!(peer = %self.peer, count, "failed all pending calls");
        }
        count
    }

    /// Number of outstanding calls.
    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Returns true if `id` is outstanding.
    pub fn contains(&self, id: CorrelationId) -> bool {
        lock(&self.state).pending.contains_key(&id)
    }

    #[cfg(test)]
    fn set_next_id(&self, id: CorrelationId) {
        lock(&self.state).next_id = id;
    }
}

fn expire(
    state: Weak<Mutex<CorrelatorState>>,
    id: CorrelationId,
    timeout: Duration,
    metrics: &TransportMetrics,
    peer: &str,
) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let entry = lock(&state).pending.remove(&id);
    if let Some(call) = entry {
        metrics.inc_timeouts_total();
        let timeout_ms = timeout.as_millis() as u64;
        warn!(peer, id, timeout_ms, "rpc call timed out");
        let _ = call.completion.send(Err(TransportError::Timeout {
            request_id: id,
            timeout_ms,
        }));
    }
}

impl Drop for RequestCorrelator {
    fn drop(&mut self) {
        self.fail_all(|| TransportError::Disconnected {
            reason: "connection dropped".to_string(),
        });
    }
}
