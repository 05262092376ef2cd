//! Per-call trace context.
//!
//! A context is created for each outbound call when tracing is enabled and
//! rides along with the call: its id and sequence number go on the wire (text
//! codec) and the server rebuilds an equivalent context for the handler.

use tracing::info;
use uuid::Uuid;

use crate::message::TraceFields;

/// Role of the node recording a trace step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceRole {
    /// The calling side.
    Client,
    /// The serving side.
    Server,
}

impl TraceRole {
    fn as_str(self) -> &'static str {
        match self {
            TraceRole::Client => "client",
            TraceRole::Server => "server",
        }
    }
}

/// Trace context of one logical call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    enabled: bool,
    trace_id: Uuid,
    seq: u64,
    source: Option<String>,
    remote: Option<String>,
}

impl TraceContext {
    /// Starts a new enabled trace with a fresh id.
    pub fn new(source: Option<String>, remote: Option<String>) -> Self {
        Self {
            enabled: true,
            trace_id: Uuid::new_v4(),
            seq: 1,
            source,
            remote,
        }
    }

    /// A context that records nothing and is never put on the wire.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            trace_id: Uuid::nil(),
            seq: 0,
            source: None,
            remote: None,
        }
    }

    /// Rebuilds a context from wire fields, reusing the trace id when it parses.
    pub fn from_fields(fields: &TraceFields) -> Self {
        let trace_id = fields
            .trace_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(Uuid::new_v4);
        Self {
            enabled: true,
            trace_id,
            seq: fields.seq_id.unwrap_or(1),
            source: fields.source.clone(),
            remote: fields.remote.clone(),
        }
    }

    /// Whether this context records and propagates.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Globally unique trace id.
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// Current sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Node that issued the call.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Node the call is addressed to.
    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    /// Emits one trace event and advances the sequence number.
    pub fn record(&mut self, role: TraceRole, method: &str, description: &str) {
        if !self.enabled {
            return;
        }
        info!(
            trace_id = %self.trace_id,
            seq = self.seq,
            role = role.as_str(),
            source = self.source.as_deref().unwrap_or(""),
            remote = self.remote.as_deref().unwrap_or(""),
            method,
            "{description}"
        );
        self.seq += 1;
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::disabled()
    }
}
