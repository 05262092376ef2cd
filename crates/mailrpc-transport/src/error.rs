use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while framing or decoding wire data.
///
/// Any of these on an inbound stream means the peer is speaking something we
/// cannot parse; the connection is closed rather than resynchronized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unknown value tag: {0}")]
    UnknownTag(u16),

    #[error("unknown frame kind: 0x{0:02X}")]
    UnknownFrameKind(u8),

    #[error("frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("empty frame")]
    EmptyFrame,

    #[error("invalid utf-8 in string payload")]
    InvalidUtf8,

    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("unknown bean type: {0}")]
    UnknownBean(String),

    #[error("{kind} not present in service index: {name}")]
    UnknownService { kind: &'static str, name: String },

    #[error("{kind} index {index} not present in service index")]
    UnknownIndex { kind: &'static str, index: u16 },

    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),

    #[error("call received before service index handshake")]
    HandshakeRequired,

    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("value nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("composer is poisoned by an earlier framing error")]
    Poisoned,
}

/// Error raised by a request handler, reduced to a form that survives the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct HandlerError {
    /// Human readable error message.
    pub message: String,
    /// Stack or context lines captured by the handler, possibly empty.
    #[serde(default)]
    pub stack: String,
}

impl HandlerError {
    /// Creates a handler error with an empty stack.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: String::new(),
        }
    }

    /// Attaches stack/context text to the error.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    /// Sanitizes any error into a handler error, collecting its source chain as the stack.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            stack: stack.join("\n"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("connection already closed")]
    AlreadyClosed,

    #[error("listener already initialized")]
    AlreadyInitialized,

    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: u32, timeout_ms: u64 },

    #[error("disconnected from remote server: {reason}")]
    Disconnected { reason: String },

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("too many pending requests ({0})")]
    TooManyPending(usize),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns true for the error produced by a per-call deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    /// Returns true when the connection went away while the call was in flight.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Disconnected { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
