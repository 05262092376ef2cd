#![warn(missing_docs)]

//! mailrpc transport: persistent client connections multiplexing calls over
//! one socket, a server listener dispatching them to a handler, and the binary
//! and JSON wire codecs between them.

pub mod batch;
pub mod client;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod framing;
pub mod index;
pub mod json;
pub mod keepalive;
pub mod message;
pub mod metrics;
pub mod server;
pub mod tcp;
pub mod trace;
pub mod value;

pub use batch::{BatchConfig, BatchStatsSnapshot, OutboundQueue};
pub use client::{ClientConnection, ConnectionEvent, ConnectionState};
pub use codec::{codec_for, BinaryCodec, EnvelopeCodec, WireFormat};
pub use config::{ClientConfig, ServerConfig, ServerDescriptor, TransportConfig};
pub use correlator::{PendingCall, ReplyHandle, RequestCorrelator};
pub use error::{HandlerError, ProtocolError, Result, TransportError};
pub use framing::{encode_frame, Frame, FrameComposer, FrameKind, DEFAULT_MAX_FRAME_LENGTH};
pub use index::{MethodPath, NameTable, ServiceIndex};
pub use json::JsonCodec;
pub use keepalive::{KeepAliveAction, KeepAliveConfig, KeepAliveMonitor, KeepAliveState, KeepAliveStats};
pub use message::{CallEnvelope, CorrelationId, Reply, ReplyEnvelope, RpcMessage, TraceFields};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use server::{handler_fn, ConnectionId, Continuation, FnHandler, ListenerEvent, RpcHandler, ServerListener};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use trace::{TraceContext, TraceRole};
pub use value::{
    decode_value, encode_value, Bean, BeanRegistry, Value, WireReader, WireWriter, MAX_NESTING_DEPTH,
};
