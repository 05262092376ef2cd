//! Test harness: tracing setup, a chat-style handler, loopback listeners and a
//! raw frame-level peer for poking at the protocol directly.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mailrpc_transport::{
    encode_frame, Continuation, Frame, FrameComposer, HandlerError, MethodPath, RpcHandler,
    RpcMessage, ServerConfig, ServerDescriptor, ServerListener, ServiceIndex, TraceContext, Value,
    DEFAULT_MAX_FRAME_LENGTH,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a test-friendly subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// Methods served by [`ChatHandler`].
pub fn chat_methods() -> Vec<MethodPath> {
    vec![
        MethodPath::new("area", "chat", "send"),
        MethodPath::new("area", "chat", "kick"),
        MethodPath::new("area", "chat", "crash"),
        MethodPath::new("area", "chat", "stall"),
        MethodPath::new("area", "chat", "drop"),
        MethodPath::new("connector", "entry", "echo"),
        MethodPath::new("connector", "entry", "trace"),
    ]
}

/// Index over [`chat_methods`].
pub fn chat_index() -> ServiceIndex {
    ServiceIndex::from_methods(&chat_methods()).unwrap_or_default()
}

/// Handler used by the scenario tests.
///
/// - `area.chat.send` replies `"ok"`
/// - `area.chat.kick` fails with a handler error
/// - `area.chat.crash` panics
/// - `area.chat.stall` keeps the continuation until [`ChatHandler::release_stalled`]
/// - `area.chat.drop` drops the continuation unused
/// - `connector.entry.echo` sleeps for `args[0]` ms when it is an int, then echoes the args
/// - `connector.entry.trace` replies with the trace id it received, or null
#[derive(Debug, Default)]
pub struct ChatHandler {
    stalled: Mutex<Vec<Continuation>>,
}

impl ChatHandler {
    /// Creates a shareable handler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of calls held by `area.chat.stall`.
    pub fn stalled_count(&self) -> usize {
        self.stalled.lock().map(|s| s.len()).unwrap_or_default()
    }

    /// Replies `"late"` to every stalled call.
    pub fn release_stalled(&self) -> usize {
        let stalled: Vec<Continuation> = match self.stalled.lock() {
            Ok(mut s) => s.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let count = stalled.len();
        for reply in stalled {
            reply.ok(vec![Value::from("late")]);
        }
        count
    }
}

impl RpcHandler for ChatHandler {
    fn handle(&self, trace: Option<TraceContext>, message: RpcMessage, reply: Continuation) {
        match (message.namespace.as_str(), message.service.as_str(), message.method.as_str()) {
            ("area", "chat", "send") => reply.ok(vec![Value::from("ok")]),
            ("area", "chat", "kick") => {
                reply.err(HandlerError::new("not allowed").with_stack("at area.chat.kick"))
            }
            ("area", "chat", "crash") => panic!("chat handler crashed"),
            ("area", "chat", "stall") => {
                if let Ok(mut stalled) = self.stalled.lock() {
                    stalled.push(reply);
                }
            }
            ("area", "chat", "drop") => drop(reply),
            ("connector", "entry", "echo") => {
                let delay = message.args.first().and_then(Value::as_i32).unwrap_or(0);
                tokio::spawn(async move {
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                    }
                    reply.ok(message.args);
                });
            }
            ("connector", "entry", "trace") => {
                let id = trace
                    .map(|t| Value::from(t.trace_id().to_string()))
                    .unwrap_or(Value::Null);
                reply.ok(vec![id]);
            }
            _ => reply.err(HandlerError::new(format!("no such method: {}", message.method))),
        }
    }
}

/// Binds a listener on an ephemeral loopback port.
pub async fn start_server<H: RpcHandler>(
    config: ServerConfig,
    index: ServiceIndex,
    handler: H,
) -> mailrpc_transport::Result<(ServerListener, SocketAddr)> {
    let listener = ServerListener::new(config, index, handler);
    let addr = listener.listen("127.0.0.1:0").await?;
    debug!(addr = %addr, "test listener bound");
    Ok((listener, addr))
}

/// Starts a listener serving [`ChatHandler`].
pub async fn start_chat_server(
    config: ServerConfig,
) -> mailrpc_transport::Result<(ServerListener, SocketAddr, Arc<ChatHandler>)> {
    let handler = ChatHandler::new();
    let (listener, addr) = start_server(config, chat_index(), Arc::clone(&handler)).await?;
    Ok((listener, addr, handler))
}

/// Descriptor for a loopback server.
pub fn descriptor(addr: SocketAddr) -> ServerDescriptor {
    ServerDescriptor::new("chat-server-1", addr.ip().to_string(), addr.port())
}

/// A peer speaking raw frames, for driving one side of the protocol by hand.
#[derive(Debug)]
pub struct RawPeer {
    stream: TcpStream,
    composer: FrameComposer,
    pending: VecDeque<Frame>,
    closed: bool,
}

impl RawPeer {
    /// Connects to `addr`.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::from_stream(TcpStream::connect(addr).await?))
    }

    /// Wraps an accepted stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            composer: FrameComposer::new(DEFAULT_MAX_FRAME_LENGTH),
            pending: VecDeque::new(),
            closed: false,
        }
    }

    /// Writes one frame.
    pub async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        let bytes = encode_frame(frame, DEFAULT_MAX_FRAME_LENGTH)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.stream.write_all(&bytes).await
    }

    /// Writes raw bytes.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    /// Next frame within `wait`; `None` on timeout, EOF or a framing error.
    pub async fn recv(&mut self, wait: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            if self.closed || self.composer.take_error().is_some() {
                return None;
            }
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await;
            match read {
                Ok(Ok(0)) | Ok(Err(_)) => {
                    self.closed = true;
                    return None;
                }
                Ok(Ok(n)) => match self.composer.feed(&buf[..n]) {
                    Ok(frames) => self.pending.extend(frames),
                    Err(_) => return None,
                },
                Err(_) => return None,
            }
        }
    }

    /// Waits up to `wait` for the other side to close the stream, discarding
    /// frames. Returns true if it did.
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return self.closed;
            }
            if self.recv(deadline - now).await.is_none() {
                return self.closed;
            }
        }
    }
}
