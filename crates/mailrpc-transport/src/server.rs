//! Server side of the transport: accepts client connections, decodes calls,
//! hands them to an [`RpcHandler`] and writes the replies back.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::batch::OutboundQueue;
use crate::codec::{codec_for, EnvelopeCodec};
use crate::config::ServerConfig;
use crate::error::{HandlerError, ProtocolError, Result, TransportError};
use crate::framing::{Frame, FrameKind};
use crate::index::ServiceIndex;
use crate::message::{CorrelationId, ReplyEnvelope, RpcMessage, TraceFields};
use crate::metrics::TransportMetrics;
use crate::tcp::{spawn_writer, FrameReader, FrameSender, TcpTransport};
use crate::trace::{TraceContext, TraceRole};
use crate::value::{BeanRegistry, Value};

const EVENT_CAPACITY: usize = 256;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Listener-scoped id of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Signals emitted by a [`ServerListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// A client connected.
    Connected {
        /// Id assigned to the connection.
        id: ConnectionId,
        /// Remote address.
        peer: SocketAddr,
    },
    /// A connection went away and its queued replies were dropped.
    Disconnected {
        /// Id of the connection.
        id: ConnectionId,
    },
    /// A transport failure, on one connection or on the accept loop.
    Error {
        /// Connection concerned, if any.
        id: Option<ConnectionId>,
        /// Description of the failure.
        message: String,
    },
    /// `close` ran.
    Closed,
}

/// Receives decoded calls.
///
/// `handle` runs on the connection's reader task and must not block; long work
/// belongs in a spawned task that owns the [`Continuation`].
pub trait RpcHandler: Send + Sync + 'static {
    /// Handles one call. The reply is sent through `reply`.
    fn handle(&self, trace: Option<TraceContext>, message: RpcMessage, reply: Continuation);
}

impl<H: RpcHandler> RpcHandler for Arc<H> {
    fn handle(&self, trace: Option<TraceContext>, message: RpcMessage, reply: Continuation) {
        (**self).handle(trace, message, reply);
    }
}

/// Adapter returned by [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHandler")
    }
}

/// Turns an async function into an [`RpcHandler`]. Each call runs in its own
/// task.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Option<TraceContext>, RpcMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Vec<Value>, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(Option<TraceContext>, RpcMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Vec<Value>, HandlerError>> + Send + 'static,
{
    fn handle(&self, trace: Option<TraceContext>, message: RpcMessage, reply: Continuation) {
        let fut = (self.f)(trace, message);
        tokio::spawn(async move {
            reply.send(fut.await);
        });
    }
}

struct ReplySink {
    id: CorrelationId,
    method: String,
    trace: Option<TraceContext>,
    conn: Arc<ServerConn>,
    codec: Arc<dyn EnvelopeCodec>,
    metrics: Arc<TransportMetrics>,
    batching: bool,
}

impl ReplySink {
    fn deliver(mut self, outcome: std::result::Result<Vec<Value>, HandlerError>) {
        if let Some(ctx) = self.trace.as_mut() {
            ctx.record(TraceRole::Server, &self.method, "server sends rpc reply");
        }
        let trace = self.trace.as_ref().and_then(TraceFields::from_context);
        let max = self.conn.writer.max_frame_length();
        let encoded = match self.encode(ReplyEnvelope::from_outcome(self.id, outcome, trace.clone())) {
            Ok(bytes) if bytes.len() < max => bytes,
            Ok(bytes) => {
                warn!(conn = %self.conn.id, id = self.id, size = bytes.len(), "reply over frame limit");
                let err = HandlerError::new(format!("reply of {} bytes exceeds frame limit", bytes.len()));
                match self.encode(ReplyEnvelope::from_outcome(self.id, Err(err), trace)) {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                }
            }
            Err(e) => {
                warn!(conn = %self.conn.id, id = self.id, error = %e, "reply encoding failed");
                let err = HandlerError::new(e.to_string());
                match self.encode(ReplyEnvelope::from_outcome(self.id, Err(err), trace)) {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                }
            }
        };
        match self.conn.send_reply(encoded, self.batching) {
            Ok(()) => self.metrics.inc_replies_sent(),
            Err(e) => debug!(conn = %self.conn.id, id = self.id, error = %e, "reply dropped"),
        }
    }

    fn encode(&self, envelope: ReplyEnvelope) -> std::result::Result<Bytes, ProtocolError> {
        self.codec.encode_reply(&envelope)
    }
}

/// Sends the reply of one call.
///
/// Consumed by [`send`](Continuation::send); dropping it unused, including
/// when the handler panics, replies with a [`HandlerError`].
pub struct Continuation {
    sink: Option<ReplySink>,
}

impl Continuation {
    /// Correlation id of the call.
    pub fn id(&self) -> CorrelationId {
        self.sink.as_ref().map(|s| s.id).unwrap_or_default()
    }

    /// Id of the connection the call arrived on.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.sink.as_ref().map(|s| s.conn.id)
    }

    /// Replies with the handler outcome.
    pub fn send(mut self, outcome: std::result::Result<Vec<Value>, HandlerError>) {
        if let Some(sink) = self.sink.take() {
            sink.deliver(outcome);
        }
    }

    /// Replies with values.
    pub fn ok(self, values: Vec<Value>) {
        self.send(Ok(values));
    }

    /// Replies with an error.
    pub fn err(self, error: HandlerError) {
        self.send(Err(error));
    }
}

/// Text logged and sent back when a continuation is dropped unanswered.
fn unanswered_reason(panicking: bool) -> &'static str {
    if panicking {
        "handler panicked"
    } else {
        "handler finished without replying"
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            let message = unanswered_reason(std::thread::panicking());
            warn!(conn = %sink.conn.id, id = sink.id, method = %sink.method, "{message}");
            sink.deliver(Err(HandlerError::new(message)));
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.id())
            .field("used", &self.sink.is_none())
            .finish()
    }
}

struct ServerConn {
    id: ConnectionId,
    peer: SocketAddr,
    writer: FrameSender,
    queue: OutboundQueue,
    closed: AtomicBool,
    reader: Mutex<Option<AbortHandle>>,
}

impl ServerConn {
    fn send_reply(&self, encoded: Bytes, batching: bool) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected {
                reason: "connection closed".to_string(),
            });
        }
        if batching {
            self.queue.push(encoded);
        } else {
            self.writer.send(&Frame::new(FrameKind::Message, encoded))?;
        }
        Ok(())
    }

    fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let dropped = self.queue.discard();
        self.writer.shutdown();
        if let Some(reader) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            reader.abort();
        }
        dropped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerPhase {
    Idle,
    Binding,
    Listening,
    Closed,
}

struct ListenerState {
    phase: ListenerPhase,
    local_addr: Option<SocketAddr>,
    tasks: Vec<AbortHandle>,
}

struct ListenerInner {
    config: ServerConfig,
    codec: Arc<dyn EnvelopeCodec>,
    index: Arc<ServiceIndex>,
    handler: Arc<dyn RpcHandler>,
    state: Mutex<ListenerState>,
    connections: Mutex<HashMap<ConnectionId, Arc<ServerConn>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<ListenerEvent>,
    metrics: Arc<TransportMetrics>,
}

/// Accepts client connections and serves their calls.
pub struct ServerListener {
    inner: Arc<ListenerInner>,
}

impl ServerListener {
    /// Creates a listener serving the methods in `index` through `handler`.
    pub fn new<H: RpcHandler>(config: ServerConfig, index: ServiceIndex, handler: H) -> Self {
        Self::with_beans(config, index, BeanRegistry::new(), handler)
    }

    /// Like [`new`](Self::new), resolving user-defined values through `beans`.
    pub fn with_beans<H: RpcHandler>(
        config: ServerConfig,
        index: ServiceIndex,
        beans: BeanRegistry,
        handler: H,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = ListenerInner {
            codec: codec_for(config.format, beans),
            index: Arc::new(index),
            handler: Arc::new(handler),
            state: Mutex::new(ListenerState {
                phase: ListenerPhase::Idle,
                local_addr: None,
                tasks: Vec::new(),
            }),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            metrics: Arc::new(TransportMetrics::new()),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Binds `addr` and starts accepting. Valid once.
    ///
    /// Returns the bound address, useful when binding port 0.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        self.inner.config.validate()?;
        {
            let mut state = self.inner.lock_state();
            match state.phase {
                ListenerPhase::Idle => state.phase = ListenerPhase::Binding,
                ListenerPhase::Binding | ListenerPhase::Listening => {
                    return Err(TransportError::AlreadyInitialized)
                }
                ListenerPhase::Closed => return Err(TransportError::AlreadyClosed),
            }
        }

        let transport = TcpTransport::new(self.inner.config.tcp());
        let bound = async {
            let listener = transport.listen(addr).await?;
            let local = listener.local_addr()?;
            Ok::<_, TransportError>((listener, local))
        };
        let (listener, local) = match bound.await {
            Ok(bound) => bound,
            Err(e) => {
                let mut state = self.inner.lock_state();
                if state.phase == ListenerPhase::Binding {
                    state.phase = ListenerPhase::Idle;
                }
                return Err(e);
            }
        };

        let mut state = self.inner.lock_state();
        if state.phase != ListenerPhase::Binding {
            return Err(TransportError::AlreadyClosed);
        }
        state.phase = ListenerPhase::Listening;
        state.local_addr = Some(local);
        let accept = tokio::spawn(accept_loop(Arc::clone(&self.inner), transport, listener));
        state.tasks.push(accept.abort_handle());
        if self.inner.config.batch.enabled {
            let flush = tokio::spawn(flush_loop(Arc::clone(&self.inner)));
            state.tasks.push(flush.abort_handle());
        }
        drop(state);

        info!(addr = %local, format = ?self.inner.codec.format(), "listening");
        Ok(local)
    }

    /// Stops accepting and disconnects every client; idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock_connections().len()
    }

    /// Bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock_state().local_addr
    }

    /// Subscribes to listener events.
    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.inner.events.subscribe()
    }

    /// Transport counters of this listener.
    pub fn metrics(&self) -> &TransportMetrics {
        &self.inner.metrics
    }

    /// The service index sent to clients.
    pub fn service_index(&self) -> &ServiceIndex {
        &self.inner.index
    }
}

impl Drop for ServerListener {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for ServerListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerListener")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ListenerInner {
    fn lock_state(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<ServerConn>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ListenerEvent) {
        let _ = self.events.send(event);
    }

    fn is_listening(&self) -> bool {
        self.lock_state().phase == ListenerPhase::Listening
    }

    fn register(this: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if !this.is_listening() {
            return;
        }
        let id = ConnectionId(this.next_id.fetch_add(1, Ordering::Relaxed));
        let (read_half, write_half) = stream.into_split();
        let max = this.config.max_frame_length;
        let weak = Arc::downgrade(this);
        let writer = spawn_writer(write_half, peer.to_string(), max, Arc::clone(&this.metrics), move |e| {
            if let Some(inner) = weak.upgrade() {
                inner.emit(ListenerEvent::Error {
                    id: Some(id),
                    message: e.to_string(),
                });
            }
        });
        let conn = Arc::new(ServerConn {
            id,
            peer,
            writer,
            queue: OutboundQueue::new(),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        });
        this.lock_connections().insert(id, Arc::clone(&conn));
        if !this.is_listening() {
            this.lock_connections().remove(&id);
            conn.close();
            return;
        }

        let reader = FrameReader::new(read_half, max, Arc::clone(&this.metrics));
        let task = tokio::spawn(connection_loop(Arc::clone(this), Arc::clone(&conn), reader));
        *conn.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());
        if conn.closed.load(Ordering::SeqCst) {
            task.abort();
        }

        this.metrics.connection_opened();
        debug!(conn = %id, peer = %peer, "connection accepted");
        this.emit(ListenerEvent::Connected { id, peer });
    }

    fn handle_frame(
        &self,
        conn: &Arc<ServerConn>,
        frame: Frame,
        handshaken: &mut bool,
    ) -> std::result::Result<(), ProtocolError> {
        match frame.kind {
            FrameKind::Connect => {
                if self.codec.requires_handshake() {
                    let body = self.index.to_handshake()?;
                    if let Err(e) = conn.writer.send(&Frame::new(FrameKind::Handshake, body)) {
                        debug!(conn = %conn.id, error = %e, "handshake not sent");
                    }
                }
                *handshaken = true;
            }
            FrameKind::Ping => {
                if let Err(e) = conn.writer.send(&Frame::control(FrameKind::Pong)) {
                    debug!(conn = %conn.id, error = %e, "pong not sent");
                }
            }
            FrameKind::Message => self.dispatch(conn, &frame.body, *handshaken)?,
            FrameKind::Batch => {
                for item in self.codec.split_batch(&frame.body)? {
                    self.dispatch(conn, item, *handshaken)?;
                }
            }
            kind @ (FrameKind::Handshake | FrameKind::Pong) => {
                return Err(ProtocolError::InvalidEnvelope(format!(
                    "unexpected {kind:?} frame from client"
                )));
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        conn: &Arc<ServerConn>,
        body: &[u8],
        handshaken: bool,
    ) -> std::result::Result<(), ProtocolError> {
        if self.codec.requires_handshake() && !handshaken {
            return Err(ProtocolError::HandshakeRequired);
        }
        let call = self.codec.decode_call(body, Some(&self.index))?;
        self.metrics.inc_calls_received();

        let mut trace = call.trace.as_ref().map(TraceContext::from_fields);
        if let Some(ctx) = trace.as_mut() {
            ctx.record(TraceRole::Server, &call.msg.method, "server received rpc message");
        }
        let reply = Continuation {
            sink: Some(ReplySink {
                id: call.id,
                method: call.msg.method.clone(),
                trace: trace.clone(),
                conn: Arc::clone(conn),
                codec: Arc::clone(&self.codec),
                metrics: Arc::clone(&self.metrics),
                batching: self.config.batch.enabled,
            }),
        };
        let handler = Arc::clone(&self.handler);
        let message = call.msg;
        if catch_unwind(AssertUnwindSafe(move || handler.handle(trace, message, reply))).is_err() {
            error!(conn = %conn.id, id = call.id, "handler panicked");
        }
        Ok(())
    }

    fn remove_connection(&self, id: ConnectionId, reason: &str) {
        let Some(conn) = self.lock_connections().remove(&id) else {
            return;
        };
        let dropped = conn.close();
        self.metrics.add_replies_discarded(dropped as u64);
        self.metrics.connection_closed();
        debug!(conn = %id, peer = %conn.peer, reason, dropped, "connection removed");
        self.emit(ListenerEvent::Disconnected { id });
    }

    fn flush(&self) {
        let conns: Vec<Arc<ServerConn>> = self.lock_connections().values().cloned().collect();
        for conn in conns {
            let Some(items) = conn.queue.drain() else {
                continue;
            };
            let frame = Frame::new(FrameKind::Batch, self.codec.encode_batch(&items));
            match conn.writer.send(&frame) {
                Ok(_) => self.metrics.inc_batches_flushed(),
                Err(TransportError::Protocol(ProtocolError::FrameTooLarge { .. })) => {
                    for item in items {
                        if conn.writer.send(&Frame::new(FrameKind::Message, item)).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => debug!(conn = %conn.id, error = %e, "batch dropped"),
            }
        }
    }

    fn shutdown(&self) {
        let tasks = {
            let mut state = self.lock_state();
            if state.phase == ListenerPhase::Closed {
                return;
            }
            state.phase = ListenerPhase::Closed;
            std::mem::take(&mut state.tasks)
        };
        for task in tasks {
            task.abort();
        }
        let conns: Vec<Arc<ServerConn>> = self.lock_connections().drain().map(|(_, c)| c).collect();
        let count = conns.len();
        for conn in conns {
            let dropped = conn.close();
            self.metrics.add_replies_discarded(dropped as u64);
            self.metrics.connection_closed();
            self.emit(ListenerEvent::Disconnected { id: conn.id });
        }
        info!(connections = count, "listener closed");
        self.emit(ListenerEvent::Closed);
    }
}

async fn accept_loop(inner: Arc<ListenerInner>, transport: TcpTransport, listener: TcpListener) {
    loop {
        match transport.accept(&listener).await {
            Ok((stream, peer)) => ListenerInner::register(&inner, stream, peer),
            Err(e) => {
                warn!(error = %e, "accept failed");
                inner.emit(ListenerEvent::Error {
                    id: None,
                    message: e.to_string(),
                });
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn connection_loop(inner: Arc<ListenerInner>, conn: Arc<ServerConn>, mut reader: FrameReader) {
    let mut handshaken = false;
    let reason = loop {
        let outcome = match reader.next_frame().await {
            Ok(Some(frame)) => inner
                .handle_frame(&conn, frame, &mut handshaken)
                .map_err(TransportError::from),
            Ok(None) => break "peer closed",
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {}
            Err(TransportError::Protocol(e)) => {
                inner.metrics.inc_protocol_errors();
                warn!(conn = %conn.id, peer = %conn.peer, error = %e, "protocol error, closing connection");
                inner.emit(ListenerEvent::Error {
                    id: Some(conn.id),
                    message: e.to_string(),
                });
                break "protocol error";
            }
            Err(e) => {
                debug!(conn = %conn.id, error = %e, "socket read failed");
                break "read failed";
            }
        }
    };
    inner.remove_connection(conn.id, reason);
}

async fn flush_loop(inner: Arc<ListenerInner>) {
    let period = inner.config.batch.flush_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        inner.flush();
    }
}
