//! Client side of the transport: one outbound connection ("mailbox") to one
//! remote server, multiplexing concurrent calls over a single socket.
//!
//! Lifecycle is `Disconnected -> Connecting -> Connected -> Closed`; `Closed`
//! is terminal. A connection owns:
//! - a [`RequestCorrelator`] matching replies to calls by id
//! - an [`OutboundQueue`] drained by a flush task when batching is enabled
//! - a [`KeepAliveMonitor`] driven by a ping task when keepalive is enabled
//! - a reader task and an ordered writer task over the socket halves

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::batch::OutboundQueue;
use crate::codec::{codec_for, EnvelopeCodec};
use crate::config::{ClientConfig, ServerDescriptor};
use crate::correlator::{ReplyHandle, RequestCorrelator};
use crate::error::{ProtocolError, Result, TransportError};
use crate::framing::{Frame, FrameKind};
use crate::index::ServiceIndex;
use crate::keepalive::{KeepAliveAction, KeepAliveMonitor, KeepAliveStats};
use crate::message::{CallEnvelope, Reply, ReplyEnvelope, RpcMessage, TraceFields};
use crate::metrics::TransportMetrics;
use crate::tcp::{spawn_writer, FrameReader, FrameSender, TcpTransport};
use crate::trace::{TraceContext, TraceRole};
use crate::value::{BeanRegistry, Value};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle state of a [`ClientConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; `connect` may be called.
    Disconnected,
    /// `connect` is in progress.
    Connecting,
    /// Ready to send.
    Connected,
    /// Closed for good.
    Closed,
}

/// Signals emitted by a [`ClientConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A transport-level failure.
    Error {
        /// Description of the failure.
        message: String,
    },
    /// The server ended the stream. The connection stays open until `close`.
    PeerClosed {
        /// Id of the server.
        server_id: String,
    },
    /// `close` ran.
    Closed {
        /// Id of the server.
        server_id: String,
    },
}

struct ClientState {
    phase: ConnectionState,
    writer: Option<FrameSender>,
    index: Option<Arc<ServiceIndex>>,
    tasks: Vec<AbortHandle>,
}

struct ClientInner {
    server: ServerDescriptor,
    config: ClientConfig,
    codec: Arc<dyn EnvelopeCodec>,
    state: Mutex<ClientState>,
    correlator: RequestCorrelator,
    queue: OutboundQueue,
    keepalive: KeepAliveMonitor,
    events: broadcast::Sender<ConnectionEvent>,
    metrics: Arc<TransportMetrics>,
}

/// A persistent connection to one remote server.
pub struct ClientConnection {
    inner: Arc<ClientInner>,
}

impl ClientConnection {
    /// Creates a disconnected client for `server`.
    pub fn new(server: ServerDescriptor, config: ClientConfig) -> Self {
        Self::with_beans(server, config, BeanRegistry::new())
    }

    /// Creates a disconnected client whose binary codec resolves user-defined
    /// values through `beans`.
    pub fn with_beans(server: ServerDescriptor, config: ClientConfig, beans: BeanRegistry) -> Self {
        let metrics = Arc::new(TransportMetrics::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = ClientInner {
            codec: codec_for(config.format, beans),
            correlator: RequestCorrelator::new(server.addr(), config.max_pending, Arc::clone(&metrics)),
            queue: OutboundQueue::new(),
            keepalive: KeepAliveMonitor::new(config.keepalive.clone()),
            state: Mutex::new(ClientState {
                phase: ConnectionState::Disconnected,
                writer: None,
                index: None,
                tasks: Vec::new(),
            }),
            server,
            config,
            events,
            metrics,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The server this connection targets.
    pub fn server(&self) -> &ServerDescriptor {
        &self.inner.server
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock_state().phase
    }

    /// Subscribes to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Transport counters of this connection.
    pub fn metrics(&self) -> &TransportMetrics {
        &self.inner.metrics
    }

    /// Number of calls awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Number of encoded calls waiting for the next flush.
    pub fn queued_count(&self) -> usize {
        self.inner.queue.len()
    }

    /// The service index received in the handshake, if any.
    pub fn service_index(&self) -> Option<Arc<ServiceIndex>> {
        self.inner.lock_state().index.clone()
    }

    /// Keepalive statistics.
    pub fn keepalive_stats(&self) -> KeepAliveStats {
        self.inner.keepalive.stats()
    }

    /// Opens the socket and, for indexed codecs, waits for the server's
    /// service index.
    ///
    /// On failure the connection returns to `Disconnected` and `connect` may
    /// be retried.
    pub async fn connect(&self) -> Result<()> {
        self.inner.config.validate()?;
        {
            let mut state = self.inner.lock_state();
            match state.phase {
                ConnectionState::Disconnected => state.phase = ConnectionState::Connecting,
                ConnectionState::Connecting | ConnectionState::Connected => {
                    return Err(TransportError::AlreadyConnected)
                }
                ConnectionState::Closed => return Err(TransportError::AlreadyClosed),
            }
        }
        let result = ClientInner::establish(&self.inner).await;
        if let Err(e) = &result {
            let mut state = self.inner.lock_state();
            if state.phase == ConnectionState::Connecting {
                state.phase = ConnectionState::Disconnected;
            }
            warn!(server = %self.inner.server.id, error = %e, "connect failed");
        }
        result
    }

    /// Sends a call and returns a handle resolving to its reply.
    ///
    /// Fails immediately when the connection is not `Connected`. A trace
    /// context is created for the call when `trace` is `None` and tracing is
    /// enabled in the config.
    pub fn send(&self, message: RpcMessage, trace: Option<TraceContext>) -> Result<ReplyHandle> {
        let inner = &self.inner;
        let (writer, index) = {
            let state = inner.lock_state();
            match (state.phase, &state.writer) {
                (ConnectionState::Connected, Some(writer)) => (writer.clone(), state.index.clone()),
                (ConnectionState::Closed, _) => return Err(TransportError::AlreadyClosed),
                _ => return Err(TransportError::NotConnected),
            }
        };

        let mut trace = trace.or_else(|| {
            inner.config.tracing.then(|| {
                TraceContext::new(inner.config.node_id.clone(), Some(inner.server.id.clone()))
            })
        });
        if let Some(ctx) = trace.as_mut() {
            ctx.record(TraceRole::Client, &message.method, "client about to send rpc message");
        }

        let (id, handle) = inner.correlator.register(trace.clone(), inner.config.request_timeout())?;
        let envelope = CallEnvelope {
            id,
            msg: message,
            trace: trace.as_ref().and_then(TraceFields::from_context),
        };
        if let Err(e) = inner.write_call(&writer, &envelope, index.as_deref()) {
            inner.correlator.cancel(id);
            return Err(e);
        }
        inner.metrics.inc_calls_sent();
        Ok(handle)
    }

    /// Sends a call and waits for its reply.
    pub async fn call(&self, message: RpcMessage, trace: Option<TraceContext>) -> Result<Reply> {
        let method = message.method.clone();
        let mut reply = self.send(message, trace)?.await?;
        if let Some(ctx) = reply.trace.as_mut() {
            ctx.record(TraceRole::Client, &method, "client received rpc reply");
        }
        Ok(reply)
    }

    /// Sends a call and returns the handler's values, turning an error-shaped
    /// reply into [`TransportError::Handler`].
    pub async fn invoke(&self, message: RpcMessage) -> Result<Vec<Value>> {
        let reply = self.call(message, None).await?;
        Ok(reply.into_result()?)
    }

    /// Closes the connection; idempotent.
    ///
    /// Every outstanding call fails with [`TransportError::Disconnected`].
    /// Returns the number of calls failed.
    pub fn close(&self) -> usize {
        self.inner.shutdown("connection closed")
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.inner.shutdown("connection dropped");
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("server", &self.inner.server)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ClientInner {
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    async fn establish(this: &Arc<Self>) -> Result<()> {
        let addr = this.server.addr();
        let tcp = this.config.tcp();
        let stream = TcpTransport::new(tcp.clone()).connect(&addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, this.config.max_frame_length, Arc::clone(&this.metrics));

        let weak = Arc::downgrade(this);
        let writer = spawn_writer(
            write_half,
            addr.clone(),
            this.config.max_frame_length,
            Arc::clone(&this.metrics),
            move |e| {
                if let Some(inner) = weak.upgrade() {
                    inner.emit(ConnectionEvent::Error {
                        message: e.to_string(),
                    });
                }
            },
        );
        writer.send(&Frame::control(FrameKind::Connect))?;

        let index = if this.codec.requires_handshake() {
            let wait = tokio::time::timeout(
                std::time::Duration::from_millis(tcp.connect_timeout_ms),
                read_handshake(&mut reader),
            );
            match wait.await {
                Ok(Ok(index)) => Some(Arc::new(index)),
                Ok(Err(e)) => {
                    writer.shutdown();
                    return Err(e);
                }
                Err(_) => {
                    writer.shutdown();
                    return Err(TransportError::ConnectTimeout {
                        addr,
                        timeout_ms: tcp.connect_timeout_ms,
                    });
                }
            }
        } else {
            None
        };

        let mut state = this.lock_state();
        if state.phase != ConnectionState::Connecting {
            writer.shutdown();
            return Err(TransportError::AlreadyClosed);
        }
        state.phase = ConnectionState::Connected;
        state.writer = Some(writer);
        state.index = index;

        let reader_task = tokio::spawn(read_loop(Arc::clone(this), reader));
        state.tasks.push(reader_task.abort_handle());
        if this.config.batch.enabled {
            let task = tokio::spawn(flush_loop(Arc::clone(this)));
            state.tasks.push(task.abort_handle());
        }
        if this.config.keepalive.enabled {
            let task = tokio::spawn(keepalive_loop(Arc::clone(this)));
            state.tasks.push(task.abort_handle());
        }
        drop(state);

        this.metrics.connection_opened();
        info!(server = %this.server.id, addr = %addr, format = ?this.codec.format(), "connected");
        Ok(())
    }

    fn write_call(
        &self,
        writer: &FrameSender,
        envelope: &CallEnvelope,
        index: Option<&ServiceIndex>,
    ) -> Result<()> {
        let encoded = self.codec.encode_call(envelope, index)?;
        if encoded.len() + 1 > writer.max_frame_length() {
            return Err(ProtocolError::FrameTooLarge {
                size: encoded.len() + 1,
                max_size: writer.max_frame_length(),
            }
            .into());
        }
        if self.config.batch.enabled {
            self.queue.push(encoded);
        } else {
            writer.send(&Frame::new(FrameKind::Message, encoded))?;
        }
        Ok(())
    }

    fn writer(&self) -> Option<FrameSender> {
        let state = self.lock_state();
        match state.phase {
            ConnectionState::Connected => state.writer.clone(),
            _ => None,
        }
    }

    /// Drains the queue into one batch frame. Returns the number of calls
    /// written.
    fn flush(&self) -> usize {
        let Some(writer) = self.writer() else {
            return 0;
        };
        let Some(items) = self.queue.drain() else {
            return 0;
        };
        let count = items.len();
        let frame = Frame::new(FrameKind::Batch, self.codec.encode_batch(&items));
        match writer.send(&frame) {
            Ok(_) => self.metrics.inc_batches_flushed(),
            Err(TransportError::Protocol(ProtocolError::FrameTooLarge { .. })) => {
                debug!(server = %self.server.id, count, "batch over frame limit, writing calls one by one");
                for item in items {
                    if let Err(e) = writer.send(&Frame::new(FrameKind::Message, item)) {
                        self.emit(ConnectionEvent::Error {
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }
            Err(e) => self.emit(ConnectionEvent::Error {
                message: e.to_string(),
            }),
        }
        debug!(server = %self.server.id, count, "flushed outbound queue");
        count
    }

    fn handle_frame(&self, frame: Frame) -> std::result::Result<(), ProtocolError> {
        match frame.kind {
            FrameKind::Message => {
                let reply = self.codec.decode_reply(&frame.body)?;
                self.deliver(reply);
            }
            FrameKind::Batch => {
                for item in self.codec.split_batch(&frame.body)? {
                    let reply = self.codec.decode_reply(item)?;
                    self.deliver(reply);
                }
            }
            FrameKind::Pong => {
                self.keepalive.record_pong(tokio::time::Instant::now().into_std());
                self.metrics.inc_pongs_received();
            }
            FrameKind::Handshake => {
                debug!(server = %self.server.id, "ignoring repeated handshake");
            }
            kind @ (FrameKind::Connect | FrameKind::Ping) => {
                return Err(ProtocolError::InvalidEnvelope(format!(
                    "unexpected {kind:?} frame from server"
                )));
            }
        }
        Ok(())
    }

    fn deliver(&self, reply: ReplyEnvelope) {
        self.metrics.inc_replies_received();
        self.correlator.resolve(reply.id, reply.resp, reply.trace);
    }

    fn shutdown(&self, reason: &str) -> usize {
        let (writer, tasks) = {
            let mut state = self.lock_state();
            if state.phase == ConnectionState::Closed {
                return 0;
            }
            state.phase = ConnectionState::Closed;
            (state.writer.take(), std::mem::take(&mut state.tasks))
        };
        for task in tasks {
            task.abort();
        }
        let dropped = self.queue.discard();
        if let Some(writer) = writer {
            writer.shutdown();
            self.metrics.connection_closed();
        }
        let failed = self.correlator.fail_all(|| TransportError::Disconnected {
            reason: reason.to_string(),
        });
        info!(server = %self.server.id, reason, failed, dropped, "connection closed");
        self.emit(ConnectionEvent::Closed {
            server_id: self.server.id.clone(),
        });
        failed
    }
}

async fn read_handshake(reader: &mut FrameReader) -> Result<ServiceIndex> {
    loop {
        match reader.next_frame().await? {
            Some(frame) if frame.kind == FrameKind::Handshake => {
                return Ok(ServiceIndex::from_handshake(&frame.body)?);
            }
            Some(frame) if frame.kind == FrameKind::Pong => continue,
            Some(frame) => {
                return Err(ProtocolError::InvalidHandshake(format!(
                    "expected handshake, got {:?} frame",
                    frame.kind
                ))
                .into())
            }
            None => {
                return Err(TransportError::Disconnected {
                    reason: "server closed the connection during handshake".to_string(),
                })
            }
        }
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut reader: FrameReader) {
    loop {
        let outcome = match reader.next_frame().await {
            Ok(Some(frame)) => inner.handle_frame(frame).map_err(TransportError::from),
            Ok(None) => {
                debug!(server = %inner.server.id, "server closed the stream");
                inner.emit(ConnectionEvent::PeerClosed {
                    server_id: inner.server.id.clone(),
                });
                return;
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {}
            Err(TransportError::Protocol(e)) => {
                inner.metrics.inc_protocol_errors();
                warn!(server = %inner.server.id, error = %e, "protocol error, closing connection");
                inner.emit(ConnectionEvent::Error {
                    message: e.to_string(),
                });
                inner.shutdown("protocol error");
                return;
            }
            Err(e) => {
                warn!(server = %inner.server.id, error = %e, "socket read failed");
                inner.emit(ConnectionEvent::Error {
                    message: e.to_string(),
                });
                return;
            }
        }
    }
}

async fn flush_loop(inner: Arc<ClientInner>) {
    let period = inner.config.batch.flush_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        inner.flush();
    }
}

async fn keepalive_loop(inner: Arc<ClientInner>) {
    let period = inner.config.keepalive.ping_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let now = tokio::time::Instant::now().into_std();
        match inner.keepalive.check(now) {
            KeepAliveAction::SendPing => {
                let Some(writer) = inner.writer() else {
                    return;
                };
                if writer.send(&Frame::control(FrameKind::Ping)).is_ok() {
                    inner.keepalive.record_ping(now);
                    inner.metrics.inc_pings_sent();
                }
            }
            KeepAliveAction::Wait => {}
            KeepAliveAction::Dead => {
                warn!(server = %inner.server.id, "keepalive watchdog expired");
                inner.emit(ConnectionEvent::Error {
                    message: "keepalive watchdog expired".to_string(),
                });
                inner.shutdown("keepalive watchdog expired");
                return;
            }
        }
    }
}
