//! TCP plumbing shared by both sides: connecting and accepting, a frame
//! reader over the read half, and an ordered writer task over the write half.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::framing::{encode_frame, Frame, FrameComposer};
use crate::metrics::TransportMetrics;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// TCP socket settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// Creates TCP connections.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Opens a connection to `addr`, bounded by the connect timeout.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        debug!(addr, "TCP connected");
        Ok(stream)
    }

    /// Binds a listening socket.
    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Accepts one incoming connection.
    pub async fn accept(&self, listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = listener.accept().await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok((stream, peer))
    }
}

/// Reads whole frames from the read half of a socket.
#[derive(Debug)]
pub struct FrameReader {
    half: OwnedReadHalf,
    composer: FrameComposer,
    pending: VecDeque<Frame>,
    buf: Vec<u8>,
    metrics: Arc<TransportMetrics>,
}

impl FrameReader {
    /// Wraps a read half.
    pub fn new(half: OwnedReadHalf, max_frame_length: usize, metrics: Arc<TransportMetrics>) -> Self {
        Self {
            half,
            composer: FrameComposer::new(max_frame_length),
            pending: VecDeque::new(),
            buf: vec![0u8; READ_BUFFER_SIZE],
            metrics,
        }
    }

    /// Returns the next frame, or `None` once the peer has closed its side.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            if let Some(err) = self.composer.take_error() {
                return Err(err.into());
            }
            let n = self.half.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.metrics.add_bytes_received(n as u64);
            let frames = self.composer.feed(&self.buf[..n])?;
            self.pending.extend(frames);
        }
    }
}

#[derive(Debug)]
enum Outbound {
    Frame(Bytes),
    Shutdown,
}

/// Handle to a connection's writer task.
///
/// Frames are written in the order they are handed over, whichever task
/// hands them over.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Outbound>,
    max_frame_length: usize,
}

impl FrameSender {
    /// Encodes `frame` and queues it for writing. Returns the encoded size.
    pub fn send(&self, frame: &Frame) -> Result<usize> {
        let bytes = encode_frame(frame, self.max_frame_length)?;
        let len = bytes.len();
        self.tx
            .send(Outbound::Frame(bytes))
            .map_err(|_| TransportError::Disconnected {
                reason: "writer stopped".to_string(),
            })?;
        Ok(len)
    }

    /// Asks the writer to shut the write side down once queued frames are out.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Outbound::Shutdown);
    }

    /// Returns true once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Largest frame this sender accepts.
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

/// Spawns the ordered writer task for `half`.
///
/// `on_error` runs once if a write fails; the task stops afterwards.
pub fn spawn_writer<F>(
    mut half: OwnedWriteHalf,
    peer: String,
    max_frame_length: usize,
    metrics: Arc<TransportMetrics>,
    on_error: F,
) -> FrameSender
where
    F: FnOnce(std::io::Error) + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(bytes) => {
                    if let Err(e) = half.write_all(&bytes).await {
                        debug!(peer = %peer, error = %e, "socket write failed");
                        on_error(e);
                        return;
                    }
                    metrics.add_bytes_sent(bytes.len() as u64);
                }
                Outbound::Shutdown => break,
            }
        }
        let _ = half.shutdown().await;
        debug!(peer = %peer, "writer stopped");
    });
    FrameSender {
        tx,
        max_frame_length,
    }
}
