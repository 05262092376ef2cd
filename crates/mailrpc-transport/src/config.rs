//! Transport configuration.
//!
//! Every section deserializes with defaults for missing keys, so a file only
//! needs the values it changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchConfig;
use crate::codec::WireFormat;
use crate::error::{Result, TransportError};
use crate::framing::DEFAULT_MAX_FRAME_LENGTH;
use crate::keepalive::KeepAliveConfig;
use crate::tcp::TcpTransportConfig;

const MIN_FRAME_LENGTH: usize = 16;

/// Where a client connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Server node id.
    pub id: String,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerDescriptor {
    /// Creates a descriptor.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port` form used to connect.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Envelope encoding.
    pub format: WireFormat,
    /// Per-call timeout.
    pub request_timeout_ms: u64,
    /// TCP connect timeout; also bounds the handshake wait.
    pub connect_timeout_ms: u64,
    /// Whether to set TCP_NODELAY.
    pub nodelay: bool,
    /// Largest accepted frame (kind byte + body).
    pub max_frame_length: usize,
    /// Cap on simultaneously outstanding calls.
    pub max_pending: usize,
    /// Whether outbound calls get a trace context.
    pub tracing: bool,
    /// Id of the local node, recorded as the trace source.
    pub node_id: Option<String>,
    /// Outbound batching.
    pub batch: BatchConfig,
    /// Ping/pong monitoring.
    pub keepalive: KeepAliveConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::Binary,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            nodelay: true,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_pending: 65_536,
            tracing: false,
            node_id: None,
            batch: BatchConfig::default(),
            keepalive: KeepAliveConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Per-call timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Socket settings for [`crate::tcp::TcpTransport`].
    pub fn tcp(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            nodelay: self.nodelay,
        }
    }

    /// Checks the settings for values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        non_zero("client.request_timeout_ms", self.request_timeout_ms)?;
        non_zero("client.connect_timeout_ms", self.connect_timeout_ms)?;
        frame_limit("client.max_frame_length", self.max_frame_length)?;
        if self.max_pending == 0 {
            return Err(TransportError::Config("client.max_pending must be positive".to_string()));
        }
        if self.batch.enabled {
            non_zero("client.batch.flush_interval_ms", self.batch.flush_interval_ms)?;
        }
        if self.keepalive.enabled {
            non_zero("client.keepalive.ping_interval_ms", self.keepalive.ping_interval_ms)?;
            non_zero("client.keepalive.watchdog_timeout_ms", self.keepalive.watchdog_timeout_ms)?;
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Envelope encoding.
    pub format: WireFormat,
    /// Whether to set TCP_NODELAY on accepted sockets.
    pub nodelay: bool,
    /// Largest accepted frame (kind byte + body).
    pub max_frame_length: usize,
    /// Outbound batching of replies.
    pub batch: BatchConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::Binary,
            nodelay: true,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            batch: BatchConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Socket settings for accepted connections.
    pub fn tcp(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            nodelay: self.nodelay,
            ..TcpTransportConfig::default()
        }
    }

    /// Checks the settings for values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        frame_limit("server.max_frame_length", self.max_frame_length)?;
        if self.batch.enabled {
            non_zero("server.batch.flush_interval_ms", self.batch.flush_interval_ms)?;
        }
        Ok(())
    }
}

/// Both sides of the transport, as loaded from a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Client settings.
    pub client: ClientConfig,
    /// Server settings.
    pub server: ServerConfig,
}

impl TransportConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| TransportError::Config(e.to_string())),
            "json" => {
                serde_json::from_str(&contents).map_err(|e| TransportError::Config(e.to_string()))
            }
            _ => Err(TransportError::Config(format!(
                "unsupported config file extension: {ext}"
            ))),
        }
    }

    /// Validates both sections.
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        self.server.validate()
    }
}

fn non_zero(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(TransportError::Config(format!("{name} must be positive")));
    }
    Ok(())
}

fn frame_limit(name: &str, value: usize) -> Result<()> {
    if value < MIN_FRAME_LENGTH {
        return Err(TransportError::Config(format!(
            "{name} must be at least {MIN_FRAME_LENGTH} bytes, got {value}"
        )));
    }
    Ok(())
}
