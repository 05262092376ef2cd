//! Envelope codecs.
//!
//! Two wire formats share one trait: the compact binary format, which relies on
//! the [`ServiceIndex`] handshake, and the JSON text format in [`crate::json`],
//! which spells names out and carries trace fields.
//!
//! Binary layouts (little-endian):
//!
//! ```text
//! call:  [u32 id][u16 namespace][u16 service][u16 method][value: args list]
//! reply: [u32 id][value: result list]
//! batch: [u32 count] then count x [u32 len][envelope]
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::index::ServiceIndex;
use crate::json::JsonCodec;
use crate::message::{CallEnvelope, ReplyEnvelope, RpcMessage};
use crate::value::{BeanRegistry, Value, WireReader, WireWriter};

/// Selects the envelope encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Tagged binary values with indexed method names.
    #[default]
    Binary,
    /// JSON envelopes; no index handshake.
    Json,
}

/// Encodes and decodes call/reply envelopes and batches of them.
pub trait EnvelopeCodec: Send + Sync + fmt::Debug {
    /// Format implemented by this codec.
    fn format(&self) -> WireFormat;

    /// Encodes a call; indexed formats need the negotiated index.
    fn encode_call(
        &self,
        call: &CallEnvelope,
        index: Option<&ServiceIndex>,
    ) -> Result<Bytes, ProtocolError>;

    /// Decodes a call; indexed formats need the index sent in the handshake.
    fn decode_call(
        &self,
        body: &[u8],
        index: Option<&ServiceIndex>,
    ) -> Result<CallEnvelope, ProtocolError>;

    /// Encodes a reply.
    fn encode_reply(&self, reply: &ReplyEnvelope) -> Result<Bytes, ProtocolError>;

    /// Decodes a reply.
    fn decode_reply(&self, body: &[u8]) -> Result<ReplyEnvelope, ProtocolError>;

    /// Joins already encoded envelopes into one batch body, preserving order.
    fn encode_batch(&self, items: &[Bytes]) -> Bytes;

    /// Splits a batch body back into encoded envelopes, in order.
    fn split_batch<'a>(&self, body: &'a [u8]) -> Result<Vec<&'a [u8]>, ProtocolError>;

    /// Whether connections using this codec must exchange a [`ServiceIndex`].
    fn requires_handshake(&self) -> bool {
        self.format() == WireFormat::Binary
    }
}

/// Builds the codec for `format`.
pub fn codec_for(format: WireFormat, beans: BeanRegistry) -> Arc<dyn EnvelopeCodec> {
    match format {
        WireFormat::Binary => Arc::new(BinaryCodec::new(beans)),
        WireFormat::Json => Arc::new(JsonCodec::new()),
    }
}

/// Compact binary codec.
#[derive(Debug, Clone, Default)]
pub struct BinaryCodec {
    beans: BeanRegistry,
}

impl BinaryCodec {
    /// Creates a binary codec resolving user-defined values through `beans`.
    pub fn new(beans: BeanRegistry) -> Self {
        Self { beans }
    }

    fn finish(reader: &WireReader<'_>) -> Result<(), ProtocolError> {
        match reader.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }

    fn read_list(reader: &mut WireReader<'_>) -> Result<Vec<Value>, ProtocolError> {
        match reader.read_value()? {
            Value::List(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(ProtocolError::InvalidEnvelope(format!(
                "expected a list, found tag {}",
                other.tag()
            ))),
        }
    }
}

fn write_list(out: &mut WireWriter, items: &[Value]) {
    out.write_u16(crate::value::TAG_LIST);
    out.write_u32(items.len() as u32);
    for item in items {
        out.write_value(item);
    }
}

impl EnvelopeCodec for BinaryCodec {
    fn format(&self) -> WireFormat {
        WireFormat::Binary
    }

    fn encode_call(
        &self,
        call: &CallEnvelope,
        index: Option<&ServiceIndex>,
    ) -> Result<Bytes, ProtocolError> {
        let index = index.ok_or(ProtocolError::HandshakeRequired)?;
        let msg = &call.msg;
        let (ns, svc, method) = index.encode_path(&msg.namespace, &msg.service, &msg.method)?;
        let mut out = WireWriter::with_capacity(16);
        out.write_u32(call.id);
        out.write_u16(ns);
        out.write_u16(svc);
        out.write_u16(method);
        write_list(&mut out, &msg.args);
        Ok(out.into_bytes())
    }

    fn decode_call(
        &self,
        body: &[u8],
        index: Option<&ServiceIndex>,
    ) -> Result<CallEnvelope, ProtocolError> {
        let index = index.ok_or(ProtocolError::HandshakeRequired)?;
        let mut reader = WireReader::with_beans(body, &self.beans);
        let id = reader.read_u32()?;
        let ns = reader.read_u16()?;
        let svc = reader.read_u16()?;
        let method = reader.read_u16()?;
        let path = index.decode_path(ns, svc, method)?;
        let args = Self::read_list(&mut reader)?;
        Self::finish(&reader)?;
        Ok(CallEnvelope {
            id,
            msg: RpcMessage::for_path(&path, args),
            trace: None,
        })
    }

    fn encode_reply(&self, reply: &ReplyEnvelope) -> Result<Bytes, ProtocolError> {
        let mut out = WireWriter::with_capacity(16);
        out.write_u32(reply.id);
        write_list(&mut out, &reply.resp);
        Ok(out.into_bytes())
    }

    fn decode_reply(&self, body: &[u8]) -> Result<ReplyEnvelope, ProtocolError> {
        let mut reader = WireReader::with_beans(body, &self.beans);
        let id = reader.read_u32()?;
        let resp = Self::read_list(&mut reader)?;
        Self::finish(&reader)?;
        Ok(ReplyEnvelope {
            id,
            resp,
            trace: None,
        })
    }

    fn encode_batch(&self, items: &[Bytes]) -> Bytes {
        let total: usize = items.iter().map(|i| i.len() + 4).sum();
        let mut out = WireWriter::with_capacity(total + 4);
        out.write_u32(items.len() as u32);
        for item in items {
            out.write_bytes(item);
        }
        out.into_bytes()
    }

    fn split_batch<'a>(&self, body: &'a [u8]) -> Result<Vec<&'a [u8]>, ProtocolError> {
        let mut reader = WireReader::new(body);
        let count = reader.read_u32()? as usize;
        // Each item carries at least its 4-byte length.
        if count.saturating_mul(4) > reader.remaining() {
            return Err(ProtocolError::Truncated {
                needed: count.saturating_mul(4),
                available: reader.remaining(),
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(reader.read_bytes()?);
        }
        Self::finish(&reader)?;
        Ok(items)
    }
}
