//! JSON text codec.
//!
//! Envelopes are plain JSON objects:
//!
//! ```text
//! call:  {"id":0,"msg":{"namespace":"area","service":"chat","method":"send","args":["hi"]},
//!         "traceId":"...","seqId":1,"source":"gate-1","remote":"chat-1"}
//! reply: {"id":0,"resp":[null,"ok"],"traceId":"...","seqId":1,"source":"gate-1"}
//! batch: [envelope, envelope, ...]
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Number};

use crate::codec::{EnvelopeCodec, WireFormat};
use crate::error::ProtocolError;
use crate::index::ServiceIndex;
use crate::message::{CallEnvelope, ReplyEnvelope, RpcMessage, TraceFields};
use crate::value::Value;

#[derive(Debug, Serialize, Deserialize)]
struct JsonMsg {
    namespace: String,
    service: String,
    method: String,
    #[serde(default)]
    args: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonCall {
    id: u32,
    msg: JsonMsg,
    #[serde(flatten)]
    trace: TraceFields,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonReply {
    id: u32,
    #[serde(default)]
    resp: Vec<serde_json::Value>,
    #[serde(flatten)]
    trace: TraceFields,
}

/// Converts a value into its JSON form.
///
/// Blobs use the `{"type":"Buffer","data":[...]}` shape; beans are written as
/// their own JSON rendering and come back as generic objects.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Blob(bytes) => {
            let data = bytes.iter().map(|b| serde_json::Value::from(*b)).collect();
            let mut map = Map::new();
            map.insert("type".to_string(), serde_json::Value::from("Buffer"));
            map.insert("data".to_string(), serde_json::Value::Array(data));
            serde_json::Value::Object(map)
        }
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Object(obj) => obj.clone(),
        Value::Bean(bean) => bean.to_json(),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Float(f) => Number::from_f64(f64::from(*f))
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Int(n) => serde_json::Value::from(*n),
    }
}

fn buffer_bytes(map: &Map<String, serde_json::Value>) -> Option<Bytes> {
    if map.len() != 2 || map.get("type")?.as_str()? != "Buffer" {
        return None;
    }
    let data = map.get("data")?.as_array()?;
    let mut out = Vec::with_capacity(data.len());
    for item in data {
        out.push(u8::try_from(item.as_u64()?).ok()?);
    }
    Some(Bytes::from(out))
}

/// Converts JSON back into a value.
///
/// Integral numbers in `i32` range become [`Value::Int`], numbers exactly
/// representable as `f32` become [`Value::Float`], and any other number stays a
/// generic object so no precision is lost.
pub fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                return Value::Int(i);
            }
            if n.is_f64() {
                if let Some(f) = n.as_f64() {
                    let narrowed = f as f32;
                    if f64::from(narrowed) == f {
                        return Value::Float(narrowed);
                    }
                }
            }
            Value::Object(serde_json::Value::Number(n))
        }
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => match buffer_bytes(&map) {
            Some(bytes) => Value::Blob(bytes),
            None => Value::Object(serde_json::Value::Object(map)),
        },
    }
}

fn invalid_json(err: serde_json::Error) -> ProtocolError {
    ProtocolError::InvalidJson(err.to_string())
}

fn serialize<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(value).map(Bytes::from).map_err(invalid_json)
}

/// JSON envelope codec; needs no service index.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Creates the codec.
    pub fn new() -> Self {
        JsonCodec
    }
}

impl EnvelopeCodec for JsonCodec {
    fn format(&self) -> WireFormat {
        WireFormat::Json
    }

    fn encode_call(
        &self,
        call: &CallEnvelope,
        _index: Option<&ServiceIndex>,
    ) -> Result<Bytes, ProtocolError> {
        let wire = JsonCall {
            id: call.id,
            msg: JsonMsg {
                namespace: call.msg.namespace.clone(),
                service: call.msg.service.clone(),
                method: call.msg.method.clone(),
                args: call.msg.args.iter().map(value_to_json).collect(),
            },
            trace: call.trace.clone().unwrap_or_default(),
        };
        serialize(&wire)
    }

    fn decode_call(
        &self,
        body: &[u8],
        _index: Option<&ServiceIndex>,
    ) -> Result<CallEnvelope, ProtocolError> {
        let wire: JsonCall = serde_json::from_slice(body).map_err(invalid_json)?;
        let args = wire.msg.args.into_iter().map(json_to_value).collect();
        Ok(CallEnvelope {
            id: wire.id,
            msg: RpcMessage::new(wire.msg.namespace, wire.msg.service, wire.msg.method, args),
            trace: Some(wire.trace).filter(|t| !t.is_empty()),
        })
    }

    fn encode_reply(&self, reply: &ReplyEnvelope) -> Result<Bytes, ProtocolError> {
        let mut trace = reply.trace.clone().unwrap_or_default();
        trace.remote = None;
        let wire = JsonReply {
            id: reply.id,
            resp: reply.resp.iter().map(value_to_json).collect(),
            trace,
        };
        serialize(&wire)
    }

    fn decode_reply(&self, body: &[u8]) -> Result<ReplyEnvelope, ProtocolError> {
        let wire: JsonReply = serde_json::from_slice(body).map_err(invalid_json)?;
        Ok(ReplyEnvelope {
            id: wire.id,
            resp: wire.resp.into_iter().map(json_to_value).collect(),
            trace: Some(wire.trace).filter(|t| !t.is_empty()),
        })
    }

    fn encode_batch(&self, items: &[Bytes]) -> Bytes {
        let total: usize = items.iter().map(|i| i.len() + 1).sum();
        let mut out = Vec::with_capacity(total + 2);
        out.push(b'[');
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(item);
        }
        out.push(b']');
        Bytes::from(out)
    }

    fn split_batch<'a>(&self, body: &'a [u8]) -> Result<Vec<&'a [u8]>, ProtocolError> {
        let raw: Vec<&'a RawValue> = serde_json::from_slice(body).map_err(invalid_json)?;
        Ok(raw.into_iter().map(|r| r.get().as_bytes()).collect())
    }
}
