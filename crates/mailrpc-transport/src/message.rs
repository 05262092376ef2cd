//! RPC envelopes: calls travelling client to server and replies travelling back.

use serde::{Deserialize, Serialize};

use crate::error::HandlerError;
use crate::index::MethodPath;
use crate::trace::TraceContext;
use crate::value::Value;

/// Correlation id linking a reply to its call on one connection.
pub type CorrelationId = u32;

/// A decoded call: which method to run and with what arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMessage {
    /// Namespace of the target service.
    pub namespace: String,
    /// Target service.
    pub service: String,
    /// Target method.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

impl RpcMessage {
    /// Creates a call message.
    pub fn new(
        namespace: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
            method: method.into(),
            args,
        }
    }

    /// Builds a message for a known method path.
    pub fn for_path(path: &MethodPath, args: Vec<Value>) -> Self {
        Self::new(&path.namespace, &path.service, &path.method, args)
    }

    /// The method path this message targets.
    pub fn path(&self) -> MethodPath {
        MethodPath::new(&self.namespace, &self.service, &self.method)
    }
}

/// Trace fields carried by the text codec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceFields {
    /// Trace id shared by every hop of one logical call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Sequence number within the trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_id: Option<u64>,
    /// Node that issued the call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Node the call is addressed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

impl TraceFields {
    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none() && self.seq_id.is_none() && self.source.is_none() && self.remote.is_none()
    }

    /// Captures the wire fields of an enabled trace context.
    pub fn from_context(ctx: &TraceContext) -> Option<Self> {
        if !ctx.is_enabled() {
            return None;
        }
        Some(Self {
            trace_id: Some(ctx.trace_id().to_string()),
            seq_id: Some(ctx.seq()),
            source: ctx.source().map(str::to_string),
            remote: ctx.remote().map(str::to_string),
        })
    }
}

/// Call envelope: client to server.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    /// Correlation id assigned by the client.
    pub id: CorrelationId,
    /// The call itself.
    pub msg: RpcMessage,
    /// Optional trace fields (text codec only).
    pub trace: Option<TraceFields>,
}

/// Reply envelope: server to client.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyEnvelope {
    /// Correlation id copied from the call.
    pub id: CorrelationId,
    /// Result list; the first slot holds the handler error or null.
    pub resp: Vec<Value>,
    /// Optional trace fields (text codec only).
    pub trace: Option<TraceFields>,
}

impl ReplyEnvelope {
    /// Builds the reply for a handler outcome.
    ///
    /// A success becomes `[null, values...]`; a failure becomes the sanitized
    /// `{message, stack}` object in the first slot.
    pub fn from_outcome(
        id: CorrelationId,
        outcome: Result<Vec<Value>, HandlerError>,
        trace: Option<TraceFields>,
    ) -> Self {
        let resp = match outcome {
            Ok(values) => {
                let mut resp = Vec::with_capacity(values.len() + 1);
                resp.push(Value::Null);
                resp.extend(values);
                resp
            }
            Err(err) => vec![error_to_value(&err)],
        };
        Self { id, resp, trace }
    }
}

/// Renders a handler error as the error-shaped object sent on the wire.
pub fn error_to_value(err: &HandlerError) -> Value {
    Value::Object(serde_json::json!({
        "message": err.message,
        "stack": err.stack,
    }))
}

/// Recognizes an error-shaped value: an object with a string `message` and no
/// keys besides `message` and `stack`.
pub fn value_to_error(value: &Value) -> Option<HandlerError> {
    let Value::Object(serde_json::Value::Object(map)) = value else {
        return None;
    };
    let message = map.get("message")?.as_str()?;
    if map.keys().any(|k| k != "message" && k != "stack") {
        return None;
    }
    let stack = map
        .get("stack")
        .and_then(|s| s.as_str())
        .unwrap_or_default();
    Some(HandlerError::new(message).with_stack(stack))
}

/// A reply delivered to the caller of `send`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Correlation id of the call.
    pub id: CorrelationId,
    /// Raw result list as sent by the server.
    pub args: Vec<Value>,
    /// Trace context of the call, when tracing was enabled.
    pub trace: Option<TraceContext>,
}

impl Reply {
    /// Splits the raw result list into the handler outcome.
    ///
    /// An error-shaped first slot becomes `Err`; otherwise the first slot is
    /// dropped when it is null and the remaining values are returned.
    pub fn into_result(self) -> Result<Vec<Value>, HandlerError> {
        let mut args = self.args;
        match args.first() {
            None => Ok(args),
            Some(Value::Null) => {
                args.remove(0);
                Ok(args)
            }
            Some(first) => match value_to_error(first) {
                Some(err) => Err(err),
                None => Ok(args),
            },
        }
    }
}
