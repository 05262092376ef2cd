//! Property-based tests for the envelope codecs and the frame composer.

use bytes::Bytes;
use mailrpc_transport::{CallEnvelope, RpcMessage, Value};
use proptest::prelude::*;

/// Values every codec carries losslessly: no floats or beans.
pub fn arb_plain_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::Int),
        "[a-zA-Z0-9 ]{0,24}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(Value::List)
    })
}

/// Values the binary codec carries losslessly.
pub fn arb_binary_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::Int),
        (-1.0e6f32..1.0e6f32).prop_map(Value::Float),
        "[a-zA-Z0-9 ]{0,24}".prop_map(Value::String),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(|b| Value::Blob(Bytes::from(b))),
        "[a-z]{1,8}".prop_map(|k| Value::object(serde_json::json!({ "key": k }))),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(Value::List)
    })
}

/// A call to one of the chat methods with arbitrary arguments.
pub fn arb_call<S>(args: S) -> impl Strategy<Value = CallEnvelope>
where
    S: Strategy<Value = Value> + 'static,
{
    (
        any::<u32>(),
        prop::sample::select(vec!["send", "kick", "stall"]),
        prop::collection::vec(args, 0..4),
    )
        .prop_map(|(id, method, args)| CallEnvelope {
            id,
            msg: RpcMessage::new("area", "chat", method, args),
            trace: None,
        })
}
