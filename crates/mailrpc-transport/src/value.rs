//! Typed values carried in RPC argument and result lists.
//!
//! Every value is written as a 16-bit tag followed by a tag-specific payload.
//! Lengths and numbers are little-endian. Decoding never reads past the end of
//! the input; short input is reported as [`ProtocolError::Truncated`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Wire tag for [`Value::Null`].
pub const TAG_NULL: u16 = 1;
/// Wire tag for [`Value::Blob`].
pub const TAG_BLOB: u16 = 2;
/// Wire tag for [`Value::List`].
pub const TAG_LIST: u16 = 3;
/// Wire tag for [`Value::String`].
pub const TAG_STRING: u16 = 4;
/// Wire tag for [`Value::Object`].
pub const TAG_OBJECT: u16 = 5;
/// Wire tag for [`Value::Bean`].
pub const TAG_BEAN: u16 = 6;
/// Wire tag for [`Value::Bool`].
pub const TAG_BOOL: u16 = 7;
/// Wire tag for [`Value::Float`].
pub const TAG_FLOAT: u16 = 8;
/// Wire tag for [`Value::Int`].
pub const TAG_INT: u16 = 9;

/// A user-defined value that serializes its own fields.
///
/// Beans are identified on the wire by [`Bean::bean_id`]; the receiving side
/// must have a factory for that id registered in its [`BeanRegistry`].
pub trait Bean: fmt::Debug + Send + Sync {
    /// Stable identifier written ahead of the fields.
    fn bean_id(&self) -> &str;

    /// Writes the bean's fields.
    fn write_fields(&self, out: &mut WireWriter);

    /// Reads the bean's fields into `self`.
    fn read_fields(&mut self, input: &mut WireReader<'_>) -> Result<(), ProtocolError>;

    /// Plain JSON rendering used by the text codec.
    fn to_json(&self) -> serde_json::Value;
}

type BeanFactory = Arc<dyn Fn() -> Box<dyn Bean> + Send + Sync>;

/// Maps bean ids to factories producing empty instances ready for `read_fields`.
#[derive(Clone, Default)]
pub struct BeanRegistry {
    factories: HashMap<String, BeanFactory>,
}

impl BeanRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for `id`, replacing any previous one.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Bean> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    /// Returns true if a factory is registered for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    fn instantiate(&self, id: &str) -> Option<Box<dyn Bean>> {
        self.factories.get(id).map(|factory| factory())
    }
}

impl fmt::Debug for BeanRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.factories.keys().collect();
        ids.sort();
        f.debug_struct("BeanRegistry").field("ids", &ids).finish()
    }
}

/// A value that can travel in an argument or result list.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent value.
    Null,
    /// Raw bytes.
    Blob(Bytes),
    /// Ordered list of nested values.
    List(Vec<Value>),
    /// UTF-8 string.
    String(String),
    /// Generic object, carried as JSON text.
    Object(serde_json::Value),
    /// User-defined serializable value.
    Bean(Arc<dyn Bean>),
    /// Boolean.
    Bool(bool),
    /// Single-precision float.
    Float(f32),
    /// 32-bit signed integer.
    Int(i32),
}

impl Value {
    /// Wire tag for this variant.
    pub fn tag(&self) -> u16 {
        match self {
            Value::Null => TAG_NULL,
            Value::Blob(_) => TAG_BLOB,
            Value::List(_) => TAG_LIST,
            Value::String(_) => TAG_STRING,
            Value::Object(_) => TAG_OBJECT,
            Value::Bean(_) => TAG_BEAN,
            Value::Bool(_) => TAG_BOOL,
            Value::Float(_) => TAG_FLOAT,
            Value::Int(_) => TAG_INT,
        }
    }

    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrows the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, if this is an int.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Builds a generic object value.
    pub fn object(value: serde_json::Value) -> Self {
        Value::Object(value)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Bean(a), Value::Bean(b)) => {
                if a.bean_id() != b.bean_id() {
                    return false;
                }
                let mut left = WireWriter::new();
                a.write_fields(&mut left);
                let mut right = WireWriter::new();
                b.write_fields(&mut right);
                left.as_slice() == right.as_slice()
            }
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits() || a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Blob(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// Append-only little-endian writer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Writes one byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Writes a 16-bit unsigned integer.
    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    /// Writes a 32-bit unsigned integer.
    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    /// Writes a 32-bit signed integer.
    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    /// Writes a single-precision float.
    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    /// Writes a boolean as one byte.
    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    /// Writes a length-prefixed byte string.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.put_u32_le(v.len() as u32);
        self.buf.put_slice(v);
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, v: &str) {
        self.write_bytes(v.as_bytes());
    }

    /// Writes raw bytes without a prefix.
    pub fn write_raw(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Writes a tagged value, recursing into lists.
    pub fn write_value(&mut self, value: &Value) {
        self.write_u16(value.tag());
        match value {
            Value::Null => {}
            Value::Blob(b) => self.write_bytes(b),
            Value::List(items) => {
                self.write_u32(items.len() as u32);
                for item in items {
                    self.write_value(item);
                }
            }
            Value::String(s) => self.write_string(s),
            Value::Object(obj) => self.write_string(&obj.to_string()),
            Value::Bean(bean) => {
                self.write_string(bean.bean_id());
                bean.write_fields(self);
            }
            Value::Bool(b) => self.write_bool(*b),
            Value::Float(f) => self.write_f32(*f),
            Value::Int(n) => self.write_i32(*n),
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrows the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer, returning the written bytes.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Deepest list or bean nesting [`WireReader::read_value`] accepts.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Bounds-checked little-endian reader over a byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    beans: Option<&'a BeanRegistry>,
    depth: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader without bean support.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            beans: None,
            depth: 0,
        }
    }

    /// Creates a reader that resolves beans through `beans`.
    pub fn with_beans(buf: &'a [u8], beans: &'a BeanRegistry) -> Self {
        Self {
            buf,
            beans: Some(beans),
            depth: 0,
        }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn check(&self, needed: usize) -> Result<(), ProtocolError> {
        if needed > self.buf.len() {
            return Err(ProtocolError::Truncated {
                needed,
                available: self.buf.len(),
            });
        }
        Ok(())
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.check(1)?;
        Ok(self.buf.get_u8())
    }

    /// Reads a 16-bit unsigned integer.
    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        self.check(2)?;
        Ok(self.buf.get_u16_le())
    }

    /// Reads a 32-bit unsigned integer.
    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.check(4)?;
        Ok(self.buf.get_u32_le())
    }

    /// Reads a 32-bit signed integer.
    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.check(4)?;
        Ok(self.buf.get_i32_le())
    }

    /// Reads a single-precision float.
    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        self.check(4)?;
        Ok(self.buf.get_f32_le())
    }

    /// Reads a boolean byte; any non-zero value is true.
    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_u32()? as usize;
        self.check(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let raw = self.read_bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn enter(&mut self) -> Result<(), ProtocolError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
        }
        self.depth += 1;
        Ok(())
    }

    /// Reads a tagged value.
    ///
    /// Lists and beans may nest at most [`MAX_NESTING_DEPTH`] levels.
    pub fn read_value(&mut self) -> Result<Value, ProtocolError> {
        let tag = self.read_u16()?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BLOB => Ok(Value::Blob(Bytes::copy_from_slice(self.read_bytes()?))),
            TAG_LIST => {
                let count = self.read_u32()? as usize;
                // Every element costs at least its 2-byte tag.
                self.check(count.saturating_mul(2))?;
                self.enter()?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_value()?);
                }
                self.depth -= 1;
                Ok(Value::List(items))
            }
            TAG_STRING => Ok(Value::String(self.read_string()?)),
            TAG_OBJECT => {
                let text = self.read_string()?;
                serde_json::from_str(&text)
                    .map(Value::Object)
                    .map_err(|e| ProtocolError::InvalidJson(e.to_string()))
            }
            TAG_BEAN => {
                let id = self.read_string()?;
                let mut bean = self
                    .beans
                    .and_then(|registry| registry.instantiate(&id))
                    .ok_or_else(|| ProtocolError::UnknownBean(id.clone()))?;
                self.enter()?;
                bean.read_fields(self)?;
                self.depth -= 1;
                Ok(Value::Bean(Arc::from(bean)))
            }
            TAG_BOOL => Ok(Value::Bool(self.read_bool()?)),
            TAG_FLOAT => Ok(Value::Float(self.read_f32()?)),
            TAG_INT => Ok(Value::Int(self.read_i32()?)),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Encodes a single value.
pub fn encode_value(value: &Value) -> Bytes {
    let mut out = WireWriter::new();
    out.write_value(value);
    out.into_bytes()
}

/// Decodes a single value, rejecting trailing bytes.
pub fn decode_value(buf: &[u8], beans: &BeanRegistry) -> Result<Value, ProtocolError> {
    let mut reader = WireReader::with_beans(buf, beans);
    let value = reader.read_value()?;
    if reader.remaining() != 0 {
        return Err(ProtocolError::TrailingBytes(reader.remaining()));
    }
    Ok(value)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    pub(crate) struct Position {
        pub x: i32,
        pub y: i32,
        pub label: String,
    }

    impl Bean for Position {
        fn bean_id(&self) -> &str {
            "position"
        }

        fn write_fields(&self, out: &mut WireWriter) {
            out.write_i32(self.x);
            out.write_i32(self.y);
            out.write_string(&self.label);
        }

        fn read_fields(&mut self, input: &mut WireReader<'_>) -> Result<(), ProtocolError> {
            self.x = input.read_i32()?;
            self.y = input.read_i32()?;
            self.label = input.read_string()?;
            Ok(())
        }

        fn to_json(&self) -> serde_json::Value {
            serde_json::json!({"x": self.x, "y": self.y, "label": self.label})
        }
    }

    pub(crate) fn position_registry() -> BeanRegistry {
        let mut registry = BeanRegistry::new();
        registry.register("position", || Box::new(Position::default()));
        registry
    }

    #[test]
    fn test_int_layout_is_little_endian() {
        let bytes = encode_value(&Value::Int(1));
        assert_eq!(&bytes[..], &[TAG_INT as u8, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_string_layout() {
        let bytes = encode_value(&Value::from("hi"));
        assert_eq!(&bytes[..], &[TAG_STRING as u8, 0, 2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn test_nested_list_roundtrip() {
        let value = Value::List(vec![
            Value::Null,
            Value::Bool(true),
            Value::List(vec![Value::Int(-7), Value::Float(1.5)]),
            Value::Blob(Bytes::from_static(b"\x00\x01")),
            Value::Object(serde_json::json!({"k": [1, 2]})),
        ]);
        let bytes = encode_value(&value);
        let decoded = decode_value(&bytes, &BeanRegistry::new()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_bean_roundtrip() {
        let bean = Position {
            x: 3,
            y: -4,
            label: "spawn".to_string(),
        };
        let value = Value::Bean(Arc::new(bean));
        let bytes = encode_value(&value);
        let decoded = decode_value(&bytes, &position_registry()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_unknown_bean_rejected() {
        let value = Value::Bean(Arc::new(Position::default()));
        let bytes = encode_value(&value);
        let err = decode_value(&bytes, &BeanRegistry::new()).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownBean("position".to_string()));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = decode_value(&[0x63, 0x00], &BeanRegistry::new()).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownTag(0x63));
    }

    #[test]
    fn test_length_past_end_rejected() {
        let mut out = WireWriter::new();
        out.write_u16(TAG_STRING);
        out.write_u32(100);
        out.write_raw(b"short");
        let err = decode_value(out.as_slice(), &BeanRegistry::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { needed: 100, available: 5 }));
    }

    #[test]
    fn test_huge_list_count_rejected_without_allocating() {
        let mut out = WireWriter::new();
        out.write_u16(TAG_LIST);
        out.write_u32(u32::MAX);
        let err = decode_value(out.as_slice(), &BeanRegistry::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut out = WireWriter::new();
        out.write_u16(TAG_STRING);
        out.write_bytes(&[0xff, 0xfe]);
        let err = decode_value(out.as_slice(), &BeanRegistry::new()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidUtf8);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut out = WireWriter::new();
        out.write_value(&Value::Null);
        out.write_u8(0);
        let err = decode_value(out.as_slice(), &BeanRegistry::new()).unwrap_err();
        assert_eq!(err, ProtocolError::TrailingBytes(1));
    }

    fn nested_lists(levels: usize) -> Vec<u8> {
        let mut out = WireWriter::new();
        for _ in 0..levels {
            out.write_u16(TAG_LIST);
            out.write_u32(1);
        }
        out.write_u16(TAG_NULL);
        out.as_slice().to_vec()
    }

    #[test]
    fn test_nesting_at_limit_decodes() {
        let value = decode_value(&nested_lists(MAX_NESTING_DEPTH), &BeanRegistry::new()).unwrap();
        let mut depth = 0;
        let mut cursor = &value;
        while let Value::List(items) = cursor {
            depth += 1;
            cursor = &items[0];
        }
        assert_eq!(depth, MAX_NESTING_DEPTH);
        assert_eq!(cursor, &Value::Null);
    }

    #[test]
    fn test_nesting_past_limit_rejected() {
        let err = decode_value(&nested_lists(MAX_NESTING_DEPTH + 1), &BeanRegistry::new())
            .unwrap_err();
        assert_eq!(err, ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
    }

    #[test]
    fn test_half_million_levels_fail_without_overflowing() {
        let err = decode_value(&nested_lists(500_000), &BeanRegistry::new()).unwrap_err();
        assert_eq!(err, ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
    }

    #[test]
    fn test_sibling_lists_do_not_accumulate_depth() {
        let mut out = WireWriter::new();
        out.write_u16(TAG_LIST);
        out.write_u32(MAX_NESTING_DEPTH as u32 * 2);
        for _ in 0..MAX_NESTING_DEPTH * 2 {
            out.write_u16(TAG_LIST);
            out.write_u32(0);
        }
        let value = decode_value(out.as_slice(), &BeanRegistry::new()).unwrap();
        assert!(matches!(value, Value::List(items) if items.len() == MAX_NESTING_DEPTH * 2));
    }

    pub(crate) fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(Value::Int),
            (-1.0e6f32..1.0e6f32).prop_map(Value::Float),
            ".{0,16}".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..32)
                .prop_map(|b| Value::Blob(Bytes::from(b))),
            (any::<i64>(), "[a-z]{1,8}")
                .prop_map(|(n, k)| Value::Object(serde_json::json!({ k: n }))),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            proptest::collection::vec(inner, 0..6).prop_map(Value::List)
        })
    }

    proptest! {
        #[test]
        fn prop_value_roundtrip(value in arb_value()) {
            let bytes = encode_value(&value);
            let decoded = decode_value(&bytes, &BeanRegistry::new()).unwrap();
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn prop_truncated_input_never_panics(value in arb_value(), cut in 0usize..64) {
            let bytes = encode_value(&value);
            let cut = cut.min(bytes.len());
            let _ = decode_value(&bytes[..cut], &BeanRegistry::new());
        }
    }
}
