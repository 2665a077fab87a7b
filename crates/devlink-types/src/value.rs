//! Structurally typed payloads carried in envelope `args` and `value` fields.
//!
//! A [`Value`] is serialized as plain JSON, with one exception: byte strings
//! travel as `{"base64": "..."}` so that arbitrary octets survive a text-only
//! channel and come back as [`Value::Bytes`] rather than as text.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Object key marking a base64-carried byte string on the wire.
pub const BYTES_KEY: &str = "base64";

/// Errors converting between JSON and [`Value`].
#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("integer out of range: {0}")]
    IntegerOutOfRange(String),
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
    #[error("unsupported object payload (expected {{\"{BYTES_KEY}\": ...}})")]
    UnsupportedObject,
}

/// A payload value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

/// The declared type of a property, used to pick an empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Null,
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    List,
}

impl ValueKind {
    /// The empty value of this kind (`""`, `0`, `false`, ...).
    pub fn empty(self) -> Value {
        match self {
            ValueKind::Null => Value::Null,
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::Int(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Text => Value::Text(String::new()),
            ValueKind::Bytes => Value::Bytes(Vec::new()),
            ValueKind::List => Value::List(Vec::new()),
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Pick argument `index` out of an event payload.
    ///
    /// Multi-argument events carry a list; a scalar payload is argument 0.
    pub fn event_arg(&self, index: usize) -> Option<&Value> {
        match self {
            Value::List(items) => items.get(index),
            other if index == 0 => Some(other),
            _ => None,
        }
    }

    /// Interpret this value as binary data: bytes pass through, text is
    /// decoded as base64.
    pub fn to_binary(&self) -> Result<Vec<u8>, ValueError> {
        match self {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => decode_base64(s),
            Value::Null => Ok(Vec::new()),
            _ => Err(ValueError::InvalidBase64(format!(
                "expected bytes or base64 text, got {:?}",
                self.kind()
            ))),
        }
    }
}

/// Encode raw bytes as standard base64 text.
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode standard base64 text. Exact inverse of [`encode_base64`].
pub fn decode_base64(text: &str) -> Result<Vec<u8>, ValueError> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| ValueError::InvalidBase64(e.to_string()))
}

impl TryFrom<serde_json::Value> for Value {
    type Error = ValueError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if n.is_u64() {
                    return Err(ValueError::IntegerOutOfRange(n.to_string()));
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(mut map) => {
                if map.len() != 1 {
                    return Err(ValueError::UnsupportedObject);
                }
                match map.remove(BYTES_KEY) {
                    Some(serde_json::Value::String(text)) => Value::Bytes(decode_base64(&text)?),
                    _ => return Err(ValueError::UnsupportedObject),
                }
            }
        })
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            // Non-finite floats have no JSON form
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s),
            Value::Bytes(b) => {
                let mut map = serde_json::Map::new();
                map.insert(
                    BYTES_KEY.to_string(),
                    serde_json::Value::String(encode_base64(&b)),
                );
                serde_json::Value::Object(map)
            }
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
