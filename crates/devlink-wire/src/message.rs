//! Envelope types and the canonical codec.
//!
//! Every exchange between a proxy and a peer registry is one [`Envelope`],
//! serialized as JSON. On a stream transport each envelope travels inside a
//! [`Frame`] that adds the channel number, prefixed with a 4-byte big-endian
//! length header.

use devlink_types::Value;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Transport channel number.
pub type Channel = u16;

/// Errors from the codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(serde_json::Error),
    #[error("Decode error: {0}")]
    Decode(serde_json::Error),
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
}

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Init,
    Command,
    Query,
    Update,
    Error,
}

/// Machine-readable reason carried by Error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The adapter could not bind its resource.
    ConstructionFailed,
    /// No Ready object under this alias.
    ObjectMissing,
    /// The name is not in the object's capability table.
    PropertyMissing,
    /// The resource call failed.
    InvocationFailed,
    /// The alias is already registered under another type.
    AliasConflict,
    /// No factory for the requested type.
    UnknownType,
    /// The link to the peer went down.
    Offline,
    /// A code this build does not know.
    #[serde(other)]
    Unknown,
}

/// Qualifier attached to an Error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
}

/// One discrete message unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Target (or source) object on the peer.
    pub alias: String,
    /// Property, method or event name. Absent on Init and its reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
    /// Serialized as `null` when absent.
    #[serde(default)]
    pub qualifier: Option<ErrorDetail>,
    /// Only on Query and its matching reply.
    #[serde(
        default,
        rename = "query id",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<u64>,
}

/// A present `"value": null` is `Some(Value::Null)`, not an absent value.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    fn new(kind: EnvelopeKind, alias: &str) -> Self {
        Self {
            kind,
            alias: alias.to_string(),
            property: None,
            args: Vec::new(),
            value: None,
            qualifier: None,
            correlation_id: None,
        }
    }

    /// Init: construct (or confirm) `alias` as an object of `type_name`.
    pub fn init(alias: &str, type_name: &str, args: Vec<Value>) -> Self {
        Self {
            args,
            value: Some(Value::Text(type_name.to_string())),
            ..Self::new(EnvelopeKind::Init, alias)
        }
    }

    /// Acknowledgement of a successful Init.
    pub fn init_ack(alias: &str) -> Self {
        Self::new(EnvelopeKind::Update, alias)
    }

    pub fn command(alias: &str, property: &str, args: Vec<Value>) -> Self {
        Self {
            property: Some(property.to_string()),
            args,
            ..Self::new(EnvelopeKind::Command, alias)
        }
    }

    pub fn query(alias: &str, property: &str, args: Vec<Value>, correlation_id: u64) -> Self {
        Self {
            property: Some(property.to_string()),
            args,
            correlation_id: Some(correlation_id),
            ..Self::new(EnvelopeKind::Query, alias)
        }
    }

    /// An unsolicited state change or event.
    pub fn update(alias: &str, property: &str, value: Value) -> Self {
        Self {
            property: Some(property.to_string()),
            value: Some(value),
            ..Self::new(EnvelopeKind::Update, alias)
        }
    }

    /// Successful reply to a Query.
    pub fn reply(alias: &str, property: &str, value: Value, correlation_id: u64) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::update(alias, property, value)
        }
    }

    pub fn error(
        alias: &str,
        property: Option<&str>,
        args: Vec<Value>,
        code: ErrorCode,
        message: impl Into<String>,
        correlation_id: Option<u64>,
    ) -> Self {
        Self {
            property: property.map(str::to_string),
            args,
            value: Some(Value::Text(message.into())),
            qualifier: Some(ErrorDetail { code }),
            correlation_id,
            ..Self::new(EnvelopeKind::Error, alias)
        }
    }

    /// Object type carried by an Init.
    pub fn type_name(&self) -> Option<&str> {
        match self.kind {
            EnvelopeKind::Init => self.value.as_ref().and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.qualifier.as_ref().map(|q| q.code)
    }

    /// Message text of an Error envelope.
    pub fn error_message(&self) -> String {
        match &self.value {
            Some(Value::Text(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// An envelope tagged with its transport channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub channel: Channel,
    #[serde(flatten)]
    pub envelope: Envelope,
}

/// Link handshake messages, exchanged once before any frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Handshake {
    #[serde(rename = "hello")]
    Hello {
        node_id: String,
        node_name: String,
        protocol_version: u32,
        /// Random nonce for HMAC authentication.
        nonce: String,
        /// HMAC-SHA256(shared_secret, nonce + node_id).
        auth_hmac: String,
    },
    #[serde(rename = "hello_ack")]
    HelloAck {
        node_id: String,
        node_name: String,
        protocol_version: u32,
        nonce: String,
        auth_hmac: String,
    },
    #[serde(rename = "rejected")]
    Rejected { code: i32, message: String },
}

/// Encode an envelope to its canonical JSON bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(CodecError::Encode)
}

/// Decode canonical JSON bytes into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

/// Encode any framed message (4-byte big-endian length + JSON).
pub fn encode_framed<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(msg).map_err(CodecError::Encode)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Encode a channel-tagged envelope with its length prefix.
pub fn encode_frame(channel: Channel, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    encode_framed(&Frame {
        channel,
        envelope: envelope.clone(),
    })
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a frame body.
pub fn decode_frame(body: &[u8]) -> Result<Frame, CodecError> {
    serde_json::from_slice(body).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_wire_shape() {
        let env = Envelope::query("Relay1", "Power", vec![], 7);
        let json: serde_json::Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(json["type"], "query");
        assert_eq!(json["alias"], "Relay1");
        assert_eq!(json["property"], "Power");
        assert_eq!(json["query id"], 7);
        assert!(json["qualifier"].is_null());
        assert!(json.get("value").is_none());
    }

    #[test]
    fn test_init_has_no_property() {
        let env = Envelope::init("Serial2", "SerialPort", vec![Value::Int(9600)]);
        let json: serde_json::Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(json["type"], "init");
        assert!(json.get("property").is_none());
        assert_eq!(json["value"], "SerialPort");
        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(decoded.type_name(), Some("SerialPort"));
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_envelope_roundtrip_with_every_octet() {
        let all: Vec<u8> = (0..=255u8).collect();
        let env = Envelope::command(
            "IR1",
            "Send",
            vec![
                Value::Bytes(all),
                Value::Text("\u{00e9}\u{4e2d}".to_string()),
                Value::Float(1.5),
                Value::Bool(false),
                Value::Null,
            ],
        );
        assert_eq!(decode(&encode(&env).unwrap()).unwrap(), env);
    }

    #[test]
    fn test_null_value_is_preserved() {
        let env = Envelope::reply("Relay1", "Label", Value::Null, 3);
        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(decoded.value, Some(Value::Null));
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_error_roundtrip() {
        let env = Envelope::error(
            "Ghost9",
            Some("Power"),
            vec![],
            ErrorCode::ObjectMissing,
            "object does not exist",
            Some(11),
        );
        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(decoded.error_code(), Some(ErrorCode::ObjectMissing));
        assert_eq!(decoded.error_message(), "object does not exist");
        assert_eq!(decoded.correlation_id, Some(11));
        let json = String::from_utf8(encode(&env).unwrap()).unwrap();
        assert!(json.contains(r#""qualifier":{"code":"object_missing"}"#));
    }

    #[test]
    fn test_unknown_error_code_tolerated() {
        let decoded =
            decode(br#"{"type":"error","alias":"a","qualifier":{"code":"brand_new"}}"#).unwrap();
        assert_eq!(decoded.error_code(), Some(ErrorCode::Unknown));
    }

    #[test]
    fn test_malformed_input_is_decode_error() {
        let inputs: [&[u8]; 3] = [
            b"not json",
            br#"{"type":"bogus","alias":"a"}"#,
            br#"{"alias":"a"}"#,
        ];
        for bad in inputs {
            assert!(matches!(decode(bad), Err(CodecError::Decode(_))));
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let env = Envelope::update("Button3", "Pressed", Value::Bool(true));
        let bytes = encode_frame(4, &env).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let frame = decode_frame(&bytes[4..]).unwrap();
        assert_eq!(frame.channel, 4);
        assert_eq!(frame.envelope, env);
    }

    #[test]
    fn test_handshake_serialization() {
        let msg = Handshake::Hello {
            node_id: "node-a".to_string(),
            node_name: "bench".to_string(),
            protocol_version: PROTOCOL_VERSION,
            nonce: "n".to_string(),
            auth_hmac: "h".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""method":"hello""#));
        let decoded: Handshake = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
    }
}
