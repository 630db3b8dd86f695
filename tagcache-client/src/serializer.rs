//! # Payload Serializer
//!
//! Purpose: Turn `Value`s into single-line payload strings and back, using
//! one of the codecs compiled into this build.
//!
//! ## Design Principles
//! 1. **Marker-Driven Decoding**: Every non-trivial payload starts with a
//!    `__TC_*__` marker, so any client can decode what another one wrote.
//! 2. **Explicit Is Fatal, Unknown Is Native**: Asking for a codec that is
//!    not compiled in fails; a name nobody recognises falls back to native.
//! 3. **Wire Safety**: Output never contains TAB, CR or LF.
//!
//! ## Payload Forms
//! - `Null`, `true`, `false`: `__TC_NULL__`, `__TC_TRUE__`, `__TC_FALSE__`.
//! - native: integers in decimal, floats in a form that never parses as an
//!   integer, plain strings inline. Other values go as
//!   `__TC_JSON__<base64>` holding plain JSON, unless they contain bytes or
//!   non-finite floats; those use `__TC_SERIALIZED__<base64>` in PHP
//!   `serialize()` form. Binary data read back through that form is `Str`
//!   when it happens to be valid UTF-8.
//! - msgpack: `__TC_MSGPACK__<base64>` holding plain MessagePack.
//! - igbinary: `__TC_IGBINARY__<base64>` holding a bincode image.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::warn;

use tagcache_common::Value;

use crate::php;
use crate::{ClientError, ClientResult};

pub const NULL_MARKER: &str = "__TC_NULL__";
pub const TRUE_MARKER: &str = "__TC_TRUE__";
pub const FALSE_MARKER: &str = "__TC_FALSE__";
pub const JSON_MARKER: &str = "__TC_JSON__";
pub const MSGPACK_MARKER: &str = "__TC_MSGPACK__";
pub const IGBINARY_MARKER: &str = "__TC_IGBINARY__";
/// PHP `serialize()` text, base64 wrapped.
pub const PHP_SERIALIZED_MARKER: &str = "__TC_SERIALIZED__";

const MARKER_PREFIX: &str = "__TC_";

/// Codec identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerializerKind {
    Native,
    Msgpack,
    Igbinary,
}

impl SerializerKind {
    pub fn name(self) -> &'static str {
        match self {
            SerializerKind::Native => "native",
            SerializerKind::Msgpack => "msgpack",
            SerializerKind::Igbinary => "igbinary",
        }
    }

    /// Whether the codec is compiled into this build.
    pub fn is_available(self) -> bool {
        match self {
            SerializerKind::Native => true,
            SerializerKind::Msgpack => cfg!(feature = "msgpack"),
            SerializerKind::Igbinary => cfg!(feature = "igbinary"),
        }
    }

    fn feature(self) -> &'static str {
        match self {
            SerializerKind::Native => "",
            SerializerKind::Msgpack => "msgpack",
            SerializerKind::Igbinary => "igbinary",
        }
    }
}

impl fmt::Display for SerializerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolves a configured codec name to the codec that will be used.
///
/// # Errors
/// `Configuration` when `msgpack` or `igbinary` is requested but its feature
/// is not compiled in. Unknown names resolve to `Native` with a warning.
pub fn validate(preferred: &str) -> ClientResult<SerializerKind> {
    let kind = match preferred.trim().to_ascii_lowercase().as_str() {
        "native" => SerializerKind::Native,
        "msgpack" => SerializerKind::Msgpack,
        "igbinary" => SerializerKind::Igbinary,
        _ => {
            warn!(requested = preferred, "unknown serializer, using native");
            return Ok(SerializerKind::Native);
        }
    };
    if !kind.is_available() {
        return Err(ClientError::Configuration(format!(
            "serializer '{}' requested but not available; rebuild with the `{}` feature",
            kind,
            kind.feature()
        )));
    }
    Ok(kind)
}

/// Encodes and decodes payloads with a negotiated codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Serializer {
    kind: SerializerKind,
}

impl Default for Serializer {
    fn default() -> Self {
        Serializer {
            kind: SerializerKind::Native,
        }
    }
}

impl Serializer {
    /// Negotiates the codec for a configured name; see [`validate`].
    pub fn negotiate(preferred: &str) -> ClientResult<Self> {
        validate(preferred).map(|kind| Serializer { kind })
    }

    pub fn kind(&self) -> SerializerKind {
        self.kind
    }

    pub fn serialize(&self, value: &Value) -> ClientResult<String> {
        match value {
            Value::Null => return Ok(NULL_MARKER.to_string()),
            Value::Bool(true) => return Ok(TRUE_MARKER.to_string()),
            Value::Bool(false) => return Ok(FALSE_MARKER.to_string()),
            _ => {}
        }
        match self.kind {
            SerializerKind::Native => native_encode(value),
            SerializerKind::Msgpack => msgpack_encode(value),
            SerializerKind::Igbinary => igbinary_encode(value),
        }
    }

    /// Decodes any marker this build understands, regardless of `kind`.
    pub fn deserialize(&self, payload: &str) -> ClientResult<Value> {
        match payload {
            "" => return Ok(Value::Str(String::new())),
            NULL_MARKER => return Ok(Value::Null),
            TRUE_MARKER => return Ok(Value::Bool(true)),
            FALSE_MARKER => return Ok(Value::Bool(false)),
            _ => {}
        }
        if let Some(body) = payload.strip_prefix(JSON_MARKER) {
            let bytes = decode_base64(JSON_MARKER, body)?;
            return serde_json::from_slice(&bytes)
                .map_err(|err| ClientError::Serialization(format!("json payload: {}", err)));
        }
        if let Some(body) = payload.strip_prefix(MSGPACK_MARKER) {
            return msgpack_decode(body);
        }
        if let Some(body) = payload.strip_prefix(IGBINARY_MARKER) {
            return igbinary_decode(body);
        }
        if let Some(body) = payload.strip_prefix(PHP_SERIALIZED_MARKER) {
            // Older writers left the serialize() text unwrapped.
            return match BASE64.decode(body) {
                Ok(bytes) => php::decode(&bytes),
                Err(_) => php::decode(body.as_bytes()),
            };
        }
        if let Ok(int) = payload.parse::<i64>() {
            return Ok(Value::Int(int));
        }
        if let Ok(float) = payload.parse::<f64>() {
            return Ok(Value::Float(float));
        }
        Ok(Value::Str(payload.to_string()))
    }
}

fn native_encode(value: &Value) -> ClientResult<String> {
    match value {
        Value::Int(int) => Ok(int.to_string()),
        Value::Float(float) => Ok(format_float(*float)),
        Value::Str(text) if is_inline_safe(text) => Ok(text.clone()),
        _ if fits_json(value) => {
            let json = serde_json::to_vec(value)
                .map_err(|err| ClientError::Serialization(format!("json payload: {}", err)))?;
            Ok(format!("{}{}", JSON_MARKER, BASE64.encode(json)))
        }
        _ => Ok(format!("{}{}", PHP_SERIALIZED_MARKER, BASE64.encode(php::encode(value)))),
    }
}

/// JSON has no bytes and no infinities or NaN.
fn fits_json(value: &Value) -> bool {
    match value {
        Value::Float(float) => float.is_finite(),
        Value::Bytes(_) => false,
        Value::List(items) => items.iter().all(fits_json),
        Value::Map(entries) => entries.values().all(fits_json),
        _ => true,
    }
}

fn format_float(float: f64) -> String {
    let text = format!("{:?}", float);
    if text.parse::<i64>().is_ok() {
        format!("{}.0", text)
    } else {
        text
    }
}

/// A string can travel bare if decoding it yields the same string.
fn is_inline_safe(text: &str) -> bool {
    !text.contains(['\t', '\r', '\n'])
        && !text.starts_with(MARKER_PREFIX)
        && text.parse::<i64>().is_err()
        && text.parse::<f64>().is_err()
        && serde_json::from_str::<serde_json::Value>(text).is_err()
}

fn decode_base64(marker: &str, body: &str) -> ClientResult<Vec<u8>> {
    BASE64
        .decode(body)
        .map_err(|err| ClientError::Serialization(format!("{} payload: {}", marker, err)))
}

#[cfg(feature = "msgpack")]
fn msgpack_encode(value: &Value) -> ClientResult<String> {
    let bytes = rmp_serde::to_vec(value)
        .map_err(|err| ClientError::Serialization(format!("msgpack encode: {}", err)))?;
    Ok(format!("{}{}", MSGPACK_MARKER, BASE64.encode(bytes)))
}

#[cfg(feature = "msgpack")]
fn msgpack_decode(body: &str) -> ClientResult<Value> {
    let bytes = decode_base64(MSGPACK_MARKER, body)?;
    rmp_serde::from_slice(&bytes)
        .map_err(|err| ClientError::Serialization(format!("msgpack decode: {}", err)))
}

#[cfg(not(feature = "msgpack"))]
fn msgpack_encode(_value: &Value) -> ClientResult<String> {
    Err(unavailable(SerializerKind::Msgpack))
}

#[cfg(not(feature = "msgpack"))]
fn msgpack_decode(_body: &str) -> ClientResult<Value> {
    Err(unavailable(SerializerKind::Msgpack))
}

/// bincode cannot drive a self-describing format, so the igbinary codec
/// writes this tagged mirror of `Value`.
#[cfg(feature = "igbinary")]
#[derive(serde::Serialize, serde::Deserialize)]
enum Compact {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Compact>),
    Map(Vec<(String, Compact)>),
}

#[cfg(feature = "igbinary")]
impl From<&Value> for Compact {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Compact::Null,
            Value::Bool(v) => Compact::Bool(*v),
            Value::Int(v) => Compact::Int(*v),
            Value::Float(v) => Compact::Float(*v),
            Value::Str(v) => Compact::Str(v.clone()),
            Value::Bytes(v) => Compact::Bytes(v.clone()),
            Value::List(items) => Compact::List(items.iter().map(Compact::from).collect()),
            Value::Map(entries) => Compact::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Compact::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(feature = "igbinary")]
impl From<Compact> for Value {
    fn from(value: Compact) -> Self {
        match value {
            Compact::Null => Value::Null,
            Compact::Bool(v) => Value::Bool(v),
            Compact::Int(v) => Value::Int(v),
            Compact::Float(v) => Value::Float(v),
            Compact::Str(v) => Value::Str(v),
            Compact::Bytes(v) => Value::Bytes(v),
            Compact::List(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Compact::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(feature = "igbinary")]
fn igbinary_encode(value: &Value) -> ClientResult<String> {
    let bytes = bincode::serialize(&Compact::from(value))
        .map_err(|err| ClientError::Serialization(format!("igbinary encode: {}", err)))?;
    Ok(format!("{}{}", IGBINARY_MARKER, BASE64.encode(bytes)))
}

#[cfg(feature = "igbinary")]
fn igbinary_decode(body: &str) -> ClientResult<Value> {
    let bytes = decode_base64(IGBINARY_MARKER, body)?;
    bincode::deserialize::<Compact>(&bytes)
        .map(Value::from)
        .map_err(|err| ClientError::Serialization(format!("igbinary decode: {}", err)))
}

#[cfg(not(feature = "igbinary"))]
fn igbinary_encode(_value: &Value) -> ClientResult<String> {
    Err(unavailable(SerializerKind::Igbinary))
}

#[cfg(not(feature = "igbinary"))]
fn igbinary_decode(_body: &str) -> ClientResult<Value> {
    Err(unavailable(SerializerKind::Igbinary))
}

#[cfg(any(not(feature = "msgpack"), not(feature = "igbinary")))]
fn unavailable(kind: SerializerKind) -> ClientError {
    ClientError::Serialization(format!("payload uses the {} codec, which is not compiled in", kind))
}
