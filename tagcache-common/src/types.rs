//! # Value Model and Identifiers
//!
//! Core data types shared by every TagCache transport.
//!
//! ## Design Principles
//!
//! 1. **Tagged Union Payloads**: Cached values are a closed `Value` enum so
//!    codecs handle every shape exhaustively.
//! 2. **Natural Encoding**: `Value` serializes as the plain data it holds (a
//!    map is a map, a string is a string), so payloads written by other
//!    clients decode without a Rust-specific envelope.
//! 3. **Wire-Safe Identifiers**: Keys and tags are validated before any I/O,
//!    because TAB, CR, LF and `,` are framing characters on the wire.
//! 4. **Server Stats as Data**: `Stats` deserializes from both the TCP reply and
//!    the HTTP `/stats` body; extended fields are optional.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{TagCacheError, TagCacheResult};

/// A value stored in the cache.
///
/// `Null` is a real stored value and is distinct from a miss.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Builds a binary value.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(data.into())
    }

    /// Builds a map value from key/value pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns true for scalar variants (everything except lists and maps).
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Map(_))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Str(v) => serializer.serialize_str(v),
            Value::Bytes(v) => serializer.serialize_bytes(v),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a cache value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    // Integers beyond i64 keep their magnitude as floats.
    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(i64::try_from(v).map_or(Value::Float(v as f64), Value::Int))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((MapKey(key), value)) = map.next_entry()? {
            entries.insert(key, value);
        }
        Ok(Value::Map(entries))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Map keys from other writers may be integers; they become decimal strings.
struct MapKey(String);

struct MapKeyVisitor;

impl<'de> Visitor<'de> for MapKeyVisitor {
    type Value = MapKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string or integer map key")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<MapKey, E> {
        Ok(MapKey(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<MapKey, E> {
        Ok(MapKey(v.to_string()))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<MapKey, E> {
        Ok(MapKey(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<MapKey, E> {
        Ok(MapKey(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<MapKey, E> {
        std::str::from_utf8(v)
            .map(|key| MapKey(key.to_string()))
            .map_err(|_| E::invalid_value(de::Unexpected::Bytes(v), &self))
    }
}

impl<'de> Deserialize<'de> for MapKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MapKeyVisitor)
    }
}

/// Server counters as returned by `STATS` / `GET /stats`.
///
/// The TCP reply only carries the first five fields; the rest are filled by
/// the HTTP endpoint when available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub invalidations: u64,
    pub hit_ratio: f64,
    pub items: Option<u64>,
    pub bytes: Option<u64>,
    pub tags: Option<u64>,
    pub shard_count: Option<u64>,
    pub shard_items: Option<Vec<u64>>,
    pub shard_bytes: Option<Vec<u64>>,
}

/// Validates a cache key.
///
/// # Errors
/// Returns `TagCacheError::InvalidArgument` for empty keys or keys containing
/// TAB, CR, LF or `,` (keys travel inside comma-separated lists).
pub fn validate_key(key: &str) -> TagCacheResult<()> {
    validate_field("key", key)
}

/// Validates a tag name; same rules as keys.
pub fn validate_tag(tag: &str) -> TagCacheResult<()> {
    validate_field("tag", tag)
}

fn validate_field(kind: &str, value: &str) -> TagCacheResult<()> {
    if value.is_empty() {
        return Err(TagCacheError::InvalidArgument(format!("{} must not be empty", kind)));
    }
    if let Some(bad) = value.chars().find(|c| matches!(c, '\t' | '\r' | '\n' | ',')) {
        return Err(TagCacheError::InvalidArgument(format!(
            "{} {:?} contains reserved character {:?}",
            kind, value, bad
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_none_becomes_null() {
        let missing: Option<i64> = None;
        assert_eq!(Value::from(missing), Value::Null);
        assert_eq!(Value::from(Some("a")), Value::Str("a".into()));
    }

    #[test]
    fn map_builder_converts_entries() {
        let value = Value::map([("name", "A")]);
        let mut expected = BTreeMap::new();
        expected.insert("name".to_string(), Value::Str("A".into()));
        assert_eq!(value, Value::Map(expected));
        assert!(!value.is_scalar());
    }

    #[test]
    fn keys_reject_framing_characters() {
        assert!(validate_key("user:1").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a\tb").is_err());
        assert!(validate_key("a\nb").is_err());
        assert!(validate_key("a,b").is_err());
    }

    #[test]
    fn tags_follow_key_rules() {
        assert!(validate_tag("users").is_ok());
        let err = validate_tag("a,b").unwrap_err();
        assert!(matches!(err, TagCacheError::InvalidArgument(_)));
        assert!(err.to_string().contains("tag"));
    }

    #[test]
    fn values_serialize_as_plain_data() {
        let value = Value::map([
            ("name", Value::from("A")),
            ("ids", Value::List(vec![Value::Int(1), Value::Float(2.5), Value::Null])),
        ]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"ids":[1,2.5,null],"name":"A"}"#);
        assert_eq!(serde_json::from_str::<Value>(&json).unwrap(), value);
    }

    #[test]
    fn foreign_map_keys_and_large_integers_decode() {
        let value: Value = serde_json::from_str(r#"{"7":true,"big":18446744073709551615}"#).unwrap();
        let Value::Map(entries) = value else {
            panic!("expected a map");
        };
        assert_eq!(entries["7"], Value::Bool(true));
        assert_eq!(entries["big"], Value::Float(u64::MAX as f64));
    }

    #[test]
    fn stats_tolerates_partial_bodies() {
        let stats = Stats {
            hits: 3,
            ..Stats::default()
        };
        assert_eq!(stats.items, None);
        assert_eq!(stats.hits, 3);
    }
}
