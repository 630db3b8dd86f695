//! # PHP Serialize Codec
//!
//! Purpose: Read and write the PHP `serialize()` text format carried under
//! the `__TC_SERIALIZED__` marker, so values shared with PHP clients decode
//! here and values JSON cannot hold still have a portable form.
//!
//! ## Design Principles
//! 1. **Byte Exact**: String lengths are byte counts, so the reader works on
//!    `&[u8]` and never assumes UTF-8 until a string is complete.
//! 2. **Arrays by Shape**: A PHP array with keys `0..n` in order is a list;
//!    anything else is a map with decimal keys for integer indices.
//! 3. **Bounded Input**: Nesting depth is capped and declared counts never
//!    size an allocation beyond what the input can hold.
//!
//! Objects decode as maps of their properties; references are rejected.

use std::collections::BTreeMap;

use tagcache_common::Value;

use crate::{ClientError, ClientResult};

const MAX_DEPTH: usize = 256;

/// Writes `value` in PHP `serialize()` form.
///
/// Empty maps are written as `stdClass` objects so they do not read back as
/// empty lists. `Bytes` become PHP byte strings.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"N;"),
        Value::Bool(v) => out.extend_from_slice(if *v { b"b:1;" } else { b"b:0;" }),
        Value::Int(v) => out.extend_from_slice(format!("i:{};", v).as_bytes()),
        Value::Float(v) => out.extend_from_slice(format!("d:{};", format_double(*v)).as_bytes()),
        Value::Str(v) => write_string(out, v.as_bytes()),
        Value::Bytes(v) => write_string(out, v),
        Value::List(items) => {
            out.extend_from_slice(format!("a:{}:{{", items.len()).as_bytes());
            for (idx, item) in items.iter().enumerate() {
                out.extend_from_slice(format!("i:{};", idx).as_bytes());
                write_value(out, item);
            }
            out.push(b'}');
        }
        Value::Map(entries) if entries.is_empty() => {
            out.extend_from_slice(b"O:8:\"stdClass\":0:{}");
        }
        Value::Map(entries) => {
            out.extend_from_slice(format!("a:{}:{{", entries.len()).as_bytes());
            for (key, item) in entries {
                write_string(out, key.as_bytes());
                write_value(out, item);
            }
            out.push(b'}');
        }
    }
}

fn write_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(format!("s:{}:\"", bytes.len()).as_bytes());
    out.extend_from_slice(bytes);
    out.extend_from_slice(b"\";");
}

fn format_double(v: f64) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v == f64::INFINITY {
        "INF".to_string()
    } else if v == f64::NEG_INFINITY {
        "-INF".to_string()
    } else {
        format!("{:?}", v)
    }
}

/// Parses one PHP-serialized value; trailing bytes are an error.
pub fn decode(data: &[u8]) -> ClientResult<Value> {
    let mut reader = Reader { data, pos: 0 };
    let value = reader.value(0)?;
    if reader.pos != data.len() {
        return Err(reader.error("trailing data"));
    }
    Ok(value)
}

enum Key {
    Int(i64),
    Str(String),
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn error(&self, what: &str) -> ClientError {
        ClientError::Serialization(format!("php payload: {} at byte {}", what, self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> ClientResult<()> {
        if self.peek() != Some(byte) {
            return Err(self.error(&format!("expected {:?}", byte as char)));
        }
        self.pos += 1;
        Ok(())
    }

    /// Returns the bytes up to `end` and steps past it.
    fn until(&mut self, end: u8) -> ClientResult<&'a str> {
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == end)
            .ok_or_else(|| self.error(&format!("missing {:?}", end as char)))?;
        let text = std::str::from_utf8(&rest[..len]).map_err(|_| self.error("non-ascii token"))?;
        self.pos += len + 1;
        Ok(text)
    }

    fn number<T: std::str::FromStr>(&mut self, end: u8) -> ClientResult<T> {
        let start = self.pos;
        let text = self.until(end)?;
        text.parse().map_err(|_| ClientError::Serialization(format!(
            "php payload: bad number {:?} at byte {}",
            text, start
        )))
    }

    fn take(&mut self, len: usize) -> ClientResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| self.error("string runs past end"))?;
        let data: &'a [u8] = self.data;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn string_body(&mut self) -> ClientResult<&'a [u8]> {
        let len: usize = self.number(b':')?;
        self.expect(b'"')?;
        let bytes = self.take(len)?;
        self.expect(b'"')?;
        Ok(bytes)
    }

    fn value(&mut self, depth: usize) -> ClientResult<Value> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        let tag = self.peek().ok_or_else(|| self.error("unexpected end"))?;
        self.pos += 1;
        match tag {
            b'N' => {
                self.expect(b';')?;
                Ok(Value::Null)
            }
            b'b' => {
                self.expect(b':')?;
                match self.until(b';')? {
                    "0" => Ok(Value::Bool(false)),
                    "1" => Ok(Value::Bool(true)),
                    _ => Err(self.error("bad boolean")),
                }
            }
            b'i' => {
                self.expect(b':')?;
                self.number(b';').map(Value::Int)
            }
            b'd' => {
                self.expect(b':')?;
                let float = match self.until(b';')? {
                    "INF" => f64::INFINITY,
                    "-INF" => f64::NEG_INFINITY,
                    "NAN" => f64::NAN,
                    text => text.parse().map_err(|_| self.error("bad double"))?,
                };
                Ok(Value::Float(float))
            }
            b's' => {
                self.expect(b':')?;
                let bytes = self.string_body()?;
                self.expect(b';')?;
                Ok(match std::str::from_utf8(bytes) {
                    Ok(text) => Value::Str(text.to_string()),
                    Err(_) => Value::Bytes(bytes.to_vec()),
                })
            }
            b'a' => {
                self.expect(b':')?;
                let count: usize = self.number(b':')?;
                self.expect(b'{')?;
                let value = self.array(count, depth)?;
                self.expect(b'}')?;
                Ok(value)
            }
            b'O' => {
                self.expect(b':')?;
                self.string_body()?;
                self.expect(b':')?;
                let count: usize = self.number(b':')?;
                self.expect(b'{')?;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let key = self.key()?;
                    entries.insert(key_string(key), self.value(depth + 1)?);
                }
                self.expect(b'}')?;
                Ok(Value::Map(entries))
            }
            other => Err(ClientError::Serialization(format!(
                "php payload: unsupported type {:?} at byte {}",
                other as char,
                self.pos - 1
            ))),
        }
    }

    fn key(&mut self) -> ClientResult<Key> {
        match self.peek() {
            Some(b'i') => {
                self.pos += 1;
                self.expect(b':')?;
                self.number(b';').map(Key::Int)
            }
            Some(b's') => {
                self.pos += 1;
                self.expect(b':')?;
                let bytes = self.string_body()?;
                self.expect(b';')?;
                std::str::from_utf8(bytes)
                    .map(|key| Key::Str(key.to_string()))
                    .map_err(|_| self.error("map key is not utf-8"))
            }
            _ => Err(self.error("expected array key")),
        }
    }

    fn array(&mut self, count: usize, depth: usize) -> ClientResult<Value> {
        let mut entries = Vec::with_capacity(count.min(self.data.len() - self.pos));
        for _ in 0..count {
            let key = self.key()?;
            entries.push((key, self.value(depth + 1)?));
        }
        let sequential = entries
            .iter()
            .enumerate()
            .all(|(idx, (key, _))| matches!(key, Key::Int(i) if *i == idx as i64));
        if sequential {
            return Ok(Value::List(entries.into_iter().map(|(_, v)| v).collect()));
        }
        Ok(Value::Map(
            entries
                .into_iter()
                .map(|(key, v)| (key_string(key), v))
                .collect(),
        ))
    }
}

fn key_string(key: Key) -> String {
    match key {
        Key::Int(i) => i.to_string(),
        Key::Str(s) => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_php_arrays_as_lists_or_maps() {
        let map = decode(br#"a:1:{s:4:"name";s:1:"A";}"#).unwrap();
        assert_eq!(map, Value::map([("name", "A")]));

        let list = decode(br#"a:3:{i:0;i:1;i:1;d:0.5;i:2;N;}"#).unwrap();
        assert_eq!(
            list,
            Value::List(vec![Value::Int(1), Value::Float(0.5), Value::Null])
        );

        let sparse = decode(br#"a:2:{i:0;b:1;i:5;b:0;}"#).unwrap();
        assert_eq!(sparse, Value::map([("0", true), ("5", false)]));
    }

    #[test]
    fn string_lengths_count_bytes() {
        let value = decode("s:5:\"ünï\";".as_bytes()).unwrap();
        assert_eq!(value, Value::from("ünï"));
        let binary = decode(b"s:2:\"\xff\x00\";").unwrap();
        assert_eq!(binary, Value::bytes(vec![0xff, 0x00]));
    }

    #[test]
    fn non_finite_doubles_survive() {
        let value = Value::List(vec![Value::Float(f64::INFINITY), Value::Float(f64::NEG_INFINITY)]);
        let text = encode(&value);
        assert_eq!(text, b"a:2:{i:0;d:INF;i:1;d:-INF;}".to_vec());
        assert_eq!(decode(&text).unwrap(), value);
        assert!(matches!(decode(b"d:NAN;").unwrap(), Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn objects_and_empty_maps_read_as_maps() {
        let empty = Value::Map(BTreeMap::new());
        assert_eq!(decode(&encode(&empty)).unwrap(), empty);
        let object = decode(br#"O:8:"stdClass":1:{s:1:"x";i:3;}"#).unwrap();
        assert_eq!(object, Value::map([("x", 3)]));
    }

    #[test]
    fn malformed_input_is_rejected() {
        let bad_inputs: [&[u8]; 6] = [
            b"s:10:\"short\";",
            b"a:1:{i:0;",
            b"i:12",
            b"r:1;",
            b"N;N;",
            b"a:99999999999:{}",
        ];
        for bad in bad_inputs {
            let err = decode(bad).unwrap_err();
            assert!(matches!(err, ClientError::Serialization(_)), "{:?}", bad);
        }
        let deep = "a:1:{i:0;".repeat(MAX_DEPTH + 2);
        assert!(decode(deep.as_bytes()).is_err());
    }
}
