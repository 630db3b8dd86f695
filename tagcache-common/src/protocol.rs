//! # Line Protocol Encoding and Parsing
//!
//! Purpose: Frame client commands into the tab-separated TCP protocol and
//! parse single-line server replies.
//!
//! ## Design Principles
//! 1. **Borrowed Commands**: `Command` borrows keys, tags and payloads from
//!    the caller, so framing a pipeline allocates only the output buffer.
//! 2. **Buffer Reuse**: Callers pass the write buffer and the line buffer.
//! 3. **Bounded Reads**: A reply line longer than `MAX_LINE_LEN` is rejected
//!    instead of growing the buffer without limit.
//! 4. **Fail Fast**: Unknown verbs, bad numbers and mismatched replies are
//!    protocol errors.

use std::io::{BufRead, Read};

use crate::error::{TagCacheError, TagCacheResult};
use crate::types::{validate_key, validate_tag, Stats};

/// Longest reply line accepted, excluding the newline.
pub const MAX_LINE_LEN: usize = 64 * 1024 * 1024;

/// Placeholder for an absent TTL or an empty tag list.
pub const EMPTY_FIELD: &str = "-";

/// A request frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command<'a> {
    Get(&'a str),
    Put {
        key: &'a str,
        ttl_ms: Option<u64>,
        tags: &'a [String],
        payload: &'a str,
    },
    Del(&'a str),
    InvTag(&'a str),
    InvTagsAny(&'a [String]),
    InvTagsAll(&'a [String]),
    InvKeys(&'a [String]),
    KeysByTag(&'a str),
    Stats,
    Flush,
}

/// Verbs that answer with a bare count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountKind {
    InvTag,
    InvTagsAny,
    InvTagsAll,
    InvKeys,
    Flush,
}

impl CountKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CountKind::InvTag => "INV_TAG",
            CountKind::InvTagsAny => "INV_TAGS_ANY",
            CountKind::InvTagsAll => "INV_TAGS_ALL",
            CountKind::InvKeys => "INV_KEYS",
            CountKind::Flush => "FLUSH",
        }
    }

    fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "INV_TAG" => Some(CountKind::InvTag),
            "INV_TAGS_ANY" => Some(CountKind::InvTagsAny),
            "INV_TAGS_ALL" => Some(CountKind::InvTagsAll),
            "INV_KEYS" => Some(CountKind::InvKeys),
            "FLUSH" => Some(CountKind::Flush),
            _ => None,
        }
    }
}

/// A parsed reply line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    /// `VALUE\t<payload>`; the payload may be empty.
    Value(String),
    NotFound,
    Deleted(bool),
    Count(CountKind, u64),
    Keys(Vec<String>),
    Stats(Stats),
    /// `ERR <reason>`.
    Error(String),
}

impl<'a> Command<'a> {
    /// Verb written at the start of the frame.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Get(_) => "GET",
            Command::Put { .. } => "PUT",
            Command::Del(_) => "DEL",
            Command::InvTag(_) => "INV_TAG",
            Command::InvTagsAny(_) => "INV_TAGS_ANY",
            Command::InvTagsAll(_) => "INV_TAGS_ALL",
            Command::InvKeys(_) => "INV_KEYS",
            Command::KeysByTag(_) => "KEYS_BY_TAG",
            Command::Stats => "STATS",
            Command::Flush => "FLUSH",
        }
    }

    /// Checks that every field can be framed.
    pub fn validate(&self) -> TagCacheResult<()> {
        match self {
            Command::Get(key) | Command::Del(key) => validate_key(key),
            Command::Put {
                key, tags, payload, ..
            } => {
                validate_key(key)?;
                tags.iter().try_for_each(|t| validate_tag(t))?;
                if payload.contains(['\r', '\n']) {
                    return Err(TagCacheError::InvalidArgument(format!(
                        "payload for {:?} contains a line break",
                        key
                    )));
                }
                Ok(())
            }
            Command::InvTag(tag) | Command::KeysByTag(tag) => validate_tag(tag),
            Command::InvTagsAny(tags) | Command::InvTagsAll(tags) => {
                non_empty_list("tag", tags)?;
                tags.iter().try_for_each(|t| validate_tag(t))
            }
            Command::InvKeys(keys) => {
                non_empty_list("key", keys)?;
                keys.iter().try_for_each(|k| validate_key(k))
            }
            Command::Stats | Command::Flush => Ok(()),
        }
    }

    /// Appends the frame, including the trailing newline, to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.verb().as_bytes());
        match self {
            Command::Get(field)
            | Command::Del(field)
            | Command::InvTag(field)
            | Command::KeysByTag(field) => {
                out.push(b'\t');
                out.extend_from_slice(field.as_bytes());
            }
            Command::Put {
                key,
                ttl_ms,
                tags,
                payload,
            } => {
                out.push(b'\t');
                out.extend_from_slice(key.as_bytes());
                out.push(b'\t');
                match ttl_ms {
                    Some(ms) if *ms > 0 => push_u64(out, *ms),
                    _ => out.extend_from_slice(EMPTY_FIELD.as_bytes()),
                }
                out.push(b'\t');
                push_list(out, tags);
                out.push(b'\t');
                out.extend_from_slice(payload.as_bytes());
            }
            Command::InvTagsAny(items) | Command::InvTagsAll(items) | Command::InvKeys(items) => {
                out.push(b'\t');
                push_list(out, items);
            }
            Command::Stats | Command::Flush => {}
        }
        out.push(b'\n');
    }

    /// Returns true when `reply` is a legal answer to this command.
    ///
    /// `Reply::Error` is legal for every command.
    pub fn accepts(&self, reply: &Reply) -> bool {
        match (self, reply) {
            (_, Reply::Error(_)) => true,
            (Command::Get(_), Reply::Value(_) | Reply::NotFound) => true,
            (Command::Put { .. }, Reply::Ok) => true,
            (Command::Del(_), Reply::Deleted(_)) => true,
            (Command::KeysByTag(_), Reply::Keys(_)) => true,
            (Command::Stats, Reply::Stats(_)) => true,
            (_, Reply::Count(kind, _)) => self.count_kind() == Some(*kind),
            _ => false,
        }
    }

    fn count_kind(&self) -> Option<CountKind> {
        match self {
            Command::InvTag(_) => Some(CountKind::InvTag),
            Command::InvTagsAny(_) => Some(CountKind::InvTagsAny),
            Command::InvTagsAll(_) => Some(CountKind::InvTagsAll),
            Command::InvKeys(_) => Some(CountKind::InvKeys),
            Command::Flush => Some(CountKind::Flush),
            _ => None,
        }
    }
}

/// Reads and parses one reply line.
pub fn read_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> TagCacheResult<Reply> {
    read_line(reader, line_buf)?;
    let line = std::str::from_utf8(line_buf)
        .map_err(|_| TagCacheError::protocol("reply is not valid UTF-8"))?;
    parse_reply(line)
}

/// Parses a reply line with the newline already stripped.
pub fn parse_reply(line: &str) -> TagCacheResult<Reply> {
    match line {
        "OK" => return Ok(Reply::Ok),
        "NF" => return Ok(Reply::NotFound),
        "DEL ok" => return Ok(Reply::Deleted(true)),
        "DEL nf" => return Ok(Reply::Deleted(false)),
        "ERR" => return Ok(Reply::Error(String::new())),
        "KEYS" => return Ok(Reply::Keys(Vec::new())),
        _ => {}
    }
    if let Some(reason) = line.strip_prefix("ERR ") {
        return Ok(Reply::Error(reason.to_string()));
    }

    let (verb, rest) = line
        .split_once('\t')
        .ok_or_else(|| TagCacheError::protocol(format!("unexpected reply {:?}", truncate(line))))?;
    match verb {
        "VALUE" => Ok(Reply::Value(rest.to_string())),
        "KEYS" => Ok(Reply::Keys(
            rest.split(',')
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        "STATS" => parse_stats(rest).map(Reply::Stats),
        _ => match CountKind::from_verb(verb) {
            Some(kind) => Ok(Reply::Count(kind, parse_number(rest)?)),
            None => Err(TagCacheError::protocol(format!(
                "unknown reply verb {:?}",
                truncate(verb)
            ))),
        },
    }
}

fn parse_stats(rest: &str) -> TagCacheResult<Stats> {
    let fields: Vec<&str> = rest.split('\t').collect();
    if fields.len() != 5 {
        return Err(TagCacheError::protocol(format!(
            "STATS reply has {} fields, expected 5",
            fields.len()
        )));
    }
    let hit_ratio = fields[4]
        .parse::<f64>()
        .map_err(|_| TagCacheError::protocol(format!("invalid hit ratio {:?}", fields[4])))?;
    Ok(Stats {
        hits: parse_number(fields[0])?,
        misses: parse_number(fields[1])?,
        puts: parse_number(fields[2])?,
        invalidations: parse_number(fields[3])?,
        hit_ratio,
        ..Stats::default()
    })
}

fn parse_number(field: &str) -> TagCacheResult<u64> {
    field
        .parse::<u64>()
        .map_err(|_| TagCacheError::protocol(format!("invalid count {:?}", truncate(field))))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> TagCacheResult<()> {
    buf.clear();
    let limit = MAX_LINE_LEN as u64 + 2;
    let bytes = reader.by_ref().take(limit).read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(TagCacheError::protocol("connection closed by server"));
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() as u64 >= limit {
            return Err(TagCacheError::protocol("reply line exceeds 64 MiB"));
        }
        return Err(TagCacheError::protocol("truncated reply line"));
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if buf.len() > MAX_LINE_LEN {
        return Err(TagCacheError::protocol("reply line exceeds 64 MiB"));
    }
    Ok(())
}

fn non_empty_list(kind: &str, items: &[String]) -> TagCacheResult<()> {
    if items.is_empty() {
        return Err(TagCacheError::InvalidArgument(format!("{} list must not be empty", kind)));
    }
    Ok(())
}

fn push_list(out: &mut Vec<u8>, items: &[String]) {
    if items.is_empty() {
        out.extend_from_slice(EMPTY_FIELD.as_bytes());
        return;
    }
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            out.push(b',');
        }
        out.extend_from_slice(item.as_bytes());
    }
}

fn push_u64(out: &mut Vec<u8>, mut value: u64) {
    let mut digits = [0u8; 20];
    let mut len = 0;
    loop {
        digits[len] = b'0' + (value % 10) as u8;
        len += 1;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    digits[..len].reverse();
    out.extend_from_slice(&digits[..len]);
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(64) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
