//! # Transport Abstraction
//!
//! Purpose: Decouple the client facade from the wire. A transport moves
//! already-serialized payload strings; it never sees `Value`s.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `TcpTransport` and `HttpTransport` are
//!    interchangeable behind `Arc<dyn Transport>`.
//! 2. **Optional Capabilities**: Operations only one wire offers default to
//!    `ClientError::Unsupported`.
//! 3. **Thread Safety**: `Send + Sync`, so one client is shared across threads.

use serde::{Deserialize, Serialize};

use tagcache_common::Stats;

use crate::pool::PoolHealth;
use crate::{ClientError, ClientResult};

/// One entry of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEntry {
    pub key: String,
    pub payload: String,
    pub tags: Vec<String>,
    pub ttl_ms: Option<u64>,
}

/// Filters for `search`. Empty fields are omitted from the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Substring match on the key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_any: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_all: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Key metadata returned by `search`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub key: String,
    /// Remaining TTL, if the key has one.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_ms: Option<u64>,
}

/// Bearer token issued by `login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginToken {
    pub token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Credentials issued by `rotate_credentials`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Liveness as seen by one transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportHealth {
    pub transport: &'static str,
    pub reachable: bool,
    /// Pool statistics; TCP only.
    pub pool: Option<PoolHealth>,
    /// Server-reported status or the health-check error.
    pub detail: Option<String>,
}

/// A wire the client can speak.
pub trait Transport: Send + Sync {
    /// Short name used in logs and `Unsupported` errors.
    fn name(&self) -> &'static str;

    fn put(&self, key: &str, payload: &str, tags: &[String], ttl_ms: Option<u64>) -> ClientResult<()>;

    /// Returns `None` on a miss.
    fn get(&self, key: &str) -> ClientResult<Option<String>>;

    fn delete(&self, key: &str) -> ClientResult<bool>;

    /// Returns `(key, payload)` for present keys, in request order.
    fn bulk_get(&self, keys: &[String]) -> ClientResult<Vec<(String, String)>>;

    /// Returns how many entries were stored.
    fn bulk_put(&self, entries: &[PayloadEntry]) -> ClientResult<usize>;

    /// Returns how many keys existed and were removed.
    fn bulk_delete(&self, keys: &[String]) -> ClientResult<usize>;

    fn invalidate_tag(&self, tag: &str) -> ClientResult<u64>;

    fn invalidate_tags_any(&self, tags: &[String]) -> ClientResult<u64>;

    fn invalidate_tags_all(&self, tags: &[String]) -> ClientResult<u64>;

    fn invalidate_keys(&self, keys: &[String]) -> ClientResult<u64>;

    fn keys_by_tag(&self, tag: &str, limit: Option<usize>) -> ClientResult<Vec<String>>;

    fn stats(&self) -> ClientResult<Stats>;

    /// Removes every entry; returns how many were removed.
    fn flush(&self) -> ClientResult<u64>;

    /// Probes the server once, without retries.
    fn health(&self) -> TransportHealth;

    fn search(&self, _params: &SearchParams) -> ClientResult<Vec<SearchHit>> {
        Err(self.unsupported("search"))
    }

    fn login(&self, _username: &str, _password: &str) -> ClientResult<LoginToken> {
        Err(self.unsupported("login"))
    }

    fn rotate_credentials(&self) -> ClientResult<Credentials> {
        Err(self.unsupported("rotate_credentials"))
    }

    /// Releases network resources. Later calls fail.
    fn close(&self) {}

    fn unsupported(&self, operation: &'static str) -> ClientError {
        ClientError::Unsupported {
            operation,
            transport: self.name(),
        }
    }
}
