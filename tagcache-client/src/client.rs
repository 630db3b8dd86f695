//! # TagCache Client API
//!
//! Purpose: Expose a compact, blocking API over a TagCache server: typed
//! values in, typed values out, with tags, TTLs and bulk operations.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `TagCacheClient` hides serialization, pooling,
//!    retries and the choice of wire.
//! 2. **Fail Fast**: Bad configuration, keys and tags are rejected before
//!    any socket is opened.
//! 3. **Misses Are Typed**: `get` reports a miss as `NotFound`; `get_opt`
//!    returns `None`. A stored `Null` is a hit.
//! 4. **Explicit Instances**: No globals; callers own and share the client.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use tagcache_common::{validate_key, validate_tag, Stats, Value};

use crate::config::{ClientConfig, TransportMode};
use crate::http::HttpTransport;
use crate::local::LocalCache;
use crate::pool::PoolHealth;
use crate::serializer::{Serializer, SerializerKind};
use crate::tcp::TcpTransport;
use crate::transport::{
    Credentials, LoginToken, PayloadEntry, SearchHit, SearchParams, Transport,
};
use crate::{ClientError, ClientResult};

/// Snapshot returned by `TagCacheClient::health`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub transport: &'static str,
    pub serializer: &'static str,
    pub pool: Option<PoolHealth>,
    pub detail: Option<String>,
    /// Entries held by the local cache, when enabled.
    pub local_cache_entries: Option<usize>,
}

/// Blocking TagCache client. Cheap to share behind an `Arc`.
pub struct TagCacheClient {
    config: ClientConfig,
    serializer: Serializer,
    transport: Arc<dyn Transport>,
    local: Option<LocalCache>,
    closed: AtomicBool,
}

impl TagCacheClient {
    /// Builds a client for `config.mode`. No connection is opened here.
    ///
    /// # Errors
    /// `Configuration` for invalid settings or an unavailable serializer.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let serializer = Serializer::negotiate(&config.serializer)?;
        let transport: Arc<dyn Transport> = match config.mode {
            TransportMode::Tcp => Arc::new(TcpTransport::from_config(&config)?),
            TransportMode::Http => Arc::new(HttpTransport::new(&config)?),
        };
        Ok(Self::assemble(config, serializer, transport))
    }

    /// Builds a client from `TAGCACHE_*` environment variables.
    pub fn from_env() -> ClientResult<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Builds a client around a caller-supplied transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> ClientResult<Self> {
        config.validate()?;
        let serializer = Serializer::negotiate(&config.serializer)?;
        Ok(Self::assemble(config, serializer, transport))
    }

    fn assemble(config: ClientConfig, serializer: Serializer, transport: Arc<dyn Transport>) -> Self {
        let local = (config.local_cache_capacity > 0)
            .then(|| {
                LocalCache::new(config.local_cache_capacity)
                    .with_max_ttl(Some(Duration::from_millis(config.local_cache_ttl_ms)))
            });
        debug!(
            transport = transport.name(),
            serializer = serializer.kind().name(),
            local_cache = config.local_cache_capacity,
            "tagcache client ready"
        );
        TagCacheClient {
            config,
            serializer,
            transport,
            local,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn serializer_kind(&self) -> SerializerKind {
        self.serializer.kind()
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Stores `value` under `key`. `ttl = None` applies `default_ttl_ms`.
    pub fn put(
        &self,
        key: &str,
        value: impl Into<Value>,
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> ClientResult<()> {
        self.ensure_open()?;
        validate_key(key)?;
        let tags = owned_tags(tags)?;
        let value = value.into();
        let payload = self.serializer.serialize(&value)?;
        let ttl_ms = self.effective_ttl_ms(ttl);

        self.transport.put(key, &payload, &tags, ttl_ms)?;
        if let Some(local) = &self.local {
            local.put(key, value, Some(&tags), ttl_ms.map(Duration::from_millis));
        }
        Ok(())
    }

    /// Fetches `key`.
    ///
    /// # Errors
    /// `NotFound` when the key is absent or expired.
    pub fn get(&self, key: &str) -> ClientResult<Value> {
        self.get_opt(key)?
            .ok_or_else(|| ClientError::not_found(key))
    }

    /// Fetches `key`, returning `None` on a miss.
    pub fn get_opt(&self, key: &str) -> ClientResult<Option<Value>> {
        self.ensure_open()?;
        validate_key(key)?;
        if let Some(value) = self.local.as_ref().and_then(|local| local.get(key)) {
            return Ok(Some(value));
        }
        let payload = match self.transport.get(key)? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        let value = self.serializer.deserialize(&payload)?;
        self.remember(key, &value);
        Ok(Some(value))
    }

    /// Returns `true` when the key existed.
    pub fn delete(&self, key: &str) -> ClientResult<bool> {
        self.ensure_open()?;
        validate_key(key)?;
        if let Some(local) = &self.local {
            local.remove(key);
        }
        self.transport.delete(key)
    }

    /// Fetches many keys in one round trip. Missing keys are left out.
    pub fn bulk_get(&self, keys: &[&str]) -> ClientResult<HashMap<String, Value>> {
        self.ensure_open()?;
        let keys = owned_keys(keys)?;
        let mut found = HashMap::with_capacity(keys.len());
        let mut remote = Vec::with_capacity(keys.len());
        for key in keys {
            match self.local.as_ref().and_then(|local| local.get(&key)) {
                Some(value) => {
                    found.insert(key, value);
                }
                None => remote.push(key),
            }
        }
        for (key, payload) in self.transport.bulk_get(&remote)? {
            let value = self.serializer.deserialize(&payload)?;
            self.remember(&key, &value);
            found.insert(key, value);
        }
        Ok(found)
    }

    /// Stores many untagged entries; returns how many were stored.
    pub fn bulk_put<I, K, V>(&self, items: I, ttl: Option<Duration>) -> ClientResult<usize>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.ensure_open()?;
        let ttl_ms = self.effective_ttl_ms(ttl);
        let mut entries = Vec::new();
        let mut values = Vec::new();
        for (key, value) in items {
            let key = key.into();
            validate_key(&key)?;
            let value = value.into();
            entries.push(PayloadEntry {
                payload: self.serializer.serialize(&value)?,
                key,
                tags: Vec::new(),
                ttl_ms,
            });
            values.push(value);
        }
        let stored = self.transport.bulk_put(&entries)?;
        if let Some(local) = &self.local {
            for (entry, value) in entries.iter().zip(values) {
                local.put(&entry.key, value, Some(&entry.tags), ttl_ms.map(Duration::from_millis));
            }
        }
        Ok(stored)
    }

    /// Deletes many keys; returns how many existed.
    pub fn bulk_delete(&self, keys: &[&str]) -> ClientResult<usize> {
        self.ensure_open()?;
        let keys = owned_keys(keys)?;
        if let Some(local) = &self.local {
            local.remove_many(&keys);
        }
        self.transport.bulk_delete(&keys)
    }

    /// Removes every key carrying `tag`; returns the count removed.
    pub fn invalidate_by_tag(&self, tag: &str) -> ClientResult<u64> {
        self.ensure_open()?;
        validate_tag(tag)?;
        if let Some(local) = &self.local {
            local.invalidate_tags_any(&[tag]);
        }
        self.transport.invalidate_tag(tag)
    }

    /// Removes keys carrying at least one of `tags`.
    pub fn invalidate_tags_any(&self, tags: &[&str]) -> ClientResult<u64> {
        self.ensure_open()?;
        let tags = owned_tags(tags)?;
        if tags.is_empty() {
            return Ok(0);
        }
        if let Some(local) = &self.local {
            local.invalidate_tags_any(&tags);
        }
        self.transport.invalidate_tags_any(&tags)
    }

    /// Removes keys carrying all of `tags`.
    pub fn invalidate_tags_all(&self, tags: &[&str]) -> ClientResult<u64> {
        self.ensure_open()?;
        let tags = owned_tags(tags)?;
        if tags.is_empty() {
            return Ok(0);
        }
        if let Some(local) = &self.local {
            local.invalidate_tags_all(&tags);
        }
        self.transport.invalidate_tags_all(&tags)
    }

    /// Removes the listed keys in one command.
    pub fn invalidate_keys(&self, keys: &[&str]) -> ClientResult<u64> {
        self.ensure_open()?;
        let keys = owned_keys(keys)?;
        if keys.is_empty() {
            return Ok(0);
        }
        if let Some(local) = &self.local {
            local.remove_many(&keys);
        }
        self.transport.invalidate_keys(&keys)
    }

    pub fn keys_by_tag(&self, tag: &str) -> ClientResult<Vec<String>> {
        self.keys_by_tag_limit(tag, None)
    }

    pub fn keys_by_tag_limit(&self, tag: &str, limit: Option<usize>) -> ClientResult<Vec<String>> {
        self.ensure_open()?;
        validate_tag(tag)?;
        self.transport.keys_by_tag(tag, limit)
    }

    /// Keys carrying any of `tags`, in order of first appearance.
    pub fn search_any(&self, tags: &[&str]) -> ClientResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for tag in tags {
            for key in self.keys_by_tag(tag)? {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Keys carrying every one of `tags`, in the first tag's order.
    pub fn search_all(&self, tags: &[&str]) -> ClientResult<Vec<String>> {
        let (first, rest) = match tags.split_first() {
            Some(split) => split,
            None => return Ok(Vec::new()),
        };
        let mut keys = self.keys_by_tag(first)?;
        for tag in rest {
            if keys.is_empty() {
                break;
            }
            let members: HashSet<String> = self.keys_by_tag(tag)?.into_iter().collect();
            keys.retain(|key| members.contains(key));
        }
        let mut seen = HashSet::new();
        keys.retain(|key| seen.insert(key.clone()));
        Ok(keys)
    }

    /// Server-side search; HTTP transport only.
    pub fn search(&self, params: &SearchParams) -> ClientResult<Vec<SearchHit>> {
        self.ensure_open()?;
        self.transport.search(params)
    }

    pub fn stats(&self) -> ClientResult<Stats> {
        self.ensure_open()?;
        self.transport.stats()
    }

    /// Removes every entry on the server; returns the count removed.
    pub fn flush(&self) -> ClientResult<u64> {
        self.ensure_open()?;
        if let Some(local) = &self.local {
            local.clear();
        }
        self.transport.flush()
    }

    /// Checks the server once and reports pool state. Never fails.
    pub fn health(&self) -> HealthReport {
        let local_cache_entries = self.local.as_ref().map(LocalCache::len);
        if self.closed.load(Ordering::Acquire) {
            return HealthReport {
                healthy: false,
                transport: self.transport.name(),
                serializer: self.serializer.kind().name(),
                pool: None,
                detail: Some("client closed".to_string()),
                local_cache_entries,
            };
        }
        let check = self.transport.health();
        HealthReport {
            healthy: check.reachable,
            transport: check.transport,
            serializer: self.serializer.kind().name(),
            pool: check.pool,
            detail: check.detail,
            local_cache_entries,
        }
    }

    /// Returns the cached value, or stores and returns `producer()` on a miss.
    pub fn get_or_set<F, V>(
        &self,
        key: &str,
        producer: F,
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> ClientResult<Value>
    where
        F: FnOnce() -> V,
        V: Into<Value>,
    {
        if let Some(value) = self.get_opt(key)? {
            return Ok(value);
        }
        let value = producer().into();
        self.put(key, value.clone(), tags, ttl)?;
        Ok(value)
    }

    /// Exchanges credentials for a bearer token used by later requests.
    pub fn login(&self, username: &str, password: &str) -> ClientResult<LoginToken> {
        self.ensure_open()?;
        self.transport.login(username, password)
    }

    pub fn rotate_credentials(&self) -> ClientResult<Credentials> {
        self.ensure_open()?;
        self.transport.rotate_credentials()
    }

    /// Closes pooled connections. Later operations fail with `Configuration`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close();
        if let Some(local) = &self.local {
            local.clear();
        }
        debug!(transport = self.transport.name(), "tagcache client closed");
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Configuration("client closed".into()));
        }
        Ok(())
    }

    fn effective_ttl_ms(&self, ttl: Option<Duration>) -> Option<u64> {
        match ttl {
            Some(ttl) if ttl.is_zero() => None,
            // Sub-millisecond TTLs round up rather than becoming "no TTL".
            Some(ttl) => Some(ttl.as_millis().clamp(1, u64::MAX as u128) as u64),
            None => self.config.default_ttl_ms.filter(|ms| *ms > 0),
        }
    }

    fn remember(&self, key: &str, value: &Value) {
        if let Some(local) = &self.local {
            local.put(key, value.clone(), None, None);
        }
    }
}

fn owned_keys(keys: &[&str]) -> ClientResult<Vec<String>> {
    keys.iter()
        .map(|key| validate_key(key).map(|_| key.to_string()))
        .collect()
}

fn owned_tags(tags: &[&str]) -> ClientResult<Vec<String>> {
    tags.iter()
        .map(|tag| validate_tag(tag).map(|_| tag.to_string()))
        .collect()
}
