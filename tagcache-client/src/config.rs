//! # Client Configuration
//!
//! Purpose: Describe every tunable of the client in one immutable value that
//! can be built in code, deserialized, or read from `TAGCACHE_*` variables.
//!
//! ## Design Principles
//! 1. **Plain Data**: Public fields with `Default`, like any other config struct.
//! 2. **Injectable Environment**: `from_lookup` takes a closure so tests never
//!    touch the process environment.
//! 3. **Loud Parsing**: A malformed variable is a configuration error, not a
//!    silent default.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pool::PoolConfig;
use crate::retry::{Backoff, BackoffKind, RetryPolicy};
use crate::{ClientError, ClientResult};

/// Which wire the client speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Tcp,
    Http,
}

impl FromStr for TransportMode {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportMode::Tcp),
            "http" => Ok(TransportMode::Http),
            "auto" => {
                warn!("transport mode 'auto' resolves to tcp");
                Ok(TransportMode::Tcp)
            }
            other => Err(ClientError::Configuration(format!(
                "unknown transport mode {:?}",
                other
            ))),
        }
    }
}

/// Client configuration. Immutable once handed to `TagCacheClient::new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub mode: TransportMode,
    pub host: String,
    pub port: u16,
    /// Read/write timeout, also the pool acquire timeout.
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub pool_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: BackoffKind,
    /// Cap for exponential schedules.
    pub retry_max_delay_ms: u64,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: bool,
    pub keepalive_interval_secs: u64,
    /// Consecutive `ERR` replies before a pooled connection is replaced.
    pub failure_threshold: u32,
    /// TTL applied when an operation passes `None`.
    pub default_ttl_ms: Option<u64>,
    pub serializer: String,
    pub http_url: String,
    pub http_timeout_ms: u64,
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Entries kept in the in-process LRU; 0 disables it.
    pub local_cache_capacity: usize,
    /// Longest time a local entry is served without asking the server; 0
    /// leaves entries to their own TTL.
    pub local_cache_ttl_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            mode: TransportMode::Tcp,
            host: "127.0.0.1".to_string(),
            port: 1984,
            timeout_ms: 5000,
            connect_timeout_ms: 3000,
            pool_size: 8,
            max_retries: 3,
            retry_delay_ms: 100,
            backoff: BackoffKind::Constant,
            retry_max_delay_ms: 2000,
            tcp_nodelay: true,
            tcp_keepalive: true,
            keepalive_interval_secs: 60,
            failure_threshold: 1,
            default_ttl_ms: None,
            serializer: "native".to_string(),
            http_url: "http://127.0.0.1:8080".to_string(),
            http_timeout_ms: 5000,
            token: None,
            username: None,
            password: None,
            local_cache_capacity: 0,
            local_cache_ttl_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// Reads `TAGCACHE_*` variables on top of the defaults.
    pub fn from_env() -> ClientResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like `from_env`, with a caller-supplied variable source.
    pub fn from_lookup<F>(lookup: F) -> ClientResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = ClientConfig::default();

        if let Some(raw) = get("TAGCACHE_MODE") {
            config.mode = raw.parse()?;
        }
        if let Some(raw) = get("TAGCACHE_TCP_HOST") {
            config.host = raw.trim().to_string();
        }
        if let Some(raw) = get("TAGCACHE_TCP_PORT") {
            config.port = parse_num("TAGCACHE_TCP_PORT", &raw)?;
        }
        if let Some(raw) = get("TAGCACHE_TCP_TIMEOUT_MS") {
            config.timeout_ms = parse_num("TAGCACHE_TCP_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("TAGCACHE_TCP_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = parse_num("TAGCACHE_TCP_CONNECT_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("TAGCACHE_TCP_POOL_SIZE") {
            config.pool_size = parse_num("TAGCACHE_TCP_POOL_SIZE", &raw)?;
        } else if let Some(raw) = get("TAGCACHE_TCP_POOL") {
            config.pool_size = parse_num("TAGCACHE_TCP_POOL", &raw)?;
        }
        if let Some(raw) = get("TAGCACHE_TCP_MAX_RETRIES") {
            config.max_retries = parse_num("TAGCACHE_TCP_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = get("TAGCACHE_TCP_RETRY_DELAY_MS") {
            config.retry_delay_ms = parse_num("TAGCACHE_TCP_RETRY_DELAY_MS", &raw)?;
        }
        if let Some(raw) = get("TAGCACHE_TCP_NODELAY") {
            config.tcp_nodelay = parse_bool("TAGCACHE_TCP_NODELAY", &raw)?;
        }
        if let Some(raw) = get("TAGCACHE_TCP_KEEPALIVE") {
            config.tcp_keepalive = parse_bool("TAGCACHE_TCP_KEEPALIVE", &raw)?;
        }
        if let Some(raw) = get("TAGCACHE_TCP_KEEPALIVE_INTERVAL") {
            config.keepalive_interval_secs = parse_num("TAGCACHE_TCP_KEEPALIVE_INTERVAL", &raw)?;
        }
        if let Some(raw) = get("TAGCACHE_DEFAULT_TTL_MS") {
            let ttl: u64 = parse_num("TAGCACHE_DEFAULT_TTL_MS", &raw)?;
            config.default_ttl_ms = (ttl > 0).then_some(ttl);
        }
        if let Some(raw) = get("TAGCACHE_SERIALIZER") {
            config.serializer = raw.trim().to_string();
        }
        if let Some(raw) = get("TAGCACHE_HTTP_URL") {
            config.http_url = raw.trim().trim_end_matches('/').to_string();
        }
        if let Some(raw) = get("TAGCACHE_HTTP_TIMEOUT_MS") {
            config.http_timeout_ms = parse_num("TAGCACHE_HTTP_TIMEOUT_MS", &raw)?;
        }
        config.token = get("TAGCACHE_TOKEN");
        config.username = get("TAGCACHE_USERNAME");
        config.password = get("TAGCACHE_PASSWORD");
        if let Some(raw) = get("TAGCACHE_LOCAL_CACHE_CAPACITY") {
            config.local_cache_capacity = parse_num("TAGCACHE_LOCAL_CACHE_CAPACITY", &raw)?;
        }
        if let Some(raw) = get("TAGCACHE_LOCAL_CACHE_TTL_MS") {
            config.local_cache_ttl_ms = parse_num("TAGCACHE_LOCAL_CACHE_TTL_MS", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects values no transport can work with.
    pub fn validate(&self) -> ClientResult<()> {
        if self.pool_size == 0 {
            return Err(ClientError::Configuration("pool_size must be at least 1".into()));
        }
        if self.port == 0 {
            return Err(ClientError::Configuration("port must not be 0".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ClientError::Configuration("timeout_ms must be positive".into()));
        }
        if self.host.trim().is_empty() {
            return Err(ClientError::Configuration("host must not be empty".into()));
        }
        Ok(())
    }

    /// `host:port` for the TCP transport.
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            addr: self.addr(),
            pool_size: self.pool_size,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms.max(1)),
            io_timeout: self.timeout(),
            acquire_timeout: self.timeout(),
            nodelay: self.tcp_nodelay,
            keepalive: self
                .tcp_keepalive
                .then(|| Duration::from_secs(self.keepalive_interval_secs.max(1))),
            failure_threshold: self.failure_threshold.max(1),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = Backoff::from_kind(
            self.backoff,
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms.max(self.retry_delay_ms)),
        );
        RetryPolicy::new(self.max_retries, backoff)
    }
}

fn parse_num<T: FromStr>(name: &str, raw: &str) -> ClientResult<T> {
    raw.trim().parse::<T>().map_err(|_| {
        ClientError::Configuration(format!("{} must be a non-negative integer, got {:?}", name, raw))
    })
}

fn parse_bool(name: &str, raw: &str) -> ClientResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ClientError::Configuration(format!(
            "{} must be a boolean, got {:?}",
            name, raw
        ))),
    }
}
