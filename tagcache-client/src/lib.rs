//! # TagCache Sync Client
//!
//! Purpose: Store, fetch and invalidate tagged values on a TagCache server
//! over its TCP line protocol or its JSON HTTP API.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections; a full pool waits up to
//!    the configured timeout instead of opening more.
//! 2. **Bounded Retries**: Transient failures are retried `max_retries` times
//!    with the configured backoff, then surfaced with the attempt count.
//! 3. **Typed Values**: Values are encoded once by the negotiated serializer,
//!    so every wire carries the same payload text.
//! 4. **Protocol Clarity**: The line protocol lives in `tagcache-common` and
//!    is encoded and parsed explicitly.

mod client;
mod config;
mod http;
mod local;
mod php;
mod pool;
mod retry;
mod serializer;
mod tcp;
mod transport;

pub use client::{HealthReport, TagCacheClient};
pub use config::{ClientConfig, TransportMode};
pub use http::HttpTransport;
pub use local::LocalCache;
pub use pool::{ConnectionPool, PoolConfig, PoolHealth, PooledConnection};
pub use retry::{Backoff, BackoffKind, RetryPolicy};
pub use serializer::{Serializer, SerializerKind};
pub use tcp::TcpTransport;
pub use transport::{
    Credentials, LoginToken, PayloadEntry, SearchHit, SearchParams, Transport, TransportHealth,
};

pub use tagcache_common::{validate_key, validate_tag, Stats, TagCacheError, Value};

pub type ClientError = TagCacheError;
pub type ClientResult<T> = Result<T, ClientError>;
