//! # Error Taxonomy
//!
//! Purpose: Give every failure a typed category so callers can decide how to
//! react (retry, reconfigure, treat as a miss) without parsing strings.
//!
//! ## Design Principles
//! 1. **Typed Categories**: One variant per failure class, never a catch-all.
//! 2. **Retry Awareness**: `is_retryable()` is the single source of truth for
//!    the retry policy.
//! 3. **Source Chaining**: Underlying IO errors stay attached via `#[source]`.

use std::io;
use std::time::Duration;

/// Result type shared by the TagCache crates.
pub type TagCacheResult<T> = Result<T, TagCacheError>;

/// Errors surfaced by TagCache clients.
#[derive(Debug, thiserror::Error)]
pub enum TagCacheError {
    /// A required capability was requested but is unavailable, or the
    /// configuration itself is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// TCP connect failed or timed out.
    #[error("failed to establish TCP connection to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Network failure on an established connection (reset, read/write timeout).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Every pooled connection stayed busy for the whole acquire timeout.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolTimeout { waited: Duration },

    /// Malformed or truncated server response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Application-level miss.
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// The server answered with an `ERR` reply.
    #[error("server error: {0}")]
    Server(String),

    /// Retries were exhausted; carries the last underlying error.
    #[error("transport failed after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: Box<TagCacheError>,
    },

    /// Key or tag cannot be represented on the wire.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Payload codec failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// HTTP-level failure reported by the server.
    #[error("http error {status}: {message}")]
    Http { status: u16, message: String },

    /// The chosen transport does not offer this operation.
    #[error("{operation} is not supported over the {transport} transport")]
    Unsupported {
        operation: &'static str,
        transport: &'static str,
    },
}

impl TagCacheError {
    /// Returns true for transport-level failures worth another attempt.
    ///
    /// Protocol errors are excluded: once a reply is malformed the server-side
    /// state of the request is unknown.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TagCacheError::Connection { .. } | TagCacheError::Io(_) | TagCacheError::PoolTimeout { .. }
        )
    }

    /// Returns true when the error is an application-level miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TagCacheError::NotFound { .. })
    }

    /// Returns true when the error came from a read or write timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            TagCacheError::Io(err) => {
                matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
            }
            TagCacheError::Connection { source, .. } => source.kind() == io::ErrorKind::TimedOut,
            TagCacheError::Transport { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Builds a `NotFound` error for a key.
    pub fn not_found(key: impl Into<String>) -> Self {
        TagCacheError::NotFound { key: key.into() }
    }

    /// Builds a `Protocol` error from any displayable message.
    pub fn protocol(message: impl Into<String>) -> Self {
        TagCacheError::Protocol(message.into())
    }
}
