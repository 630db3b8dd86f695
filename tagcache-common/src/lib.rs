// tagcache-common - Shared types and protocol definitions for TagCache clients
//
// This crate defines the value model and the line protocol spoken to the
// tag cache server over TCP

pub mod error;
pub mod types;
pub mod protocol;

// Re-export for convenience
pub use error::*;
pub use types::*;
pub use protocol::*;
