//! PostgreSQL statement execution over the v3 wire protocol.
//!
//! This module provides a client core that:
//! - Runs statements ad-hoc and prepares the ones that repeat
//! - Keeps prepared statements in a bounded LRU cache, deallocated in batches
//! - Encodes and decodes values through a catalog-backed type registry
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `connection`: TCP transport, startup and authentication
//! - `channel`: The request/response seam the execution core talks to
//! - `types`: Type registry and text codecs
//! - `statement`: Prepared statement cache
//! - `pending`: Deferred prepare/deallocate operations
//! - `tracker`: Execution counting for promotion
//! - `engine`: The per-connection session tying it together

pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod result;
pub mod statement;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod tests;

pub use channel::{Request, WireChannel, WireResponse};
pub use config::{ExecutionConfig, PgConfig};
pub use connection::PgConnection;
pub use engine::{BindParam, Session};
pub use error::{PgError, PgResult};
pub use result::{ResultSet, Row};
pub use statement::{CacheOwner, NormalizedStatementKey, PreparedStatementCache, SharedColumns};
pub use types::{Oid, PgValue, TypeDescriptor, TypeRegistry};
