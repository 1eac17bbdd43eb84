//! pgexec - statement execution for PostgreSQL clients.
//!
//! A [`Session`] runs SQL with bound parameters over one connection and
//! returns a [`ResultSet`] of lazily decoded rows. Statements that repeat are
//! prepared server-side behind the caller's back; the cache of prepared
//! handles is bounded and evicted in batches.

pub mod error;
pub mod pg;

pub use error::{ExecError, Result};
pub use pg::{
    BindParam, ExecutionConfig, Oid, PgConfig, PgConnection, PgValue, ResultSet, Row, Session,
    TypeDescriptor, TypeRegistry,
};
