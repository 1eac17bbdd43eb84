//! PostgreSQL type identifiers, values and codecs.
//!
//! All values travel in text format except byte sequences bound as
//! parameters, which are sent binary.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

mod oid;
mod registry;
pub mod text;
mod value;

pub use oid::Oid;
pub use registry::{
    catalog_query, CatalogRow, ScalarCodec, TypeCatalog, TypeDescriptor, TypeDiagnostic,
    TypeKind, TypeRegistry, WireValue,
};
pub use value::{PgInet, PgRange, PgValue};
