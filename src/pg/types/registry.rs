//! Catalog-driven type registry.
//!
//! Maps server type identifiers to codecs. Builtins are registered up front;
//! anything else is resolved on first sight by querying `pg_type`, following
//! array element, range subtype and domain base chains until every dependency
//! is known. An identifier that cannot be resolved degrades to a passthrough
//! codec with a warning instead of failing the query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::oid::Oid;
use super::text::{self, ArrayElement};
use super::value::{PgRange, PgValue};
use crate::pg::error::{PgError, PgResult};

/// Codec for a non-container type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarCodec {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Bytea,
    Uuid,
    Json,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Inet,
    Point,
    Hstore,
    /// Identity codec for identifiers nobody recognized.
    Passthrough,
}

impl ScalarCodec {
    /// Codec for a catalog type name, when the name alone determines it.
    pub fn by_name(name: &str) -> Option<Self> {
        let codec = match name {
            "bool" => ScalarCodec::Bool,
            "int2" => ScalarCodec::Int2,
            "int4" => ScalarCodec::Int4,
            "int8" | "oid" => ScalarCodec::Int8,
            "float4" => ScalarCodec::Float4,
            "float8" => ScalarCodec::Float8,
            "numeric" => ScalarCodec::Numeric,
            "text" | "varchar" | "bpchar" | "char" | "name" | "citext" | "xml" | "money"
            | "interval" | "timetz" | "macaddr" | "bit" | "varbit" | "unknown" => ScalarCodec::Text,
            "bytea" => ScalarCodec::Bytea,
            "uuid" => ScalarCodec::Uuid,
            "json" | "jsonb" => ScalarCodec::Json,
            "date" => ScalarCodec::Date,
            "time" => ScalarCodec::Time,
            "timestamp" => ScalarCodec::Timestamp,
            "timestamptz" => ScalarCodec::TimestampTz,
            "inet" | "cidr" => ScalarCodec::Inet,
            "point" => ScalarCodec::Point,
            "hstore" => ScalarCodec::Hstore,
            _ => return None,
        };
        Some(codec)
    }

    fn decode(self, text: &str) -> PgResult<PgValue> {
        let value = match self {
            ScalarCodec::Bool => PgValue::Bool(text::parse_bool(text)?),
            ScalarCodec::Int2 => PgValue::Int2(
                text.parse()
                    .map_err(|e| PgError::Type(format!("Invalid INT2: {}", e)))?,
            ),
            ScalarCodec::Int4 => PgValue::Int4(
                text.parse()
                    .map_err(|e| PgError::Type(format!("Invalid INT4: {}", e)))?,
            ),
            ScalarCodec::Int8 => PgValue::Int8(
                text.parse()
                    .map_err(|e| PgError::Type(format!("Invalid INT8: {}", e)))?,
            ),
            ScalarCodec::Float4 => PgValue::Float4(text::parse_float(text)? as f32),
            ScalarCodec::Float8 => PgValue::Float8(text::parse_float(text)?),
            ScalarCodec::Numeric => PgValue::Numeric(text.to_string()),
            ScalarCodec::Text | ScalarCodec::Passthrough => PgValue::Text(text.to_string()),
            ScalarCodec::Bytea => PgValue::Bytea(text::parse_bytea(text)?),
            ScalarCodec::Uuid => PgValue::Uuid(
                Uuid::parse_str(text).map_err(|e| PgError::Type(format!("Invalid UUID: {}", e)))?,
            ),
            ScalarCodec::Json => PgValue::Json(
                serde_json::from_str(text)
                    .map_err(|e| PgError::Type(format!("Invalid JSON: {}", e)))?,
            ),
            ScalarCodec::Date
            | ScalarCodec::Time
            | ScalarCodec::Timestamp
            | ScalarCodec::TimestampTz
                if text::is_infinite_datetime(text) =>
            {
                PgValue::Text(text.to_string())
            }
            ScalarCodec::Date => PgValue::Date(text::parse_date(text)?),
            ScalarCodec::Time => PgValue::Time(text::parse_time(text)?),
            ScalarCodec::Timestamp => PgValue::Timestamp(text::parse_timestamp(text)?),
            ScalarCodec::TimestampTz => PgValue::TimestampTz(text::parse_timestamptz(text)?),
            ScalarCodec::Inet => PgValue::Inet(text::parse_inet(text)?),
            ScalarCodec::Point => {
                let (x, y) = text::parse_point(text)?;
                PgValue::Point(x, y)
            }
            ScalarCodec::Hstore => PgValue::Hstore(text::parse_hstore(text)?),
        };
        Ok(value)
    }
}

/// Shape of a registered type.
#[derive(Debug)]
pub enum TypeKind {
    Scalar(ScalarCodec),
    Array {
        element: Arc<TypeDescriptor>,
        delimiter: char,
    },
    Range {
        subtype: Arc<TypeDescriptor>,
    },
    Domain {
        base: Arc<TypeDescriptor>,
    },
    /// Row type; fields travel as text.
    Composite,
}

/// A parameter value ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Text(String),
    Binary(Vec<u8>),
}

/// Codec for one server type. Immutable once registered.
#[derive(Debug)]
pub struct TypeDescriptor {
    pub oid: Oid,
    pub name: String,
    pub kind: TypeKind,
}

impl TypeDescriptor {
    pub fn scalar(oid: Oid, name: impl Into<String>, codec: ScalarCodec) -> Self {
        Self {
            oid,
            name: name.into(),
            kind: TypeKind::Scalar(codec),
        }
    }

    pub fn passthrough(oid: Oid) -> Self {
        Self::scalar(oid, "unknown", ScalarCodec::Passthrough)
    }

    /// The element, subtype or base this type is built on.
    pub fn element_or_base(&self) -> Option<&Arc<TypeDescriptor>> {
        match &self.kind {
            TypeKind::Array { element, .. } => Some(element),
            TypeKind::Range { subtype } => Some(subtype),
            TypeKind::Domain { base } => Some(base),
            TypeKind::Scalar(_) | TypeKind::Composite => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self.kind, TypeKind::Scalar(ScalarCodec::Passthrough))
    }

    /// Whether parameters of this type are sent in binary format.
    pub fn is_binary(&self) -> bool {
        match &self.kind {
            TypeKind::Scalar(codec) => *codec == ScalarCodec::Bytea,
            TypeKind::Domain { base } => base.is_binary(),
            _ => false,
        }
    }

    /// Encode a parameter for the wire.
    pub fn encode(&self, value: &PgValue) -> PgResult<WireValue> {
        if value.is_null() {
            return Ok(WireValue::Null);
        }
        if self.is_binary() {
            match value {
                PgValue::Bytea(data) => return Ok(WireValue::Binary(data.clone())),
                PgValue::Text(s) => return Ok(WireValue::Binary(s.as_bytes().to_vec())),
                _ => {}
            }
        }
        Ok(self
            .encode_text(value)?
            .map_or(WireValue::Null, WireValue::Text))
    }

    /// Encode a value in text format. `None` means NULL.
    pub fn encode_text(&self, value: &PgValue) -> PgResult<Option<String>> {
        if value.is_null() {
            return Ok(None);
        }
        match (&self.kind, value) {
            (TypeKind::Domain { base }, _) => base.encode_text(value),
            (TypeKind::Array { element, delimiter }, PgValue::Array(items)) => {
                text::format_array(items, *delimiter, &mut |v| element.encode_text(v)).map(Some)
            }
            (TypeKind::Range { subtype }, PgValue::Range(range)) => {
                text::format_range(range, &mut |v| subtype.encode_text(v)).map(Some)
            }
            (TypeKind::Composite, PgValue::Record(fields)) => {
                text::format_record(fields, &mut |v| Ok(text::format_value(v))).map(Some)
            }
            _ => Ok(text::format_value(value)),
        }
    }

    /// Decode a non-NULL text cell.
    pub fn decode(&self, text: &str) -> PgResult<PgValue> {
        match &self.kind {
            TypeKind::Scalar(codec) => codec.decode(text),
            TypeKind::Domain { base } => base.decode(text),
            TypeKind::Array { element, delimiter } => {
                let items = text::parse_array(text, *delimiter)?;
                decode_array_elements(element, items).map(PgValue::Array)
            }
            TypeKind::Range { subtype } => {
                let raw = text::parse_range(text)?;
                if raw.empty {
                    return Ok(PgRange::empty().into());
                }
                let bound = |b: Option<String>| b.map(|t| subtype.decode(&t)).transpose();
                Ok(PgRange {
                    lower: bound(raw.lower)?,
                    upper: bound(raw.upper)?,
                    lower_inclusive: raw.lower_inclusive,
                    upper_inclusive: raw.upper_inclusive,
                    empty: false,
                }
                .into())
            }
            TypeKind::Composite => Ok(PgValue::Record(
                text::parse_record(text)?
                    .into_iter()
                    .map(|f| f.map_or(PgValue::Null, PgValue::Text))
                    .collect(),
            )),
        }
    }

    /// Decode a raw cell; `None` is SQL NULL.
    pub fn decode_cell(&self, raw: Option<&[u8]>) -> PgResult<PgValue> {
        match raw {
            None => Ok(PgValue::Null),
            Some(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| PgError::Type(format!("Invalid UTF-8 in {}: {}", self.name, e)))?;
                self.decode(text)
            }
        }
    }
}

fn decode_array_elements(
    element: &TypeDescriptor,
    items: Vec<ArrayElement>,
) -> PgResult<Vec<PgValue>> {
    items
        .into_iter()
        .map(|item| match item {
            ArrayElement::Null => Ok(PgValue::Null),
            ArrayElement::Value(text) => element.decode(&text),
            ArrayElement::Nested(inner) => decode_array_elements(element, inner).map(PgValue::Array),
        })
        .collect()
}

// ============================================================================
// Catalog
// ============================================================================

/// One `pg_type` row as returned by the catalog query.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRow {
    pub oid: Oid,
    pub name: String,
    pub element: Oid,
    pub delimiter: char,
    pub range_subtype: Option<Oid>,
    pub kind_tag: char,
    pub base: Oid,
}

impl CatalogRow {
    /// Build from the text cells of one catalog query row, in column order.
    pub fn from_text_row(cells: &[Option<&str>]) -> PgResult<Self> {
        let range_subtype = match cells.get(4).copied().flatten() {
            Some(_) => Some(catalog_oid(cells, 4)?),
            None => None,
        };
        Ok(CatalogRow {
            oid: catalog_oid(cells, 0)?,
            name: catalog_cell(cells, 1)?.to_string(),
            element: catalog_oid(cells, 2)?,
            delimiter: catalog_cell(cells, 3)?.chars().next().unwrap_or(','),
            range_subtype,
            kind_tag: catalog_cell(cells, 5)?.chars().next().unwrap_or('b'),
            base: catalog_oid(cells, 6)?,
        })
    }

    fn dependencies(&self) -> impl Iterator<Item = Oid> + '_ {
        [Some(self.element), self.range_subtype, Some(self.base)]
            .into_iter()
            .flatten()
            .filter(|oid| *oid != Oid::UNSPECIFIED)
    }
}

fn catalog_cell<'a>(cells: &[Option<&'a str>], i: usize) -> PgResult<&'a str> {
    cells
        .get(i)
        .copied()
        .flatten()
        .ok_or_else(|| PgError::Protocol(format!("catalog row is missing column {}", i)))
}

fn catalog_oid(cells: &[Option<&str>], i: usize) -> PgResult<Oid> {
    let raw = catalog_cell(cells, i)?;
    raw.parse::<u32>()
        .map(|v| Oid(v as i32))
        .map_err(|e| PgError::Protocol(format!("invalid oid {:?} in catalog row: {}", raw, e)))
}

/// The catalog query for the given identifiers.
pub fn catalog_query(oids: &[Oid]) -> String {
    let list = oids
        .iter()
        .map(|oid| (oid.0 as u32).to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT t.oid, t.typname, t.typelem, t.typdelim, r.rngsubtype, t.typtype, t.typbasetype \
         FROM pg_type as t \
         LEFT JOIN pg_range as r ON t.oid = r.rngtypid \
         WHERE t.oid IN ({})",
        list
    )
}

/// Source of catalog rows. The session implements this over its own channel.
#[allow(async_fn_in_trait)]
pub trait TypeCatalog {
    async fn fetch_types(&mut self, oids: &[Oid]) -> PgResult<Vec<CatalogRow>>;
}

/// An identifier that had to be decoded as passthrough text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDiagnostic {
    pub oid: Oid,
    pub column: Option<String>,
}

// ============================================================================
// Registry
// ============================================================================

/// Descriptor table shared by one session.
///
/// Reads may happen concurrently; each identifier is registered at most once
/// and later lookups return the same `Arc`.
#[derive(Debug)]
pub struct TypeRegistry {
    types: RwLock<HashMap<Oid, Arc<TypeDescriptor>>>,
    diagnostics: Mutex<Vec<TypeDiagnostic>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create a registry holding the builtin types.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register_builtins();
        registry
    }

    /// Create a registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    fn register_builtins(&self) {
        for &(oid, name, codec) in BUILTIN_SCALARS {
            self.register(TypeDescriptor::scalar(oid, name, codec));
        }
        for &(oid, name, element) in BUILTIN_ARRAYS {
            if let Some(element) = self.get(element) {
                self.register(TypeDescriptor {
                    oid,
                    name: name.to_string(),
                    kind: TypeKind::Array {
                        element,
                        delimiter: ',',
                    },
                });
            }
        }
        for &(oid, name, subtype) in BUILTIN_RANGES {
            if let Some(subtype) = self.get(subtype) {
                self.register(TypeDescriptor {
                    oid,
                    name: name.to_string(),
                    kind: TypeKind::Range { subtype },
                });
            }
        }
    }

    /// The registered descriptor, if any.
    pub fn get(&self, oid: Oid) -> Option<Arc<TypeDescriptor>> {
        self.types.read().get(&oid).cloned()
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.types.read().contains_key(&oid)
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }

    /// Register a descriptor; if the identifier is already taken the stored
    /// descriptor wins and is returned.
    pub fn register(&self, descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
        let mut types = self.types.write();
        Arc::clone(
            types
                .entry(descriptor.oid)
                .or_insert_with(|| Arc::new(descriptor)),
        )
    }

    /// Diagnostics recorded for identifiers decoded as passthrough.
    pub fn diagnostics(&self) -> Vec<TypeDiagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Resolve a descriptor, asking the catalog on a miss. Never fails.
    pub async fn lookup<C: TypeCatalog>(&self, oid: Oid, catalog: &mut C) -> Arc<TypeDescriptor> {
        self.lookup_column(oid, None, catalog).await
    }

    /// Like [`lookup`](Self::lookup), naming the column in the diagnostic.
    pub async fn lookup_column<C: TypeCatalog>(
        &self,
        oid: Oid,
        column: Option<&str>,
        catalog: &mut C,
    ) -> Arc<TypeDescriptor> {
        if let Some(descriptor) = self.get(oid) {
            return descriptor;
        }
        if let Err(e) = self.load(&[oid], catalog).await {
            // Not registered: the next lookup asks the catalog again.
            warn!(oid = %oid, error = %e, "type catalog lookup failed, decoding as text");
            self.record_diagnostic(oid, column);
            return Arc::new(TypeDescriptor::passthrough(oid));
        }
        match self.get(oid) {
            Some(descriptor) if !descriptor.is_passthrough() => descriptor,
            _ => self.passthrough(oid, column),
        }
    }

    /// Query the catalog for every unknown identifier in `oids` and for the
    /// types they depend on, then register them all.
    pub async fn load<C: TypeCatalog>(&self, oids: &[Oid], catalog: &mut C) -> PgResult<()> {
        let mut requested: HashSet<Oid> = HashSet::new();
        let mut rows: HashMap<Oid, CatalogRow> = HashMap::new();
        let mut frontier: Vec<Oid> = oids
            .iter()
            .copied()
            .filter(|oid| !self.contains(*oid))
            .collect();

        while !frontier.is_empty() {
            frontier.retain(|oid| requested.insert(*oid));
            if frontier.is_empty() {
                break;
            }
            debug!(oids = ?frontier, "loading types from catalog");
            let fetched = catalog.fetch_types(&frontier).await?;
            frontier.clear();
            for row in fetched {
                frontier.extend(
                    row.dependencies()
                        .filter(|dep| !self.contains(*dep) && !rows.contains_key(dep)),
                );
                rows.insert(row.oid, row);
            }
        }

        let mut visiting = HashSet::new();
        let mut roots: Vec<Oid> = rows.keys().copied().collect();
        roots.sort();
        for oid in roots {
            self.build(oid, &rows, &mut visiting);
        }
        Ok(())
    }

    /// Build and register the descriptor for `oid` from fetched rows.
    /// `None` when the row is missing or of a shape no codec handles.
    fn build(
        &self,
        oid: Oid,
        rows: &HashMap<Oid, CatalogRow>,
        visiting: &mut HashSet<Oid>,
    ) -> Option<Arc<TypeDescriptor>> {
        if let Some(existing) = self.get(oid) {
            return Some(existing);
        }
        let row = rows.get(&oid)?;
        if !visiting.insert(oid) {
            warn!(oid = %oid, name = %row.name, "cyclic type definition in catalog");
            return None;
        }

        let kind = if let Some(codec) = ScalarCodec::by_name(&row.name) {
            Some(TypeKind::Scalar(codec))
        } else {
            match row.kind_tag {
                'r' => row.range_subtype.map(|subtype| TypeKind::Range {
                    subtype: self.dependency(subtype, rows, visiting),
                }),
                'd' => Some(TypeKind::Domain {
                    base: self.dependency(row.base, rows, visiting),
                }),
                'b' if row.element != Oid::UNSPECIFIED && row.name.starts_with('_') => {
                    Some(TypeKind::Array {
                        element: self.dependency(row.element, rows, visiting),
                        delimiter: row.delimiter,
                    })
                }
                'e' => Some(TypeKind::Scalar(ScalarCodec::Text)),
                'c' => Some(TypeKind::Composite),
                _ => None,
            }
        };
        visiting.remove(&oid);

        kind.map(|kind| {
            self.register(TypeDescriptor {
                oid,
                name: row.name.clone(),
                kind,
            })
        })
    }

    /// Element, subtype or base of a type being built; unresolvable ones
    /// become passthrough so the container still decodes.
    fn dependency(
        &self,
        oid: Oid,
        rows: &HashMap<Oid, CatalogRow>,
        visiting: &mut HashSet<Oid>,
    ) -> Arc<TypeDescriptor> {
        self.build(oid, rows, visiting)
            .unwrap_or_else(|| self.passthrough(oid, None))
    }

    /// Register (or fetch) the passthrough descriptor, warning once per
    /// identifier.
    fn passthrough(&self, oid: Oid, column: Option<&str>) -> Arc<TypeDescriptor> {
        if let Some(existing) = self.get(oid) {
            return existing;
        }
        warn!(
            oid = %oid,
            column = column.unwrap_or(""),
            "unknown OID: failed to recognize type, it will be treated as text"
        );
        self.record_diagnostic(oid, column);
        self.register(TypeDescriptor::passthrough(oid))
    }

    fn record_diagnostic(&self, oid: Oid, column: Option<&str>) {
        self.diagnostics.lock().push(TypeDiagnostic {
            oid,
            column: column.map(str::to_string),
        });
    }
}

const BUILTIN_SCALARS: &[(Oid, &str, ScalarCodec)] = &[
    (Oid::BOOL, "bool", ScalarCodec::Bool),
    (Oid::BYTEA, "bytea", ScalarCodec::Bytea),
    (Oid::CHAR, "char", ScalarCodec::Text),
    (Oid::NAME, "name", ScalarCodec::Text),
    (Oid::INT8, "int8", ScalarCodec::Int8),
    (Oid::INT2, "int2", ScalarCodec::Int2),
    (Oid::INT4, "int4", ScalarCodec::Int4),
    (Oid::OID_TYPE, "oid", ScalarCodec::Int8),
    (Oid::TEXT, "text", ScalarCodec::Text),
    (Oid::VARCHAR, "varchar", ScalarCodec::Text),
    (Oid::BPCHAR, "bpchar", ScalarCodec::Text),
    (Oid::FLOAT4, "float4", ScalarCodec::Float4),
    (Oid::FLOAT8, "float8", ScalarCodec::Float8),
    (Oid::NUMERIC, "numeric", ScalarCodec::Numeric),
    (Oid::MONEY, "money", ScalarCodec::Text),
    (Oid::JSON, "json", ScalarCodec::Json),
    (Oid::JSONB, "jsonb", ScalarCodec::Json),
    (Oid::XML, "xml", ScalarCodec::Text),
    (Oid::UUID, "uuid", ScalarCodec::Uuid),
    (Oid::DATE, "date", ScalarCodec::Date),
    (Oid::TIME, "time", ScalarCodec::Time),
    (Oid::TIMETZ, "timetz", ScalarCodec::Text),
    (Oid::TIMESTAMP, "timestamp", ScalarCodec::Timestamp),
    (Oid::TIMESTAMPTZ, "timestamptz", ScalarCodec::TimestampTz),
    (Oid::INTERVAL, "interval", ScalarCodec::Text),
    (Oid::INET, "inet", ScalarCodec::Inet),
    (Oid::CIDR, "cidr", ScalarCodec::Inet),
    (Oid::MACADDR, "macaddr", ScalarCodec::Text),
    (Oid::POINT, "point", ScalarCodec::Point),
];

const BUILTIN_ARRAYS: &[(Oid, &str, Oid)] = &[
    (Oid::BOOL_ARRAY, "_bool", Oid::BOOL),
    (Oid::BYTEA_ARRAY, "_bytea", Oid::BYTEA),
    (Oid::INT2_ARRAY, "_int2", Oid::INT2),
    (Oid::INT4_ARRAY, "_int4", Oid::INT4),
    (Oid::INT8_ARRAY, "_int8", Oid::INT8),
    (Oid::TEXT_ARRAY, "_text", Oid::TEXT),
    (Oid::VARCHAR_ARRAY, "_varchar", Oid::VARCHAR),
    (Oid::BPCHAR_ARRAY, "_bpchar", Oid::BPCHAR),
    (Oid::FLOAT4_ARRAY, "_float4", Oid::FLOAT4),
    (Oid::FLOAT8_ARRAY, "_float8", Oid::FLOAT8),
    (Oid::NUMERIC_ARRAY, "_numeric", Oid::NUMERIC),
    (Oid::JSON_ARRAY, "_json", Oid::JSON),
    (Oid::JSONB_ARRAY, "_jsonb", Oid::JSONB),
    (Oid::XML_ARRAY, "_xml", Oid::XML),
    (Oid::UUID_ARRAY, "_uuid", Oid::UUID),
    (Oid::DATE_ARRAY, "_date", Oid::DATE),
    (Oid::TIMESTAMP_ARRAY, "_timestamp", Oid::TIMESTAMP),
    (Oid::TIMESTAMPTZ_ARRAY, "_timestamptz", Oid::TIMESTAMPTZ),
    (Oid::INET_ARRAY, "_inet", Oid::INET),
    (Oid::POINT_ARRAY, "_point", Oid::POINT),
];

const BUILTIN_RANGES: &[(Oid, &str, Oid)] = &[
    (Oid::INT4RANGE, "int4range", Oid::INT4),
    (Oid::INT8RANGE, "int8range", Oid::INT8),
    (Oid::NUMRANGE, "numrange", Oid::NUMERIC),
    (Oid::TSRANGE, "tsrange", Oid::TIMESTAMP),
    (Oid::TSTZRANGE, "tstzrange", Oid::TIMESTAMPTZ),
    (Oid::DATERANGE, "daterange", Oid::DATE),
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Catalog backed by a fixed table, counting round trips.
    struct FakeCatalog {
        rows: Vec<CatalogRow>,
        queries: Vec<Vec<Oid>>,
        fail: bool,
    }

    impl FakeCatalog {
        fn new(rows: Vec<CatalogRow>) -> Self {
            Self {
                rows,
                queries: Vec::new(),
                fail: false,
            }
        }
    }

    impl TypeCatalog for FakeCatalog {
        async fn fetch_types(&mut self, oids: &[Oid]) -> PgResult<Vec<CatalogRow>> {
            self.queries.push(oids.to_vec());
            if self.fail {
                return Err(PgError::ConnectionClosed);
            }
            Ok(self
                .rows
                .iter()
                .filter(|r| oids.contains(&r.oid))
                .cloned()
                .collect())
        }
    }

    fn row(oid: i32, name: &str, kind_tag: char) -> CatalogRow {
        CatalogRow {
            oid: Oid(oid),
            name: name.to_string(),
            element: Oid::UNSPECIFIED,
            delimiter: ',',
            range_subtype: None,
            kind_tag,
            base: Oid::UNSPECIFIED,
        }
    }

    #[test]
    fn test_builtins_registered_once() {
        let registry = TypeRegistry::new();
        let a = registry.get(Oid::INT4_ARRAY).unwrap();
        let b = registry.get(Oid::INT4_ARRAY).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let element = a.element_or_base().unwrap();
        assert!(Arc::ptr_eq(element, &registry.get(Oid::INT4).unwrap()));

        let again = registry.register(TypeDescriptor::passthrough(Oid::INT4));
        assert!(!again.is_passthrough());
    }

    #[test]
    fn test_array_round_trip_through_descriptor() {
        let registry = TypeRegistry::new();
        let ints = registry.get(Oid::INT4_ARRAY).unwrap();
        let value = PgValue::Array(vec![PgValue::Int4(1), PgValue::Null, PgValue::Int4(3)]);
        assert_eq!(ints.encode(&value).unwrap(), WireValue::Text("{1,NULL,3}".into()));
        assert_eq!(ints.decode("{1,NULL,3}").unwrap(), value);
    }

    #[test]
    fn test_range_round_trip_through_descriptor() {
        let registry = TypeRegistry::new();
        let range = registry.get(Oid::INT8RANGE).unwrap();
        let value: PgValue = PgRange::new(None, Some(PgValue::Int8(10))).into();
        let text = range.encode_text(&value).unwrap().unwrap();
        assert_eq!(text, "[,10)");
        assert_eq!(range.decode(&text).unwrap(), value);
        assert_eq!(range.decode("empty").unwrap(), PgRange::empty().into());

        let dates = registry.get(Oid::DATERANGE).unwrap();
        match dates.decode("[2024-01-01,2024-02-01)").unwrap() {
            PgValue::Range(r) => assert!(matches!(r.lower, Some(PgValue::Date(_)))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bytea_is_binary_and_tagged() {
        let registry = TypeRegistry::new();
        let bytea = registry.get(Oid::BYTEA).unwrap();
        let data: Vec<u8> = (0..=255u8).collect();
        assert_eq!(bytea.encode(&PgValue::Bytea(data.clone())).unwrap(), WireValue::Binary(data.clone()));
        let text = text::format_bytea(&data);
        assert_eq!(bytea.decode(&text).unwrap(), PgValue::Bytea(data));
        // text that happens to be valid UTF-8 is still binary
        assert_eq!(bytea.decode("\\x6869").unwrap(), PgValue::Bytea(b"hi".to_vec()));
    }

    #[test]
    fn test_float_specials_through_descriptor() {
        let registry = TypeRegistry::new();
        let float = registry.get(Oid::FLOAT8).unwrap();
        for v in [f64::INFINITY, f64::NEG_INFINITY] {
            let text = float.encode_text(&PgValue::Float8(v)).unwrap().unwrap();
            assert_eq!(float.decode(&text).unwrap(), PgValue::Float8(v));
        }
        match float.decode("NaN").unwrap() {
            PgValue::Float8(v) => assert!(v.is_nan()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cidr_encodes_prefix() {
        let registry = TypeRegistry::new();
        let cidr = registry.get(Oid::CIDR).unwrap();
        let value = PgValue::from("10.1.2.3".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(cidr.encode_text(&value).unwrap().as_deref(), Some("10.1.2.3/32"));
    }

    #[test]
    fn test_catalog_row_from_text() {
        let row = CatalogRow::from_text_row(&[
            Some("16400"),
            Some("_mood"),
            Some("16399"),
            Some(","),
            None,
            Some("b"),
            Some("0"),
        ])
        .unwrap();
        assert_eq!(row.oid, Oid(16400));
        assert_eq!(row.element, Oid(16399));
        assert_eq!(row.range_subtype, None);
        assert_eq!(row.kind_tag, 'b');
        assert!(CatalogRow::from_text_row(&[Some("x")]).is_err());
        assert!(catalog_query(&[Oid(16400), Oid(16401)]).ends_with("IN (16400, 16401)"));
    }

    #[tokio::test]
    async fn test_array_of_domain_resolved_recursively() {
        let registry = TypeRegistry::new();
        let mut domain = row(16500, "positive_int", 'd');
        domain.base = Oid::INT4;
        let mut array = row(16501, "_positive_int", 'b');
        array.element = Oid(16500);
        let mut catalog = FakeCatalog::new(vec![domain, array]);

        let descriptor = registry.lookup(Oid(16501), &mut catalog).await;
        assert_eq!(catalog.queries, vec![vec![Oid(16501)], vec![Oid(16500)]]);
        assert_eq!(
            descriptor.decode("{1,2}").unwrap(),
            PgValue::Array(vec![PgValue::Int4(1), PgValue::Int4(2)])
        );

        let element = descriptor.element_or_base().unwrap();
        assert!(Arc::ptr_eq(element, &registry.get(Oid(16500)).unwrap()));
        let again = registry.lookup(Oid(16501), &mut catalog).await;
        assert!(Arc::ptr_eq(&descriptor, &again));
        assert_eq!(catalog.queries.len(), 2);
        assert!(registry.diagnostics().is_empty());
    }

    #[tokio::test]
    async fn test_extension_and_user_types() {
        let registry = TypeRegistry::new();
        let mut range = row(16600, "floatrange", 'r');
        range.range_subtype = Some(Oid::FLOAT8);
        let mut catalog = FakeCatalog::new(vec![
            row(16601, "hstore", 'b'),
            row(16602, "mood", 'e'),
            row(16603, "pair", 'c'),
            range,
        ]);
        registry
            .load(&[Oid(16600), Oid(16601), Oid(16602), Oid(16603)], &mut catalog)
            .await
            .unwrap();
        assert_eq!(catalog.queries.len(), 1);

        let hstore = registry.get(Oid(16601)).unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("a".to_string(), None);
        expected.insert("b,c".to_string(), Some("d\"e".to_string()));
        let text = hstore.encode_text(&PgValue::Hstore(expected.clone())).unwrap().unwrap();
        assert_eq!(hstore.decode(&text).unwrap(), PgValue::Hstore(expected));

        assert_eq!(
            registry.get(Oid(16602)).unwrap().decode("happy").unwrap(),
            PgValue::Text("happy".into())
        );
        assert_eq!(
            registry.get(Oid(16603)).unwrap().decode("(1,)").unwrap(),
            PgValue::Record(vec![PgValue::Text("1".into()), PgValue::Null])
        );
        match registry.get(Oid(16600)).unwrap().decode("(,Infinity)").unwrap() {
            PgValue::Range(r) => {
                assert_eq!(r.lower, None);
                assert_eq!(r.upper, Some(PgValue::Float8(f64::INFINITY)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_type_degrades_to_passthrough() {
        let registry = TypeRegistry::new();
        let mut catalog = FakeCatalog::new(vec![row(16700, "ltree", 'b')]);
        let descriptor = registry.lookup_column(Oid(16700), Some("path"), &mut catalog).await;
        assert!(descriptor.is_passthrough());
        assert_eq!(descriptor.decode("a.b.c").unwrap(), PgValue::Text("a.b.c".into()));
        assert_eq!(
            registry.diagnostics(),
            vec![TypeDiagnostic {
                oid: Oid(16700),
                column: Some("path".into()),
            }]
        );

        // registered once, no second warning or query
        registry.lookup(Oid(16700), &mut catalog).await;
        assert_eq!(registry.diagnostics().len(), 1);
        assert_eq!(catalog.queries.len(), 1);
    }

    #[tokio::test]
    async fn test_catalog_failure_is_retried_on_next_lookup() {
        let registry = TypeRegistry::new();
        let mut array = row(16801, "_int4x", 'b');
        array.element = Oid::INT4;
        let mut catalog = FakeCatalog::new(vec![array]);
        catalog.fail = true;

        let descriptor = registry.lookup(Oid(16801), &mut catalog).await;
        assert!(descriptor.is_passthrough());
        assert!(!registry.contains(Oid(16801)));
        assert_eq!(registry.diagnostics().len(), 1);

        catalog.fail = false;
        let descriptor = registry.lookup(Oid(16801), &mut catalog).await;
        assert!(!descriptor.is_passthrough());
        assert_eq!(
            descriptor.decode("{1,2}").unwrap(),
            PgValue::Array(vec![PgValue::Int4(1), PgValue::Int4(2)])
        );
        assert_eq!(catalog.queries.len(), 2);
        assert_eq!(registry.diagnostics().len(), 1);
    }
}
