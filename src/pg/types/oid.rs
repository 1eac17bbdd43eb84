//! Server type identifiers.

use std::fmt;

/// PostgreSQL type object identifier (OID).
///
/// Builtin identifiers are fixed by the server; everything else (extension
/// types, domains, user-defined arrays and ranges) is assigned by the catalog
/// and resolved at runtime through the type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub i32);

impl Oid {
    /// Sentinel for "unspecified", lets the server infer a parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    // Boolean and binary
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const TEXT: Oid = Oid(25);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const OID_TYPE: Oid = Oid(26);

    // Floating point and exact numerics
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const MONEY: Oid = Oid(790);
    pub const NUMERIC: Oid = Oid(1700);

    // Structured text
    pub const JSON: Oid = Oid(114);
    pub const XML: Oid = Oid(142);
    pub const JSONB: Oid = Oid(3802);

    // Geometry
    pub const POINT: Oid = Oid(600);

    // Network types
    pub const CIDR: Oid = Oid(650);
    pub const MACADDR: Oid = Oid(829);
    pub const INET: Oid = Oid(869);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);

    pub const UUID: Oid = Oid(2950);

    // Array types (the common ones)
    pub const JSON_ARRAY: Oid = Oid(199);
    pub const XML_ARRAY: Oid = Oid(143);
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const BPCHAR_ARRAY: Oid = Oid(1014);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const POINT_ARRAY: Oid = Oid(1017);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const INET_ARRAY: Oid = Oid(1041);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const NUMERIC_ARRAY: Oid = Oid(1231);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    // Builtin range types
    pub const INT4RANGE: Oid = Oid(3904);
    pub const NUMRANGE: Oid = Oid(3906);
    pub const TSRANGE: Oid = Oid(3908);
    pub const TSTZRANGE: Oid = Oid(3910);
    pub const DATERANGE: Oid = Oid(3912);
    pub const INT8RANGE: Oid = Oid(3926);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
