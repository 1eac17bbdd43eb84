//! Native value model for parameters and decoded cells.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

use super::oid::Oid;

/// A PostgreSQL value.
///
/// Byte sequences decode to `Bytea` only, never to `Text`, so binary data is
/// not mistaken for character data downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Arbitrary precision numbers keep their exact server text.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Inet(PgInet),
    Point(f64, f64),
    Hstore(BTreeMap<String, Option<String>>),
    Array(Vec<PgValue>),
    Range(Box<PgRange>),
    Record(Vec<PgValue>),
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) | PgValue::Numeric(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(i64::from(*v)),
            PgValue::Int4(v) => Some(i64::from(*v)),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PgValue::Float4(v) => Some(f64::from(*v)),
            PgValue::Float8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PgValue::Bytea(v) => Some(v),
            _ => None,
        }
    }

    /// Type identifier inferred from the value itself.
    ///
    /// Used when a parameter is bound without column type metadata.
    /// Containers that cannot be named without catalog help, and NULL, report
    /// `Oid::UNSPECIFIED` so the server infers the type from context.
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Numeric(_) => Oid::NUMERIC,
            PgValue::Text(_) => Oid::UNSPECIFIED,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::TimestampTz(_) => Oid::TIMESTAMPTZ,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Inet(_) => Oid::INET,
            PgValue::Point(..) => Oid::POINT,
            PgValue::Hstore(_)
            | PgValue::Array(_)
            | PgValue::Range(_)
            | PgValue::Record(_) => Oid::UNSPECIFIED,
        }
    }
}

/// A network address together with its netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgInet {
    pub addr: IpAddr,
    pub netmask: IpAddr,
}

impl PgInet {
    /// A single host: the mask covers the whole address.
    pub fn host(addr: IpAddr) -> Self {
        let bits = address_bits(&addr);
        Self::with_prefix(addr, bits)
    }

    /// An address with the given prefix length (clamped to the address width).
    pub fn with_prefix(addr: IpAddr, prefix: u8) -> Self {
        let prefix = prefix.min(address_bits(&addr));
        let netmask = match addr {
            IpAddr::V4(_) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(mask))
            }
            IpAddr::V6(_) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(mask))
            }
        };
        PgInet { addr, netmask }
    }

    /// Prefix length, counted from the set bits of the netmask.
    pub fn prefix_len(&self) -> u8 {
        let ones = match self.netmask {
            IpAddr::V4(m) => u32::from(m).count_ones(),
            IpAddr::V6(m) => u128::from(m).count_ones(),
        };
        ones as u8
    }
}

fn address_bits(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// A range value. `None` bounds are unbounded.
#[derive(Debug, Clone, PartialEq)]
pub struct PgRange {
    pub lower: Option<PgValue>,
    pub upper: Option<PgValue>,
    pub lower_inclusive: bool,
    pub upper_inclusive: bool,
    pub empty: bool,
}

impl PgRange {
    /// The canonical `[lower,upper)` shape.
    pub fn new(lower: Option<PgValue>, upper: Option<PgValue>) -> Self {
        PgRange {
            lower,
            upper,
            lower_inclusive: true,
            upper_inclusive: false,
            empty: false,
        }
    }

    pub fn inclusive(lower: Option<PgValue>, upper: Option<PgValue>) -> Self {
        PgRange {
            upper_inclusive: true,
            ..Self::new(lower, upper)
        }
    }

    pub fn empty() -> Self {
        PgRange {
            lower: None,
            upper: None,
            lower_inclusive: false,
            upper_inclusive: false,
            empty: true,
        }
    }
}

impl From<PgRange> for PgValue {
    fn from(r: PgRange) -> Self {
        PgValue::Range(Box::new(r))
    }
}

impl From<bool> for PgValue {
    fn from(v: bool) -> Self {
        PgValue::Bool(v)
    }
}

impl From<i16> for PgValue {
    fn from(v: i16) -> Self {
        PgValue::Int2(v)
    }
}

impl From<i32> for PgValue {
    fn from(v: i32) -> Self {
        PgValue::Int4(v)
    }
}

impl From<i64> for PgValue {
    fn from(v: i64) -> Self {
        PgValue::Int8(v)
    }
}

impl From<f64> for PgValue {
    fn from(v: f64) -> Self {
        PgValue::Float8(v)
    }
}

impl From<&str> for PgValue {
    fn from(v: &str) -> Self {
        PgValue::Text(v.to_string())
    }
}

impl From<String> for PgValue {
    fn from(v: String) -> Self {
        PgValue::Text(v)
    }
}

impl From<Uuid> for PgValue {
    fn from(v: Uuid) -> Self {
        PgValue::Uuid(v)
    }
}

impl From<serde_json::Value> for PgValue {
    fn from(v: serde_json::Value) -> Self {
        PgValue::Json(v)
    }
}

impl From<IpAddr> for PgValue {
    fn from(v: IpAddr) -> Self {
        PgValue::Inet(PgInet::host(v))
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(PgValue::Null, Into::into)
    }
}

impl<T: Into<PgValue>> From<Vec<T>> for PgValue {
    fn from(v: Vec<T>) -> Self {
        PgValue::Array(v.into_iter().map(Into::into).collect())
    }
}
