//! Text-format codecs.
//!
//! Parsers and printers for the server's textual representations. Every
//! parser here is the authoritative reader for the quoting produced by the
//! matching printer, so `parse(format(v)) == v` for representable values.

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::net::IpAddr;
use std::str::Chars;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use super::value::{PgInet, PgRange, PgValue};
use crate::pg::error::{PgError, PgResult};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const TIMESTAMPTZ_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

// ============================================================================
// Generic printer
// ============================================================================

/// Render a value in text format without any type metadata.
///
/// Returns `None` for NULL. Containers are rendered recursively with the
/// default delimiter.
pub fn format_value(value: &PgValue) -> Option<String> {
    let text = match value {
        PgValue::Null => return None,
        PgValue::Bool(v) => (if *v { "t" } else { "f" }).to_string(),
        PgValue::Int2(v) => v.to_string(),
        PgValue::Int4(v) => v.to_string(),
        PgValue::Int8(v) => v.to_string(),
        PgValue::Float4(v) => format_float(f64::from(*v)),
        PgValue::Float8(v) => format_float(*v),
        PgValue::Numeric(v) | PgValue::Text(v) => v.clone(),
        PgValue::Bytea(v) => format_bytea(v),
        PgValue::Uuid(v) => v.hyphenated().to_string(),
        PgValue::Date(v) => v.format(DATE_FORMAT).to_string(),
        PgValue::Time(v) => v.format(TIME_FORMAT).to_string(),
        PgValue::Timestamp(v) => v.format(TIMESTAMP_FORMAT).to_string(),
        PgValue::TimestampTz(v) => format!("{}+00", v.naive_utc().format(TIMESTAMP_FORMAT)),
        PgValue::Json(v) => v.to_string(),
        PgValue::Inet(v) => format_inet(v),
        PgValue::Point(x, y) => format_point(*x, *y),
        PgValue::Hstore(map) => format_hstore(map),
        PgValue::Array(items) => format_array(items, ',', &mut |v| Ok(format_value(v)))
            .unwrap_or_default(),
        PgValue::Range(range) => format_range(range, &mut |v| Ok(format_value(v)))
            .unwrap_or_default(),
        PgValue::Record(fields) => format_record(fields, &mut |v| Ok(format_value(v)))
            .unwrap_or_default(),
    };
    Some(text)
}

// ============================================================================
// Scalars
// ============================================================================

pub fn parse_bool(text: &str) -> PgResult<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "1" | "y" | "yes" | "on" => Ok(true),
        "f" | "false" | "0" | "n" | "no" | "off" => Ok(false),
        other => Err(PgError::Type(format!("Invalid BOOL: {}", other))),
    }
}

/// Parse a float, honoring the server's non-finite tokens first.
pub fn parse_float(text: &str) -> PgResult<f64> {
    match text {
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        _ => text
            .trim()
            .parse::<f64>()
            .map_err(|e| PgError::Type(format!("Invalid FLOAT: {}", e))),
    }
}

pub fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        v.to_string()
    }
}

pub fn parse_date(text: &str) -> PgResult<NaiveDate> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map_err(|e| PgError::Type(format!("Invalid DATE {:?}: {}", text, e)))
}

pub fn parse_time(text: &str) -> PgResult<NaiveTime> {
    NaiveTime::parse_from_str(text, TIME_FORMAT)
        .map_err(|e| PgError::Type(format!("Invalid TIME {:?}: {}", text, e)))
}

pub fn parse_timestamp(text: &str) -> PgResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map_err(|e| PgError::Type(format!("Invalid TIMESTAMP {:?}: {}", text, e)))
}

pub fn parse_timestamptz(text: &str) -> PgResult<DateTime<Utc>> {
    DateTime::parse_from_str(text, TIMESTAMPTZ_FORMAT)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PgError::Type(format!("Invalid TIMESTAMPTZ {:?}: {}", text, e)))
}

/// `infinity` and `-infinity` are valid date/time values with no chrono
/// counterpart.
pub fn is_infinite_datetime(text: &str) -> bool {
    matches!(text, "infinity" | "-infinity")
}

// ============================================================================
// Byte sequences
// ============================================================================

/// Decode `\x`-hex, `0x`-hex or escape-format byte text.
pub fn parse_bytea(text: &str) -> PgResult<Vec<u8>> {
    if let Some(hex) = text.strip_prefix("\\x").or_else(|| text.strip_prefix("0x")) {
        return decode_hex(hex);
    }
    decode_bytea_escape(text.as_bytes())
}

/// Render bytes in hex format.
pub fn format_bytea(data: &[u8]) -> String {
    let mut out = String::with_capacity(2 + data.len() * 2);
    out.push_str("\\x");
    for b in data {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn decode_hex(hex: &str) -> PgResult<Vec<u8>> {
    let digits = hex.as_bytes();
    if digits.len() % 2 != 0 {
        return Err(PgError::Type("Odd number of hex digits in BYTEA".to_string()));
    }
    digits
        .chunks(2)
        .map(|pair| Ok((hex_value(pair[0])? << 4) | hex_value(pair[1])?))
        .collect()
}

fn hex_value(c: u8) -> PgResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(PgError::Type(format!("Invalid hex digit in BYTEA: {:?}", c as char))),
    }
}

fn decode_bytea_escape(input: &[u8]) -> PgResult<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != b'\\' {
            out.push(input[i]);
            i += 1;
            continue;
        }
        if input.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
            continue;
        }
        let octal = input
            .get(i + 1..i + 4)
            .filter(|d| d.iter().all(|c| (b'0'..=b'7').contains(c)))
            .ok_or_else(|| PgError::Type("Invalid escape sequence in BYTEA".to_string()))?;
        let value = octal
            .iter()
            .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
        let byte = u8::try_from(value)
            .map_err(|_| PgError::Type("Octal escape out of range in BYTEA".to_string()))?;
        out.push(byte);
        i += 4;
    }
    Ok(out)
}

// ============================================================================
// Network addresses and geometry
// ============================================================================

/// Parse `address[/prefix]`. A bare address is a single host.
pub fn parse_inet(text: &str) -> PgResult<PgInet> {
    let (addr, prefix) = match text.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (text, None),
    };
    let addr: IpAddr = addr
        .trim()
        .parse()
        .map_err(|e| PgError::Type(format!("Invalid INET {:?}: {}", text, e)))?;
    match prefix {
        Some(p) => {
            let p: u8 = p
                .trim()
                .parse()
                .map_err(|e| PgError::Type(format!("Invalid INET prefix {:?}: {}", text, e)))?;
            let bits = if addr.is_ipv4() { 32 } else { 128 };
            if p > bits {
                return Err(PgError::Type(format!(
                    "Invalid INET prefix {:?}: longer than {} bits",
                    text, bits
                )));
            }
            Ok(PgInet::with_prefix(addr, p))
        }
        None => Ok(PgInet::host(addr)),
    }
}

/// Always carries the prefix suffix, computed from the netmask.
pub fn format_inet(inet: &PgInet) -> String {
    format!("{}/{}", inet.addr, inet.prefix_len())
}

pub fn parse_point(text: &str) -> PgResult<(f64, f64)> {
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| PgError::Type(format!("Invalid POINT: {:?}", text)))?;
    let (x, y) = inner
        .split_once(',')
        .ok_or_else(|| PgError::Type(format!("Invalid POINT: {:?}", text)))?;
    Ok((parse_float(x.trim())?, parse_float(y.trim())?))
}

pub fn format_point(x: f64, y: f64) -> String {
    format!("({},{})", format_float(x), format_float(y))
}

// ============================================================================
// Scanner shared by the container parsers
// ============================================================================

struct Scanner<'a> {
    source: &'a str,
    chars: Peekable<Chars<'a>>,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().peekable(),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        self.chars.next()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn expect(&mut self, want: char) -> PgResult<()> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            other => Err(self.error(&format!("expected {:?}, found {:?}", want, other))),
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_whitespace();
        self.peek().is_none()
    }

    /// Read a double-quoted token; the opening quote is the next char.
    /// `doubled` also accepts `""` as an escaped quote.
    fn quoted(&mut self, doubled: bool) -> PgResult<String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some('"') if doubled && self.peek() == Some('"') => {
                    self.bump();
                    out.push('"');
                }
                Some('"') => return Ok(out),
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated quoted value")),
            }
        }
    }

    /// Read an unquoted token up to (not including) any of `stops`.
    fn unquoted(&mut self, stops: &[char]) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if stops.contains(&c) {
                break;
            }
            self.bump();
            if c == '\\' {
                if let Some(escaped) = self.bump() {
                    out.push(escaped);
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    fn error(&self, what: &str) -> PgError {
        PgError::Type(format!("Malformed literal {:?}: {}", self.source, what))
    }
}

fn needs_quotes(text: &str, reserved: &[char]) -> bool {
    text.is_empty()
        || text.eq_ignore_ascii_case("NULL")
        || text
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\' || reserved.contains(&c))
}

fn quote_backslashed(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

// ============================================================================
// Arrays
// ============================================================================

/// One element of a parsed array literal, still in text form.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayElement {
    Null,
    Value(String),
    Nested(Vec<ArrayElement>),
}

/// Render `{e1,e2,...}`, encoding each element with `encode_element`.
///
/// Nested `PgValue::Array` elements become nested braces.
pub fn format_array<F>(items: &[PgValue], delimiter: char, encode_element: &mut F) -> PgResult<String>
where
    F: FnMut(&PgValue) -> PgResult<Option<String>>,
{
    let reserved = [delimiter, '{', '}'];
    let mut out = String::from("{");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(delimiter);
        }
        match item {
            PgValue::Array(nested) => {
                out.push_str(&format_array(nested, delimiter, encode_element)?);
            }
            _ => match encode_element(item)? {
                None => out.push_str("NULL"),
                Some(text) if needs_quotes(&text, &reserved) => {
                    out.push_str(&quote_backslashed(&text))
                }
                Some(text) => out.push_str(&text),
            },
        }
    }
    out.push('}');
    Ok(out)
}

/// Parse an array literal, skipping an optional `[lb:ub]=` dimension prefix.
pub fn parse_array(text: &str, delimiter: char) -> PgResult<Vec<ArrayElement>> {
    let mut body = text.trim();
    if body.starts_with('[') {
        if let Some(eq) = body.find('=') {
            body = &body[eq + 1..];
        }
    }
    let mut scanner = Scanner::new(body);
    scanner.skip_whitespace();
    let items = parse_array_level(&mut scanner, delimiter)?;
    if !scanner.at_end() {
        return Err(scanner.error("trailing characters after array"));
    }
    Ok(items)
}

fn parse_array_level(scanner: &mut Scanner<'_>, delimiter: char) -> PgResult<Vec<ArrayElement>> {
    scanner.expect('{')?;
    let mut items = Vec::new();
    scanner.skip_whitespace();
    if scanner.peek() == Some('}') {
        scanner.bump();
        return Ok(items);
    }
    loop {
        scanner.skip_whitespace();
        let item = match scanner.peek() {
            Some('{') => ArrayElement::Nested(parse_array_level(scanner, delimiter)?),
            Some('"') => ArrayElement::Value(scanner.quoted(false)?),
            Some(_) => {
                let raw = scanner.unquoted(&[delimiter, '}']);
                let raw = raw.trim_end();
                if raw.eq_ignore_ascii_case("NULL") {
                    ArrayElement::Null
                } else {
                    ArrayElement::Value(raw.to_string())
                }
            }
            None => return Err(scanner.error("unterminated array")),
        };
        items.push(item);
        scanner.skip_whitespace();
        match scanner.bump() {
            Some(c) if c == delimiter => continue,
            Some('}') => return Ok(items),
            other => {
                return Err(scanner.error(&format!("unexpected {:?} in array", other)));
            }
        }
    }
}

// ============================================================================
// Ranges
// ============================================================================

/// A parsed range literal with its bounds still in text form.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeText {
    pub lower: Option<String>,
    pub upper: Option<String>,
    pub lower_inclusive: bool,
    pub upper_inclusive: bool,
    pub empty: bool,
}

const RANGE_RESERVED: [char; 5] = [',', '(', ')', '[', ']'];

/// Render `[lower,upper)` and friends; an unbounded end renders as nothing.
pub fn format_range<F>(range: &PgRange, encode_bound: &mut F) -> PgResult<String>
where
    F: FnMut(&PgValue) -> PgResult<Option<String>>,
{
    if range.empty {
        return Ok("empty".to_string());
    }
    let mut bound = |value: &Option<PgValue>| -> PgResult<String> {
        let text = match value {
            Some(v) => encode_bound(v)?,
            None => None,
        };
        Ok(match text {
            None => String::new(),
            Some(t) if needs_quotes(&t, &RANGE_RESERVED) => quote_backslashed(&t),
            Some(t) => t,
        })
    };
    let lower = bound(&range.lower)?;
    let upper = bound(&range.upper)?;
    Ok(format!(
        "{}{},{}{}",
        if range.lower_inclusive { '[' } else { '(' },
        lower,
        upper,
        if range.upper_inclusive { ']' } else { ')' },
    ))
}

pub fn parse_range(text: &str) -> PgResult<RangeText> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("empty") {
        return Ok(RangeText {
            lower: None,
            upper: None,
            lower_inclusive: false,
            upper_inclusive: false,
            empty: true,
        });
    }
    let mut scanner = Scanner::new(text);
    let lower_inclusive = match scanner.bump() {
        Some('[') => true,
        Some('(') => false,
        _ => return Err(scanner.error("range must start with '[' or '('")),
    };
    let lower = parse_range_bound(&mut scanner, &[','])?;
    scanner.expect(',')?;
    let upper = parse_range_bound(&mut scanner, &[']', ')'])?;
    let upper_inclusive = match scanner.bump() {
        Some(']') => true,
        Some(')') => false,
        _ => return Err(scanner.error("range must end with ']' or ')'")),
    };
    if !scanner.at_end() {
        return Err(scanner.error("trailing characters after range"));
    }
    Ok(RangeText {
        lower,
        upper,
        lower_inclusive,
        upper_inclusive,
        empty: false,
    })
}

fn parse_range_bound(scanner: &mut Scanner<'_>, stops: &[char]) -> PgResult<Option<String>> {
    if scanner.peek() == Some('"') {
        return scanner.quoted(true).map(Some);
    }
    let raw = scanner.unquoted(stops);
    Ok((!raw.is_empty()).then_some(raw))
}

// ============================================================================
// Key/value maps (hstore)
// ============================================================================

const HSTORE_RESERVED: [char; 3] = [',', '=', '>'];

/// Render `k=>v` pairs, quoting either side when it holds reserved characters.
pub fn format_hstore(map: &BTreeMap<String, Option<String>>) -> String {
    let quote = |text: &str| {
        if needs_quotes(text, &HSTORE_RESERVED) {
            quote_backslashed(text)
        } else {
            text.to_string()
        }
    };
    map.iter()
        .map(|(k, v)| match v {
            Some(v) => format!("{}=>{}", quote(k), quote(v)),
            None => format!("{}=>NULL", quote(k)),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse `"k"=>"v", k2=>NULL`. An unquoted `NULL` value is absent.
pub fn parse_hstore(text: &str) -> PgResult<BTreeMap<String, Option<String>>> {
    let mut map = BTreeMap::new();
    let mut scanner = Scanner::new(text);
    loop {
        if scanner.at_end() {
            return Ok(map);
        }
        let key = match scanner.peek() {
            Some('"') => scanner.quoted(false)?,
            _ => scanner.unquoted(&['=', ',']).trim_end().to_string(),
        };
        scanner.skip_whitespace();
        scanner.expect('=')?;
        scanner.expect('>')?;
        scanner.skip_whitespace();
        let value = match scanner.peek() {
            Some('"') => Some(scanner.quoted(false)?),
            _ => {
                let raw = scanner.unquoted(&[',']);
                let raw = raw.trim_end();
                if raw.eq_ignore_ascii_case("NULL") {
                    None
                } else {
                    Some(raw.to_string())
                }
            }
        };
        map.insert(key, value);
        scanner.skip_whitespace();
        match scanner.bump() {
            Some(',') | None => {}
            Some(c) => return Err(scanner.error(&format!("unexpected {:?} in hstore", c))),
        }
    }
}

// ============================================================================
// Composite records
// ============================================================================

const RECORD_RESERVED: [char; 3] = [',', '(', ')'];

/// Render `(f1,f2,...)`; NULL fields render as nothing.
pub fn format_record<F>(fields: &[PgValue], encode_field: &mut F) -> PgResult<String>
where
    F: FnMut(&PgValue) -> PgResult<Option<String>>,
{
    let mut out = String::from("(");
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match encode_field(field)? {
            None => {}
            Some(t) if needs_record_quotes(&t) => out.push_str(&quote_backslashed(&t)),
            Some(t) => out.push_str(&t),
        }
    }
    out.push(')');
    Ok(out)
}

fn needs_record_quotes(text: &str) -> bool {
    text.is_empty()
        || text
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\' || RECORD_RESERVED.contains(&c))
}

/// Parse a record literal into its fields; an empty unquoted field is NULL.
pub fn parse_record(text: &str) -> PgResult<Vec<Option<String>>> {
    let mut scanner = Scanner::new(text.trim());
    scanner.expect('(')?;
    let mut fields = Vec::new();
    if scanner.peek() == Some(')') {
        scanner.bump();
        return Ok(fields);
    }
    loop {
        let field = if scanner.peek() == Some('"') {
            Some(scanner.quoted(true)?)
        } else {
            let raw = scanner.unquoted(&[',', ')']);
            (!raw.is_empty()).then_some(raw)
        };
        fields.push(field);
        match scanner.bump() {
            Some(',') => continue,
            Some(')') => break,
            other => return Err(scanner.error(&format!("unexpected {:?} in record", other))),
        }
    }
    if !scanner.at_end() {
        return Err(scanner.error("trailing characters after record"));
    }
    Ok(fields)
}
