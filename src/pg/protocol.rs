//! PostgreSQL wire protocol message encoding and decoding.
//!
//! Only the v3 messages the execution core needs: startup and
//! authentication, simple query, and the extended-query quintet
//! (Parse/Bind/Describe/Execute/Sync).
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::{Oid, WireValue};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

/// A bound parameter: its declared type plus its wire bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedParam {
    pub type_oid: Oid,
    pub value: WireValue,
}

impl EncodedParam {
    pub fn format(&self) -> Format {
        match self.value {
            WireValue::Binary(_) => Format::Binary,
            _ => Format::Text,
        }
    }

    fn data(&self) -> Option<&[u8]> {
        match &self.value {
            WireValue::Null => None,
            WireValue::Text(s) => Some(s.as_bytes()),
            WireValue::Binary(b) => Some(b),
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    /// Reject messages the wire format cannot represent. Checked before
    /// anything is written.
    fn validate(&self) -> PgResult<()> {
        Ok(())
    }

    fn encode(&self) -> BytesMut;
}

/// Parameter counts travel as an Int16.
fn check_param_count(count: usize) -> PgResult<()> {
    if count > i16::MAX as usize {
        return Err(PgError::Protocol(format!(
            "{} parameters exceed the protocol limit of {}",
            count,
            i16::MAX
        )));
    }
    Ok(())
}

/// Write a tagged message; the length field is patched in afterwards.
fn tagged(tag: u8, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(tag);
    buf.put_i32(0);
    body(&mut buf);
    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        // Untagged: the length comes first.
        let mut buf = BytesMut::new();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);
        put_cstr(&mut buf, "user");
        put_cstr(&mut buf, &self.user);
        if let Some(db) = &self.database {
            put_cstr(&mut buf, "database");
            put_cstr(&mut buf, db);
        }
        for (key, value) in &self.options {
            put_cstr(&mut buf, key);
            put_cstr(&mut buf, value);
        }
        buf.put_u8(0);
        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());
        buf
    }
}

/// Password message (cleartext or MD5)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| put_cstr(buf, &self.password))
    }
}

/// First SCRAM message, naming the mechanism
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| {
            put_cstr(buf, &self.mechanism);
            buf.put_i32(self.data.len() as i32);
            buf.put_slice(&self.data);
        })
    }
}

/// Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| buf.put_slice(&self.data))
    }
}

/// Simple query message ('Q'); may hold several `;`-separated statements
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'Q', |buf| put_cstr(buf, self.query))
    }
}

/// Parse message ('P'); an empty name targets the unnamed statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn validate(&self) -> PgResult<()> {
        check_param_count(self.param_types.len())
    }

    fn encode(&self) -> BytesMut {
        tagged(b'P', |buf| {
            put_cstr(buf, self.name);
            put_cstr(buf, self.query);
            buf.put_i16(self.param_types.len() as i16);
            for oid in self.param_types {
                buf.put_i32(oid.as_i32());
            }
        })
    }
}

/// Bind message ('B'). Parameter formats are sent per parameter; results are
/// always requested in text format.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [EncodedParam],
}

impl FrontendMessage for BindMessage<'_> {
    fn validate(&self) -> PgResult<()> {
        check_param_count(self.params.len())
    }

    fn encode(&self) -> BytesMut {
        tagged(b'B', |buf| {
            put_cstr(buf, self.portal);
            put_cstr(buf, self.statement);

            buf.put_i16(self.params.len() as i16);
            for param in self.params {
                buf.put_i16(param.format() as i16);
            }

            buf.put_i16(self.params.len() as i16);
            for param in self.params {
                match param.data() {
                    None => buf.put_i32(-1),
                    Some(data) => {
                        buf.put_i32(data.len() as i32);
                        buf.put_slice(data);
                    }
                }
            }

            // zero result format codes: everything comes back as text
            buf.put_i16(0);
        })
    }
}

/// Describe message ('D') for a statement (`b'S'`) or portal (`b'P'`)
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'D', |buf| {
            buf.put_u8(self.kind);
            put_cstr(buf, self.name);
        })
    }
}

/// Execute message ('E'); `max_rows` 0 means no limit
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'E', |buf| {
            put_cstr(buf, self.portal);
            buf.put_i32(self.max_rows);
        })
    }
}

/// Sync message ('S'), closes an extended-query cycle
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'S', |_| {})
    }
}

/// Terminate message ('X')
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'X', |_| {})
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

impl FieldDescription {
    /// A text-format column of the given type, as seen in test fixtures and
    /// simple results.
    pub fn new(name: impl Into<String>, type_oid: Oid) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_attr: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: Format::Text,
        }
    }
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    NoData,
    ParameterDescription { type_oids: Vec<Oid> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Decode one complete message (type byte, length, body).
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 || buf.remaining() < len as usize - 4 {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let mut body = buf.split_to(len as usize - 4);
        match msg_type {
            b'R' => Self::decode_auth(&mut body),
            b'T' => Self::decode_row_description(&mut body),
            b'D' => Self::decode_data_row(&mut body),
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: read_cstring(&mut body)?,
            }),
            b'Z' => {
                need(&body, 1)?;
                Ok(BackendMessage::ReadyForQuery {
                    status: TransactionStatus::from(body.get_u8()),
                })
            }
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(&mut body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(&mut body)?,
            }),
            b'S' => Ok(BackendMessage::ParameterStatus {
                name: read_cstring(&mut body)?,
                value: read_cstring(&mut body)?,
            }),
            b'K' => {
                need(&body, 8)?;
                Ok(BackendMessage::BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                })
            }
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b't' => Self::decode_parameter_description(&mut body),
            b'A' => {
                need(&body, 4)?;
                Ok(BackendMessage::NotificationResponse {
                    process_id: body.get_i32(),
                    channel: read_cstring(&mut body)?,
                    payload: read_cstring(&mut body)?,
                })
            }
            _ => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_auth(body: &mut Bytes) -> PgResult<Self> {
        need(body, 4)?;
        match body.get_i32() {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                need(body, 4)?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue {
                data: body.split_off(0),
            }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal {
                data: body.split_off(0),
            }),
            other => Err(PgError::Auth(format!(
                "Unsupported authentication request: {}",
                other
            ))),
        }
    }

    fn decode_row_description(body: &mut Bytes) -> PgResult<Self> {
        need(body, 2)?;
        let num_fields = body.get_i16().max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(body)?;
            need(body, 18)?;
            fields.push(FieldDescription {
                name,
                table_oid: body.get_i32(),
                column_attr: body.get_i16(),
                type_oid: Oid::from_i32(body.get_i32()),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: if body.get_i16() == 0 {
                    Format::Text
                } else {
                    Format::Binary
                },
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut Bytes) -> PgResult<Self> {
        need(body, 2)?;
        let num_cols = body.get_i16().max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            need(body, 4)?;
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                need(body, len as usize)?;
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(body: &mut Bytes) -> PgResult<Self> {
        need(body, 2)?;
        let num_params = body.get_i16().max(0) as usize;
        need(body, num_params * 4)?;
        let type_oids = (0..num_params)
            .map(|_| Oid::from_i32(body.get_i32()))
            .collect();
        Ok(BackendMessage::ParameterDescription { type_oids })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn need(buf: &Bytes, n: usize) -> PgResult<()> {
    if buf.remaining() < n {
        return Err(PgError::Protocol("Truncated message body".to_string()));
    }
    Ok(())
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(body: &mut Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();
    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        fields.insert(field_type, read_cstring(body)?);
    }
    Ok(fields)
}

/// Parse the affected row count out of a command tag
/// (`INSERT 0 5`, `UPDATE 3`, `SELECT 10`).
pub fn parse_rows_affected(tag: &str) -> Option<u64> {
    let mut parts = tag.split_whitespace();
    match parts.next()? {
        "INSERT" => parts.nth(1)?.parse().ok(),
        "UPDATE" | "DELETE" | "SELECT" | "MOVE" | "FETCH" | "COPY" | "MERGE" => {
            parts.next()?.parse().ok()
        }
        _ => None,
    }
}
