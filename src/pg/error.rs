//! Error types for the PostgreSQL wire layer.

use std::collections::HashMap;
use std::fmt;
use std::io;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// SQLSTATE raised when a cached plan no longer matches its result shape.
pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
/// SQLSTATE for a foreign key violation.
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
/// SQLSTATE for a unique constraint violation.
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for a missing database.
pub const INVALID_CATALOG_NAME: &str = "3D000";

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug)]
pub enum PgError {
    /// I/O error during communication.
    Io(io::Error),

    /// Protocol error (unexpected message, invalid format, etc.).
    Protocol(String),

    /// Authentication failed.
    Auth(String),

    /// Server returned an error.
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// Value could not be converted to or from its wire text.
    Type(String),

    /// Connection is closed or in invalid state.
    ConnectionClosed,

    /// A deferred operation was issued while another one was still pending.
    OperationInProgress(String),
}

impl PgError {
    /// Build a server error from ErrorResponse fields.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        PgError::Server {
            severity: fields.get(&b'S').cloned().unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
        }
    }

    /// The SQLSTATE code, for server errors.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Whether the server rejected a cached plan (retryable once, ad-hoc).
    pub fn is_plan_invalidated(&self) -> bool {
        self.sqlstate() == Some(FEATURE_NOT_SUPPORTED)
    }

    /// Whether the server answered with an error (as opposed to a local failure).
    pub fn is_server_error(&self) -> bool {
        matches!(self, PgError::Server { .. })
    }
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgError::Io(e) => write!(f, "I/O error: {}", e),
            PgError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PgError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            PgError::Server {
                severity,
                code,
                message,
                detail,
                hint,
            } => {
                write!(f, "{}: {} ({})", severity, message, code)?;
                if let Some(d) = detail {
                    write!(f, "\nDetail: {}", d)?;
                }
                if let Some(h) = hint {
                    write!(f, "\nHint: {}", h)?;
                }
                Ok(())
            }
            PgError::Type(msg) => write!(f, "Type error: {}", msg),
            PgError::ConnectionClosed => write!(f, "Connection is closed"),
            PgError::OperationInProgress(sql) => {
                write!(f, "another pending operation is already running: {}", sql)
            }
        }
    }
}

impl std::error::Error for PgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PgError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(e)
    }
}
