//! Error types surfaced to callers of the execution core.
//!
//! Driver-level failures (`PgError`) are translated here once, at the public
//! boundary, so calling code can branch on violation category without parsing
//! server text.

use thiserror::Error;

use crate::pg::error::{
    PgError, FOREIGN_KEY_VIOLATION, INVALID_CATALOG_NAME, UNIQUE_VIOLATION,
};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    #[error("Database does not exist: {0}")]
    NoDatabaseError(String),

    #[error("Unique constraint violated: {message}")]
    RecordNotUnique {
        message: String,
        #[source]
        source: PgError,
    },

    #[error("Foreign key constraint violated: {message}")]
    InvalidForeignKey {
        message: String,
        #[source]
        source: PgError,
    },

    #[error("Statement invalid ({code}): {message}")]
    StatementInvalid {
        code: String,
        message: String,
        sql: Option<String>,
        #[source]
        source: PgError,
    },

    #[error("Type conversion error: {0}")]
    TypeError(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ExecError {
    /// Translate a driver error raised while running `sql`.
    pub fn translate(err: PgError, sql: Option<&str>) -> Self {
        match err {
            PgError::Server { ref code, ref message, .. } => {
                let code = code.clone();
                let message = message.clone();
                match code.as_str() {
                    UNIQUE_VIOLATION => ExecError::RecordNotUnique { message, source: err },
                    FOREIGN_KEY_VIOLATION => ExecError::InvalidForeignKey { message, source: err },
                    _ => ExecError::StatementInvalid {
                        code,
                        message,
                        sql: sql.map(str::to_string),
                        source: err,
                    },
                }
            }
            PgError::Io(e) => ExecError::IoError(e),
            PgError::Type(msg) => ExecError::TypeError(msg),
            PgError::OperationInProgress(_) => ExecError::ProtocolViolation(err.to_string()),
            PgError::Protocol(_) => ExecError::ProtocolViolation(err.to_string()),
            PgError::Auth(_) | PgError::ConnectionClosed => {
                ExecError::ConnectionError(err.to_string())
            }
        }
    }

    /// Translate a failure raised while establishing a connection.
    pub fn from_connect(err: PgError) -> Self {
        match &err {
            PgError::Server { code, message, .. }
                if code == INVALID_CATALOG_NAME || message.contains("does not exist") =>
            {
                ExecError::NoDatabaseError(message.clone())
            }
            PgError::Io(_) | PgError::Auth(_) | PgError::Server { .. } => {
                ExecError::ConnectionError(err.to_string())
            }
            _ => ExecError::translate(err, None),
        }
    }

    /// The SQLSTATE behind this error, when the server produced it.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            ExecError::RecordNotUnique { source, .. }
            | ExecError::InvalidForeignKey { source, .. }
            | ExecError::StatementInvalid { source, .. } => source.sqlstate(),
            _ => None,
        }
    }
}

impl From<PgError> for ExecError {
    fn from(err: PgError) -> Self {
        ExecError::translate(err, None)
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
