//! Error types for pgcore.

use std::collections::HashMap;
use thiserror::Error;

/// Result type for pgcore operations.
pub type Result<T> = core::result::Result<T, Error>;

/// PostgreSQL error/notice field type codes.
pub mod field_type {
    pub const SEVERITY: u8 = b'S';
    pub const SEVERITY_V: u8 = b'V';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
    pub const INTERNAL_POSITION: u8 = b'p';
    pub const INTERNAL_QUERY: u8 = b'q';
    pub const WHERE: u8 = b'W';
    pub const SCHEMA: u8 = b's';
    pub const TABLE: u8 = b't';
    pub const COLUMN: u8 = b'c';
    pub const DATA_TYPE: u8 = b'd';
    pub const CONSTRAINT: u8 = b'n';
    pub const FILE: u8 = b'F';
    pub const LINE: u8 = b'L';
    pub const ROUTINE: u8 = b'R';
}

/// A decoded PostgreSQL `ErrorResponse`/`NoticeResponse` body.
///
/// `S`, `M`, `D`, `H`, `W`, `s`, `t`, `c`, `d`, `n` are exposed as named
/// accessors (the fields a caller is expected to show a user); the rest
/// (`V`, `C`, `P`, `p`, `q`, `F`, `L`, `R`) are retained but only reachable
/// via [`ServerError::get`].
#[derive(Debug, Clone)]
pub struct ServerError(HashMap<u8, String>);

impl ServerError {
    pub(crate) fn new(fields: HashMap<u8, String>) -> Self {
        Self(fields)
    }

    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG.
    pub fn severity(&self) -> &str {
        self.0.get(&field_type::SEVERITY).map_or("", String::as_str)
    }

    /// Non-localized severity (PostgreSQL 9.6+); falls back to [`Self::severity`].
    pub fn severity_v(&self) -> &str {
        self.0
            .get(&field_type::SEVERITY_V)
            .map_or_else(|| self.severity(), String::as_str)
    }

    /// SQLSTATE error code (5 characters).
    pub fn code(&self) -> &str {
        self.0.get(&field_type::CODE).map_or("", String::as_str)
    }

    /// Primary human-readable error message.
    pub fn message(&self) -> &str {
        self.0.get(&field_type::MESSAGE).map_or("", String::as_str)
    }

    /// Detailed explanation, if the server sent one.
    pub fn detail(&self) -> Option<&str> {
        self.0.get(&field_type::DETAIL).map(String::as_str)
    }

    /// Suggestion for fixing the error, if the server sent one.
    pub fn hint(&self) -> Option<&str> {
        self.0.get(&field_type::HINT).map(String::as_str)
    }

    /// Context / call stack ("Where"), if the server sent one.
    pub fn where_(&self) -> Option<&str> {
        self.0.get(&field_type::WHERE).map(String::as_str)
    }

    /// Schema name, if the error is associated with one.
    pub fn schema(&self) -> Option<&str> {
        self.0.get(&field_type::SCHEMA).map(String::as_str)
    }

    /// Table name, if the error is associated with one.
    pub fn table(&self) -> Option<&str> {
        self.0.get(&field_type::TABLE).map(String::as_str)
    }

    /// Column name, if the error is associated with one.
    pub fn column(&self) -> Option<&str> {
        self.0.get(&field_type::COLUMN).map(String::as_str)
    }

    /// Data type name, if the error is associated with one.
    pub fn data_type(&self) -> Option<&str> {
        self.0.get(&field_type::DATA_TYPE).map(String::as_str)
    }

    /// Constraint name, if the error is associated with one.
    pub fn constraint(&self) -> Option<&str> {
        self.0.get(&field_type::CONSTRAINT).map(String::as_str)
    }

    /// Raw field lookup by PostgreSQL field type code (e.g. `C`, `F`, `L`,
    /// `R`, which have no named accessor).
    pub fn get(&self, field_type: u8) -> Option<&str> {
        self.0.get(&field_type).map(String::as_str)
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (SQLSTATE {})",
            self.severity(),
            self.message(),
            self.code()
        )?;
        if let Some(detail) = self.detail() {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = self.hint() {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

/// Error type for pgcore operations.
#[derive(Debug, Error)]
pub enum Error {
    /// ErrorResponse surfaced from the server.
    #[error("PostgreSQL error: {0}")]
    Server(ServerError),

    /// Malformed message, unexpected tag for the current state, bad length.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket read/write failure or unexpected EOF.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unsupported mechanism, failed challenge, unexpected auth sub-code.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// TLS handshake failure.
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Parameter arity mismatch, operation on a closed session, and other
    /// caller-side misuse.
    #[error("interface error: {0}")]
    Interface(String),

    /// A result field could not be decoded as its logical type.
    #[error("decode error: {0}")]
    Decode(String),
}

impl Error {
    /// True if the failure means the underlying socket can no longer be
    /// reused: I/O failures, and FATAL/PANIC server errors.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Server(err) => matches!(err.severity_v(), "FATAL" | "PANIC"),
            _ => false,
        }
    }

    /// SQLSTATE code, if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(err) => Some(err.code()),
            _ => None,
        }
    }

    pub(crate) fn server(fields: HashMap<u8, String>) -> Self {
        Error::Server(ServerError::new(fields))
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized> From<zerocopy::error::CastError<Src, Dst>>
    for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}
