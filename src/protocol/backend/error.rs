//! Error and notice response messages.

use std::collections::HashMap;

use crate::error::{field_type, Error, Result, ServerError};
use crate::protocol::codec::read_cstr;

fn parse_fields(payload: &[u8]) -> Result<HashMap<u8, String>> {
    let mut fields = HashMap::new();
    let mut data = payload;

    while !data.is_empty() && data[0] != 0 {
        let field_type = data[0];
        data = &data[1..];

        let (value, rest) = read_cstr(data)?;
        data = rest;

        fields.insert(field_type, value.to_string());
    }

    Ok(fields)
}

/// ErrorResponse message - fatal error from server.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    fields: HashMap<u8, String>,
}

impl ErrorResponse {
    /// Parse an ErrorResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            fields: parse_fields(payload)?,
        })
    }

    /// Convert to an [`Error::Server`].
    pub fn into_error(self) -> Error {
        Error::server(self.fields)
    }

    /// Get the SQLSTATE code.
    pub fn code(&self) -> Option<&str> {
        self.fields.get(&field_type::CODE).map(String::as_str)
    }

    /// Get the primary message.
    pub fn message(&self) -> Option<&str> {
        self.fields.get(&field_type::MESSAGE).map(String::as_str)
    }

    /// Get the severity, preferring the non-localized field (PostgreSQL 9.6+).
    pub fn severity(&self) -> Option<&str> {
        self.fields
            .get(&field_type::SEVERITY_V)
            .or_else(|| self.fields.get(&field_type::SEVERITY))
            .map(String::as_str)
    }
}

/// NoticeResponse message - non-fatal warning/info from server.
#[derive(Debug, Clone)]
pub struct NoticeResponse {
    fields: HashMap<u8, String>,
}

impl NoticeResponse {
    /// Parse a NoticeResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            fields: parse_fields(payload)?,
        })
    }

    /// Turn this notice into a [`ServerError`] for logging/inspection.
    pub fn into_server_error(self) -> ServerError {
        ServerError::new(self.fields)
    }

    /// Get the SQLSTATE code.
    pub fn code(&self) -> Option<&str> {
        self.fields.get(&field_type::CODE).map(String::as_str)
    }

    /// Get the primary message.
    pub fn message(&self) -> Option<&str> {
        self.fields.get(&field_type::MESSAGE).map(String::as_str)
    }

    /// Get the severity, preferring the non-localized field (PostgreSQL 9.6+).
    pub fn severity(&self) -> Option<&str> {
        self.fields
            .get(&field_type::SEVERITY_V)
            .or_else(|| self.fields.get(&field_type::SEVERITY))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_error() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(b'S');
        buf.extend_from_slice(b"ERROR\0");
        buf.push(b'C');
        buf.extend_from_slice(b"42601\0");
        buf.push(b'M');
        buf.extend_from_slice(b"syntax error\0");
        buf.push(0);
        buf
    }

    #[test]
    fn parses_error_response_fields() {
        let err = ErrorResponse::parse(&raw_error()).unwrap();
        assert_eq!(err.code(), Some("42601"));
        assert_eq!(err.message(), Some("syntax error"));
        assert_eq!(err.severity(), Some("ERROR"));
    }

    #[test]
    fn into_error_produces_server_variant() {
        let err = ErrorResponse::parse(&raw_error()).unwrap().into_error();
        assert_eq!(err.sqlstate(), Some("42601"));
    }
}
