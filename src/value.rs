//! Typed decoding of result values, dispatched by PostgreSQL OID.
//!
//! Every value on the wire is requested and received in text format (see
//! [`crate::protocol::frontend::write_bind`]); this module turns that text
//! into a [`Value`] according to the column's reported type OID.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::types::{oid, Oid};

/// A decoded PostgreSQL column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// `char`, the first Unicode scalar of the column's single-character text.
    Char(char),
    /// `bytea`, decoded from its `\x`-hex text representation.
    Bytes(Vec<u8>),
    I16(i16),
    I32(i32),
    I64(i64),
    /// `oid` and other OID-typed columns.
    U32(u32),
    F32(f32),
    F64(f64),
    /// `numeric`. PostgreSQL's `numeric` is arbitrary precision; this crate
    /// represents it as `f64`, which loses precision for values that don't
    /// fit a double. Callers that need exact decimals should cast the column
    /// to `text` in SQL and read it back as [`Value::Text`].
    Numeric(f64),
    Text(String),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    /// `timestamptz`, kept as the server's raw text (includes a UTC offset
    /// PostgreSQL renders according to the session's `TimeZone` setting).
    TimestampTz(String),
    /// `json`/`jsonb`, kept as raw text. Call [`Value::as_json`] to parse it
    /// on demand.
    Json(String),
}

impl Value {
    /// Decode a non-NULL text-format column value for the given type OID.
    ///
    /// Unrecognized OIDs fall back to [`Value::Text`] (PostgreSQL guarantees
    /// every type has a text representation).
    pub fn decode(type_oid: Oid, text: &str) -> Result<Self> {
        match type_oid {
            oid::BOOL => Ok(Value::Bool(text == "t")),
            oid::CHAR => text
                .chars()
                .next()
                .map(Value::Char)
                .ok_or_else(|| Error::Decode("empty char value".into())),
            oid::BIT => match text {
                "1" => Ok(Value::Bool(true)),
                "0" => Ok(Value::Bool(false)),
                other => Err(Error::Decode(format!("invalid bit literal: {other}"))),
            },
            oid::BYTEA => decode_bytea(text).map(Value::Bytes),
            oid::INT2 => text
                .parse()
                .map(Value::I16)
                .map_err(|e| Error::Decode(format!("invalid int2: {e}"))),
            oid::INT4 => text
                .parse()
                .map(Value::I32)
                .map_err(|e| Error::Decode(format!("invalid int4: {e}"))),
            oid::INT8 => text
                .parse()
                .map(Value::I64)
                .map_err(|e| Error::Decode(format!("invalid int8: {e}"))),
            oid::OID | oid::XID | oid::CID => text
                .parse()
                .map(Value::U32)
                .map_err(|e| Error::Decode(format!("invalid OID-typed value: {e}"))),
            oid::FLOAT4 => text
                .parse()
                .map(Value::F32)
                .map_err(|e| Error::Decode(format!("invalid float4: {e}"))),
            oid::FLOAT8 => text
                .parse()
                .map(Value::F64)
                .map_err(|e| Error::Decode(format!("invalid float8: {e}"))),
            oid::NUMERIC => text
                .parse()
                .map(Value::Numeric)
                .map_err(|e| Error::Decode(format!("invalid numeric: {e}"))),
            oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::REGPROC | oid::CSTRING
            | oid::UNKNOWN | oid::XML => Ok(Value::Text(text.to_string())),
            oid::UUID => Uuid::parse_str(text)
                .map(Value::Uuid)
                .map_err(|e| Error::Decode(format!("invalid uuid: {e}"))),
            oid::DATE => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|e| Error::Decode(format!("invalid date: {e}"))),
            oid::TIME => parse_time(text).map(Value::Time),
            oid::TIMESTAMP => parse_timestamp(text).map(Value::Timestamp),
            oid::TIMESTAMPTZ => Ok(Value::TimestampTz(text.to_string())),
            oid::JSON | oid::JSONB | oid::JSON_ARRAY | oid::JSONB_ARRAY => {
                Ok(Value::Json(text.to_string()))
            }
            _ => Ok(Value::Text(text.to_string())),
        }
    }

    /// Build the [`Value`] for a NULL column.
    pub fn null() -> Self {
        Value::Null
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Parse a `json`/`jsonb` value's raw text into a [`serde_json::Value`].
    ///
    /// Returns `None` for any variant other than [`Value::Json`].
    pub fn as_json(&self) -> Option<Result<serde_json::Value>> {
        match self {
            Value::Json(text) => Some(
                serde_json::from_str(text)
                    .map_err(|e| Error::Decode(format!("invalid json: {e}"))),
            ),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Json(s) | Value::TimestampTz(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I16(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            Value::Numeric(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

fn decode_bytea(text: &str) -> Result<Vec<u8>> {
    let hex = text
        .strip_prefix("\\x")
        .ok_or_else(|| Error::Decode("bytea text value is missing the \\x prefix".into()))?;

    if hex.len() % 2 != 0 {
        return Err(Error::Decode("bytea hex payload has odd length".into()));
    }

    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for chunk in bytes.chunks(2) {
        let high = hex_digit(chunk[0])?;
        let low = hex_digit(chunk[1])?;
        out.push((high << 4) | low);
    }
    Ok(out)
}

fn hex_digit(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(Error::Decode(format!("invalid hex digit: {}", b as char))),
    }
}

fn parse_time(text: &str) -> Result<NaiveTime> {
    for fmt in ["%H:%M:%S%.f", "%H:%M:%S"] {
        if let Ok(t) = NaiveTime::parse_from_str(text, fmt) {
            return Ok(t);
        }
    }
    Err(Error::Decode(format!("invalid time: {text}")))
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime> {
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(t);
        }
    }
    Err(Error::Decode(format!("invalid timestamp: {text}")))
}

/// Encode a parameter value as PostgreSQL text-format for `Bind`.
///
/// `None` must be passed for SQL NULL at the call site; this function only
/// encodes non-NULL values, including the quoting/escaping rules for array
/// literals (`{...}`, comma-separated, `NULL` uppercase and unquoted for a
/// null element, double-quoting and backslash-escaping for elements that
/// contain `,`, `"`, `\`, `{`, `}`, or whitespace).
pub fn encode_param(value: &str) -> String {
    value.to_string()
}

/// Encode a list of optional strings as a one-dimensional PostgreSQL array
/// literal, e.g. `{1,2,NULL,4}` or `{"a,b",NULL,"c\"d"}`.
pub fn encode_array_literal<I, S>(elements: I) -> String
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let mut out = String::from("{");
    for (i, element) in elements.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match element {
            None => out.push_str("NULL"),
            Some(s) => {
                let s = s.as_ref();
                if needs_quoting(s) {
                    out.push('"');
                    for ch in s.chars() {
                        if ch == '"' || ch == '\\' {
                            out.push('\\');
                        }
                        out.push(ch);
                    }
                    out.push('"');
                } else {
                    out.push_str(s);
                }
            }
        }
    }
    out.push('}');
    out
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty()
        || s.eq_ignore_ascii_case("null")
        || s.chars()
            .any(|c| matches!(c, ',' | '"' | '\\' | '{' | '}') || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bool() {
        assert_eq!(Value::decode(oid::BOOL, "t").unwrap(), Value::Bool(true));
        assert_eq!(Value::decode(oid::BOOL, "f").unwrap(), Value::Bool(false));
        // Anything other than "t" decodes to false, per the OID 16 decode rule.
        assert_eq!(Value::decode(oid::BOOL, "x").unwrap(), Value::Bool(false));
    }

    #[test]
    fn decodes_integers() {
        assert_eq!(Value::decode(oid::INT4, "42").unwrap(), Value::I32(42));
        assert_eq!(Value::decode(oid::INT8, "-7").unwrap(), Value::I64(-7));
    }

    #[test]
    fn decodes_bytea_hex() {
        let v = Value::decode(oid::BYTEA, "\\xDEADBEEF").unwrap();
        assert_eq!(v, Value::Bytes(vec![0xDE, 0xAD, 0xBE, 0xEF]));
    }

    #[test]
    fn decodes_uuid() {
        let v = Value::decode(oid::UUID, "550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert!(matches!(v, Value::Uuid(_)));
    }

    #[test]
    fn decodes_date_time_timestamp() {
        assert!(matches!(
            Value::decode(oid::DATE, "2024-01-15").unwrap(),
            Value::Date(_)
        ));
        assert!(matches!(
            Value::decode(oid::TIME, "13:45:02.123").unwrap(),
            Value::Time(_)
        ));
        assert!(matches!(
            Value::decode(oid::TIMESTAMP, "2024-01-15 13:45:02").unwrap(),
            Value::Timestamp(_)
        ));
    }

    #[test]
    fn json_is_lazy() {
        let v = Value::decode(oid::JSONB, "{\"a\":1}").unwrap();
        let parsed = v.as_json().unwrap().unwrap();
        assert_eq!(parsed["a"], 1);
    }

    #[test]
    fn unknown_oid_falls_back_to_text() {
        let v = Value::decode(999_999, "whatever").unwrap();
        assert_eq!(v, Value::Text("whatever".to_string()));
    }

    #[test]
    fn array_literal_quotes_special_elements() {
        let s = encode_array_literal(vec![Some("a,b"), None, Some("plain")]);
        assert_eq!(s, "{\"a,b\",NULL,plain}");
    }
}
