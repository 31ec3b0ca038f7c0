//! Extended query protocol messages.
//!
//! Parameters and results are always exchanged in text format: every Bind
//! requests format code 0 for both parameters and results.

use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::Oid;

/// Write a Parse message to create a prepared statement.
///
/// - `name`: statement name (empty string for the unnamed statement)
/// - `query`: SQL query with `$1`, `$2`, ... placeholders
/// - `param_oids`: parameter type OIDs (0 = let the server infer)
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str, param_oids: &[Oid]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(query);
    msg.write_i16(param_oids.len() as i16);
    for &oid in param_oids {
        msg.write_i32(oid as i32);
    }
    msg.finish();
}

/// Write a Bind message to create a portal from a prepared statement.
///
/// - `portal`: portal name (empty string for the unnamed portal)
/// - `statement`: statement name
/// - `params`: parameter values, text-encoded; `None` is SQL NULL
pub fn write_bind(buf: &mut Vec<u8>, portal: &str, statement: &str, params: &[Option<String>]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);

    msg.write_cstr(portal);
    msg.write_cstr(statement);

    // Parameter format codes: all text (0).
    msg.write_i16(0);

    msg.write_i16(params.len() as i16);
    for param in params {
        match param {
            Some(text) => {
                msg.write_i32(text.len() as i32);
                msg.write_bytes(text.as_bytes());
            }
            None => msg.write_i32(-1),
        }
    }

    // Result format codes: all text (0).
    msg.write_i16(0);

    msg.finish();
}

/// Write an Execute message to run a portal.
///
/// - `portal`: portal name
/// - `max_rows`: maximum number of rows to return (0 = unlimited)
pub fn write_execute(buf: &mut Vec<u8>, portal: &str, max_rows: u32) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.write_cstr(portal);
    msg.write_i32(max_rows as i32);
    msg.finish();
}

/// Write a Describe message to get metadata.
///
/// - `describe_type`: `b'S'` for statement, `b'P'` for portal
/// - `name`: statement or portal name
pub fn write_describe(buf: &mut Vec<u8>, describe_type: u8, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(describe_type);
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Describe message for a statement.
pub fn write_describe_statement(buf: &mut Vec<u8>, name: &str) {
    write_describe(buf, b'S', name);
}

/// Write a Sync message.
///
/// Ends an extended query sequence and causes:
/// - implicit COMMIT if successful and not in an explicit transaction
/// - implicit ROLLBACK if failed and not in an explicit transaction
/// - the server responds with `ReadyForQuery`
pub fn write_sync(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::SYNC);
    msg.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let mut buf = Vec::new();
        write_parse(&mut buf, "stmt1", "SELECT $1::int", &[0]);

        assert_eq!(buf[0], b'P');

        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn test_sync() {
        let mut buf = Vec::new();
        write_sync(&mut buf);

        assert_eq!(buf.len(), 5);
        assert_eq!(buf[0], b'S');
        assert_eq!(&buf[1..5], &4_i32.to_be_bytes());
    }

    #[test]
    fn test_execute() {
        let mut buf = Vec::new();
        write_execute(&mut buf, "", 0);

        assert_eq!(buf[0], b'E');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len, 9);
    }

    #[test]
    fn test_bind_null_param() {
        let mut buf = Vec::new();
        write_bind(&mut buf, "", "stmt1", &[None, Some("hello".to_string())]);

        assert_eq!(buf[0], b'B');
        // portal "" (1 byte null) + statement "stmt1" (6 bytes) + 2 (format
        // code count) + 2 (param count) + 4 (null len=-1) + 4 (text len) + 5
        // (text bytes) + 2 (result format count) = 26
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
    }
}
