//! A single, guard-serialized connection to a PostgreSQL server.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;

use rand::Rng;

use crate::authenticator::{self, Handshake};
use crate::config::{Config, SslMode};
use crate::error::{Error, Result};
use crate::protocol::backend::extended::{
    BindComplete, NoData, ParameterDescription, ParseComplete, PortalSuspended,
};
use crate::protocol::backend::query::{CommandComplete, DataRow, RowDescription};
use crate::protocol::backend::{
    msg_type as backend_msg, ErrorResponse, NoticeResponse, ParameterStatus, ReadyForQuery,
};
use crate::protocol::frontend::{
    write_bind, write_describe_statement, write_execute, write_parse, write_query, write_sync,
    write_terminate,
};
use crate::protocol::types::{oid, Oid, TransactionStatus};
use crate::row::Row;
use crate::statement::{Column, Statement};
use crate::value::Value;

const STATEMENT_NAME_LEN: usize = 36;
const STATEMENT_NAME_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn random_statement_name() -> String {
    let mut rng = rand::rng();
    (0..STATEMENT_NAME_LEN)
        .map(|_| STATEMENT_NAME_ALPHABET[rng.random_range(0..STATEMENT_NAME_ALPHABET.len())] as char)
        .collect()
}

/// A TCP or TLS byte stream to the server.
///
/// The TLS variant is unbuffered: `native_tls::TlsStream` has no cheap way
/// to split into independently-owned read/write halves the way `TcpStream`
/// does via `try_clone`, and a single `Session` never has concurrent readers
/// and writers (the guard serializes all access).
enum Stream {
    Tcp(BufReader<TcpStream>, BufWriter<TcpStream>),
    #[cfg(feature = "tls")]
    Tls(Box<native_tls::TlsStream<TcpStream>>),
}

impl Stream {
    fn tcp(stream: TcpStream) -> Result<Self> {
        let reader = stream.try_clone()?;
        Ok(Self::Tcp(BufReader::new(reader), BufWriter::new(stream)))
    }

    #[cfg(feature = "tls")]
    fn tls(stream: native_tls::TlsStream<TcpStream>) -> Self {
        Self::Tls(Box::new(stream))
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(reader, _) => reader.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(_, writer) => writer.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(_, writer) => writer.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => stream.flush(),
        }
    }
}

/// Materialized result of [`Session::execute`].
#[derive(Debug, Clone, Default)]
pub struct Rows {
    rows: Vec<Row>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}

impl IntoIterator for Rows {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a Rows {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

struct SessionInner {
    stream: Option<Stream>,
    backend_pid: i32,
    secret_key: i32,
    statements: HashMap<String, Statement>,
    closed: bool,
    transaction_status: TransactionStatus,
    server_params: HashMap<String, String>,
}

/// A single connection to a PostgreSQL server.
///
/// All state is mutated under an internal mutex: concurrent calls against
/// the same `Session` are serialized in arrival order, matching the
/// protocol's requirement of at most one outstanding request at a time.
pub struct Session {
    inner: Mutex<SessionInner>,
    config: Config,
}

fn open_stream(config: &Config) -> Result<(Stream, Handshake)> {
    let addr = format!("{}:{}", config.host, config.port);
    let tcp = TcpStream::connect(&addr)?;
    tcp.set_nodelay(true)?;

    let mut stream = match config.ssl_mode {
        SslMode::Disable => Stream::tcp(tcp)?,
        SslMode::Prefer | SslMode::Require => {
            let mut tcp = tcp;
            let accepted = authenticator::negotiate_ssl(&mut tcp, config.ssl_mode)?;
            if accepted {
                #[cfg(feature = "tls")]
                {
                    let connector = native_tls::TlsConnector::new().map_err(Error::Tls)?;
                    let tls = connector
                        .connect(&config.host, tcp)
                        .map_err(|e| Error::Protocol(format!("TLS handshake failed: {e}")))?;
                    Stream::tls(tls)
                }
                #[cfg(not(feature = "tls"))]
                {
                    return Err(Error::Protocol(
                        "server accepted TLS but the tls feature is disabled".into(),
                    ));
                }
            } else {
                Stream::tcp(tcp)?
            }
        }
    };

    let handshake = authenticator::authenticate(&mut stream, config)?;
    Ok((stream, handshake))
}

fn read_message(stream: &mut Stream, buf: &mut Vec<u8>) -> Result<u8> {
    authenticator::read_message(stream, buf)
}

fn write_all_flush(stream: &mut Stream, buf: &[u8]) -> Result<()> {
    stream.write_all(buf)?;
    stream.flush()?;
    Ok(())
}

impl Session {
    /// Connect, authenticate, and return a ready `Session`.
    pub fn connect(config: Config) -> Result<Self> {
        let (stream, handshake) = open_stream(&config)?;
        let (backend_pid, secret_key) = handshake
            .backend_key
            .map(|k| (k.process_id() as i32, k.secret() as i32))
            .unwrap_or((0, 0));

        Ok(Self {
            inner: Mutex::new(SessionInner {
                stream: Some(stream),
                backend_pid,
                secret_key,
                statements: HashMap::new(),
                closed: false,
                transaction_status: handshake.transaction_status,
                server_params: handshake.server_params.into_iter().collect(),
            }),
            config,
        })
    }

    /// Backend process ID, for out-of-band query cancellation.
    pub fn backend_pid(&self) -> i32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).backend_pid
    }

    /// Backend secret key, paired with [`Session::backend_pid`] to build a
    /// CancelRequest on a separate socket.
    pub fn secret_key(&self) -> i32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).secret_key
    }

    /// A `ParameterStatus` value reported by the server (e.g. `server_version`,
    /// `server_encoding`, `TimeZone`), as of the last completed request.
    pub fn get_param(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .server_params
            .get(name)
            .cloned()
    }

    /// The server-reported transaction status as of the last completed
    /// request (idle, in a transaction block, or in a failed transaction
    /// block that will reject statements until a `ROLLBACK`).
    pub fn transaction_status(&self) -> TransactionStatus {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transaction_status
    }

    /// True iff the socket is currently open.
    pub fn is_open(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stream
            .is_some()
    }

    /// Close the socket and mark the session closed. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        if let Some(mut stream) = inner.stream.take() {
            let mut buf = Vec::new();
            write_terminate(&mut buf);
            // Best-effort: a failed Terminate write doesn't prevent closing.
            let _ = stream.write_all(&buf);
            let _ = stream.flush();
        }
        Ok(())
    }

    /// Reconnect if the socket was implicitly dropped and the session was
    /// never explicitly closed, clearing the statement cache. Fails with
    /// `Error::Interface` if the session is closed or still unreachable.
    fn check(&self, inner: &mut SessionInner) -> Result<()> {
        if inner.stream.is_some() {
            return Ok(());
        }
        if inner.closed {
            return Err(Error::Interface("operation on a closed session".into()));
        }

        tracing::warn!("session socket was dropped, reconnecting");
        let (stream, handshake) = open_stream(&self.config)?;
        inner.stream = Some(stream);
        inner.backend_pid = handshake
            .backend_key
            .map(|k| k.process_id() as i32)
            .unwrap_or(0);
        inner.secret_key = handshake
            .backend_key
            .map(|k| k.secret() as i32)
            .unwrap_or(0);
        inner.statements.clear();
        inner.transaction_status = handshake.transaction_status;
        inner.server_params = handshake.server_params.into_iter().collect();
        Ok(())
    }

    /// Prepare `sql`, or return the cached `Statement` if this exact SQL
    /// text was prepared earlier and the session hasn't reconnected since.
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.check(&mut inner)?;

        if let Some(statement) = inner.statements.get(sql) {
            return Ok(statement.clone());
        }

        let result = self.prepare_uncached(&mut inner, sql);
        if let Err(ref e) = result {
            if e.is_connection_broken() {
                inner.stream = None;
            }
        }
        let statement = result?;
        inner.statements.insert(sql.to_string(), statement.clone());
        Ok(statement)
    }

    fn prepare_uncached(&self, inner: &mut SessionInner, sql: &str) -> Result<Statement> {
        let stream = inner
            .stream
            .as_mut()
            .ok_or_else(|| Error::Interface("session has no open socket".into()))?;

        let name = random_statement_name();

        let mut out = Vec::new();
        write_parse(&mut out, &name, sql, &[]);
        write_sync(&mut out);
        write_all_flush(stream, &out)?;

        let mut buf = Vec::new();
        wait_for_parse_complete(stream, &mut buf)?;

        out.clear();
        write_describe_statement(&mut out, &name);
        write_sync(&mut out);
        write_all_flush(stream, &out)?;

        let param_oids = read_parameter_description(stream, &mut buf)?;
        let columns = read_statement_columns(stream, &mut buf)?;
        let status = wait_for_ready_for_query(stream, &mut buf)?;
        inner.transaction_status = status;

        Ok(Statement::new(name, sql.to_string(), param_oids, columns))
    }

    /// Run `stmt` with `params` (`None` for SQL NULL), returning every row
    /// up to `row_limit` (`0` for unlimited).
    pub fn execute(&self, stmt: &Statement, params: &[Option<String>], row_limit: u32) -> Result<Rows> {
        if params.len() != stmt.num_params() {
            return Err(Error::Interface(format!(
                "expected {} parameters, got {}",
                stmt.num_params(),
                params.len()
            )));
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.check(&mut inner)?;

        let result = self.execute_inner(&mut inner, stmt, params, row_limit);
        if let Err(ref e) = result {
            if e.is_connection_broken() {
                inner.stream = None;
            }
        }
        result
    }

    fn execute_inner(
        &self,
        inner: &mut SessionInner,
        stmt: &Statement,
        params: &[Option<String>],
        row_limit: u32,
    ) -> Result<Rows> {
        let SessionInner {
            stream,
            server_params,
            ..
        } = inner;
        let stream = stream
            .as_mut()
            .ok_or_else(|| Error::Interface("session has no open socket".into()))?;

        let mut out = Vec::new();
        write_bind(&mut out, "", stmt.name(), params);
        write_execute(&mut out, "", row_limit);
        write_sync(&mut out);
        write_all_flush(stream, &out)?;

        let mut buf = Vec::new();
        let type_byte = read_message(stream, &mut buf)?;
        match type_byte {
            backend_msg::BIND_COMPLETE => {
                BindComplete::parse(&buf)?;
            }
            backend_msg::ERROR_RESPONSE => {
                let err = ErrorResponse::parse(&buf)?.into_error();
                let status = drain_to_ready_for_query(stream, &mut buf)?;
                inner.transaction_status = status;
                return Err(err);
            }
            other => {
                return Err(protocol_violation(stream, other));
            }
        }

        let (rows, status) = run_result_loop(stream, &mut buf, stmt.columns(), server_params)?;
        inner.transaction_status = status;
        Ok(rows)
    }

    /// Run `sql` via the simple query protocol. Used for multi-statement SQL;
    /// results are discarded.
    pub fn execute_simple(&self, sql: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.check(&mut inner)?;

        let result = self.execute_simple_inner(&mut inner, sql);
        if let Err(ref e) = result {
            if e.is_connection_broken() {
                inner.stream = None;
            }
        }
        result
    }

    fn execute_simple_inner(&self, inner: &mut SessionInner, sql: &str) -> Result<()> {
        let SessionInner {
            stream,
            server_params,
            ..
        } = inner;
        let stream = stream
            .as_mut()
            .ok_or_else(|| Error::Interface("session has no open socket".into()))?;

        let mut out = Vec::new();
        write_query(&mut out, sql);
        write_all_flush(stream, &out)?;

        let mut buf = Vec::new();
        let mut pending_error = None;
        loop {
            let type_byte = read_message(stream, &mut buf)?;
            match type_byte {
                backend_msg::ROW_DESCRIPTION | backend_msg::DATA_ROW | backend_msg::COMMAND_COMPLETE
                | backend_msg::EMPTY_QUERY_RESPONSE => {}
                backend_msg::NOTICE_RESPONSE => {
                    let notice = NoticeResponse::parse(&buf)?.into_server_error();
                    tracing::warn!(message = %notice, "notice");
                }
                backend_msg::PARAMETER_STATUS => {
                    let status = ParameterStatus::parse(&buf)?;
                    server_params.insert(status.name.to_string(), status.value.to_string());
                }
                backend_msg::ERROR_RESPONSE => {
                    pending_error = Some(ErrorResponse::parse(&buf)?.into_error());
                }
                backend_msg::READY_FOR_QUERY => {
                    let status = ready_for_query_status(&buf)?;
                    inner.transaction_status = status;
                    return match pending_error {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
                other => return Err(protocol_violation(stream, other)),
            }
        }
    }
}

fn protocol_violation(stream: &mut Stream, type_byte: u8) -> Error {
    let _ = stream.flush();
    Error::Protocol(format!("unexpected message tag: {type_byte:#04x}"))
}

fn wait_for_parse_complete(stream: &mut Stream, buf: &mut Vec<u8>) -> Result<()> {
    let mut pending_error = None;
    loop {
        let type_byte = read_message(stream, buf)?;
        match type_byte {
            backend_msg::PARSE_COMPLETE => {
                ParseComplete::parse(buf)?;
            }
            backend_msg::ERROR_RESPONSE => {
                pending_error = Some(ErrorResponse::parse(buf)?.into_error());
            }
            backend_msg::READY_FOR_QUERY => {
                return match pending_error {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
            backend_msg::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(buf)?.into_server_error();
                tracing::warn!(message = %notice, "notice");
            }
            other => return Err(protocol_violation(stream, other)),
        }
    }
}

fn read_parameter_description(stream: &mut Stream, buf: &mut Vec<u8>) -> Result<Vec<Oid>> {
    let type_byte = read_message(stream, buf)?;
    if type_byte != backend_msg::PARAMETER_DESCRIPTION {
        return Err(protocol_violation(stream, type_byte));
    }
    Ok(ParameterDescription::parse(buf)?.oids().to_vec())
}

fn read_statement_columns(stream: &mut Stream, buf: &mut Vec<u8>) -> Result<Vec<Column>> {
    let type_byte = read_message(stream, buf)?;
    match type_byte {
        backend_msg::NO_DATA => {
            NoData::parse(buf)?;
            Ok(Vec::new())
        }
        backend_msg::ROW_DESCRIPTION => Ok(RowDescription::parse(buf)?
            .iter()
            .map(|field| Column {
                name: field.name.to_string(),
                type_oid: field.type_oid(),
            })
            .collect()),
        other => Err(protocol_violation(stream, other)),
    }
}

fn wait_for_ready_for_query(stream: &mut Stream, buf: &mut Vec<u8>) -> Result<TransactionStatus> {
    loop {
        let type_byte = read_message(stream, buf)?;
        match type_byte {
            backend_msg::READY_FOR_QUERY => {
                return Ok(ready_for_query_status(buf)?);
            }
            backend_msg::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(buf)?.into_server_error();
                tracing::warn!(message = %notice, "notice");
            }
            backend_msg::ERROR_RESPONSE => {
                let err = ErrorResponse::parse(buf)?.into_error();
                drain_to_ready_for_query(stream, buf)?;
                return Err(err);
            }
            other => return Err(protocol_violation(stream, other)),
        }
    }
}

fn drain_to_ready_for_query(stream: &mut Stream, buf: &mut Vec<u8>) -> Result<TransactionStatus> {
    loop {
        let type_byte = read_message(stream, buf)?;
        if type_byte == backend_msg::READY_FOR_QUERY {
            return Ok(ready_for_query_status(buf)?);
        }
    }
}

fn ready_for_query_status(buf: &[u8]) -> Result<TransactionStatus> {
    let message = ReadyForQuery::parse(buf)?;
    message
        .transaction_status()
        .ok_or_else(|| Error::Protocol(format!("unknown transaction status byte: {}", message.status)))
}

fn run_result_loop(
    stream: &mut Stream,
    buf: &mut Vec<u8>,
    columns: &[Column],
    server_params: &mut HashMap<String, String>,
) -> Result<(Rows, TransactionStatus)> {
    let mut rows = Vec::new();
    let mut pending_error = None;

    loop {
        let type_byte = read_message(stream, buf)?;
        match type_byte {
            backend_msg::PARAMETER_STATUS => {
                let status = ParameterStatus::parse(buf)?;
                server_params.insert(status.name.to_string(), status.value.to_string());
            }
            backend_msg::DATA_ROW => {
                let data_row = DataRow::parse(buf)?;
                let mut values = Vec::with_capacity(data_row.len());
                for (i, field) in data_row.iter().enumerate() {
                    let type_oid = columns.get(i).map(|c| c.type_oid).unwrap_or(oid::UNKNOWN);
                    values.push(match field {
                        None => Value::null(),
                        Some(bytes) => {
                            let text = std::str::from_utf8(bytes).map_err(|e| {
                                Error::Decode(format!("column value is not UTF-8: {e}"))
                            })?;
                            Value::decode(type_oid, text)?
                        }
                    });
                }
                rows.push(Row::new(columns.to_vec(), values));
            }
            backend_msg::COMMAND_COMPLETE => {
                CommandComplete::parse(buf)?;
            }
            backend_msg::PORTAL_SUSPENDED => {
                PortalSuspended::parse(buf)?;
            }
            backend_msg::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(buf)?.into_server_error();
                tracing::warn!(message = %notice, "notice");
            }
            backend_msg::ERROR_RESPONSE => {
                pending_error = Some(ErrorResponse::parse(buf)?.into_error());
            }
            backend_msg::READY_FOR_QUERY => {
                let status = ready_for_query_status(buf)?;
                return match pending_error {
                    Some(err) => Err(err),
                    None => Ok((Rows { rows }, status)),
                };
            }
            other => return Err(protocol_violation(stream, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_names_are_36_chars_from_the_expected_alphabet() {
        let name = random_statement_name();
        assert_eq!(name.len(), STATEMENT_NAME_LEN);
        assert!(name.bytes().all(|b| STATEMENT_NAME_ALPHABET.contains(&b)));
    }

    #[test]
    fn statement_names_are_not_trivially_repeated() {
        let a = random_statement_name();
        let b = random_statement_name();
        assert_ne!(a, b);
    }

    #[test]
    fn rows_into_iter_yields_all_rows() {
        let row = Row::new(
            vec![Column {
                name: "a".into(),
                type_oid: oid::INT4,
            }],
            vec![Value::I32(1)],
        );
        let rows = Rows { rows: vec![row.clone(), row] };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.into_iter().count(), 2);
    }
}
