//! Startup, TLS negotiation, and authentication handshake.
//!
//! Split in two because TLS negotiation requires swapping the stream's
//! concrete type (plain [`std::net::TcpStream`] to
//! [`native_tls::TlsStream`]), which [`crate::session::Session`] owns;
//! everything after that point is generic over any `Read + Write` stream.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::config::{Config, SslMode};
use crate::error::{Error, Result};
use crate::protocol::backend::auth::AuthenticationMessage;
use crate::protocol::backend::{msg_type as backend_msg, BackendKeyData, ErrorResponse, NoticeResponse, ParameterStatus, ReadyForQuery};
use crate::protocol::frontend::auth::md5_password;
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_ssl_request,
    write_startup,
};
use crate::protocol::types::TransactionStatus;
use crate::scram::ScramClient;

/// Everything learned from the server while establishing a session.
pub(crate) struct Handshake {
    pub backend_key: Option<BackendKeyData>,
    pub server_params: Vec<(String, String)>,
    pub transaction_status: TransactionStatus,
}

/// Send `SSLRequest` over a freshly connected plain socket and read the
/// server's one-byte answer. Returns `true` if the caller should wrap the
/// socket in TLS before continuing.
pub(crate) fn negotiate_ssl(stream: &mut TcpStream, mode: SslMode) -> Result<bool> {
    let mut buf = Vec::new();
    write_ssl_request(&mut buf);
    stream.write_all(&buf)?;
    stream.flush()?;

    let mut response = [0u8; 1];
    stream.read_exact(&mut response)?;
    match response[0] {
        b'S' => Ok(true),
        b'N' if mode == SslMode::Require => Err(Error::Auth(
            "server refused TLS and sslmode is set to require".into(),
        )),
        b'N' => Ok(false),
        other => Err(Error::Protocol(format!(
            "unexpected SSLRequest response byte: {other}"
        ))),
    }
}

/// Read one length-prefixed message, returning its type byte. The payload
/// lands in `buf`, which is cleared and reused across calls.
pub(crate) fn read_message<S: Read>(stream: &mut S, buf: &mut Vec<u8>) -> Result<u8> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header)?;
    let length = i32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if length < 4 {
        return Err(Error::Protocol(format!("invalid message length: {length}")));
    }

    buf.clear();
    buf.resize(length - 4, 0);
    stream.read_exact(buf)?;
    Ok(header[0])
}

/// Send `StartupMessage`, carry out whatever authentication method the
/// server demands, and collect the parameters/key data it reports before
/// the first `ReadyForQuery`.
pub(crate) fn authenticate<S: Read + Write>(stream: &mut S, config: &Config) -> Result<Handshake> {
    let mut out = Vec::new();
    let mut params: Vec<(&str, &str)> = vec![("user", &config.user), ("database", &config.database)];
    if let Some(application_name) = &config.application_name {
        params.push(("application_name", application_name));
    }
    write_startup(&mut out, &params);
    stream.write_all(&out)?;
    stream.flush()?;

    let mut buf = Vec::new();
    run_auth_loop(stream, config, &mut buf)?;
    await_ready_for_query(stream, &mut buf)
}

fn run_auth_loop<S: Read + Write>(stream: &mut S, config: &Config, buf: &mut Vec<u8>) -> Result<()> {
    loop {
        let type_byte = read_message(stream, buf)?;
        match type_byte {
            backend_msg::AUTHENTICATION => match AuthenticationMessage::parse(buf)? {
                AuthenticationMessage::Ok => return Ok(()),
                AuthenticationMessage::CleartextPassword => {
                    send_password(stream, password(config)?)?;
                }
                AuthenticationMessage::Md5Password { salt } => {
                    let hashed = md5_password(&config.user, password(config)?, &salt);
                    send_password(stream, &hashed)?;
                }
                AuthenticationMessage::Sasl { mechanisms } => {
                    if !mechanisms.contains(&"SCRAM-SHA-256") {
                        return Err(Error::Auth(format!(
                            "server does not offer SCRAM-SHA-256, offered: {mechanisms:?}"
                        )));
                    }
                    run_scram_exchange(stream, config, buf)?;
                }
                AuthenticationMessage::KerberosV5
                | AuthenticationMessage::Gss
                | AuthenticationMessage::GssContinue { .. }
                | AuthenticationMessage::Sspi => {
                    return Err(Error::Auth(
                        "server requested an unsupported authentication method".into(),
                    ));
                }
                AuthenticationMessage::SaslContinue { .. } | AuthenticationMessage::SaslFinal { .. } => {
                    return Err(Error::Protocol(
                        "SASL continuation message received outside an active exchange".into(),
                    ));
                }
            },
            backend_msg::ERROR_RESPONSE => return Err(ErrorResponse::parse(buf)?.into_error()),
            backend_msg::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(buf)?.into_server_error();
                tracing::warn!(message = %notice, "notice during authentication");
            }
            backend_msg::NEGOTIATE_PROTOCOL_VERSION => {
                return Err(Error::Protocol(
                    "server requested protocol negotiation; it is older than this client supports".into(),
                ));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message during authentication: {other:#04x}"
                )));
            }
        }
    }
}

fn run_scram_exchange<S: Read + Write>(stream: &mut S, config: &Config, buf: &mut Vec<u8>) -> Result<()> {
    let mut scram = ScramClient::new(&config.user, password(config)?);

    let mut out = Vec::new();
    let initial = scram.client_first_message();
    write_sasl_initial_response(&mut out, "SCRAM-SHA-256", initial.as_bytes());
    stream.write_all(&out)?;
    stream.flush()?;

    let type_byte = read_message(stream, buf)?;
    if type_byte != backend_msg::AUTHENTICATION {
        return Err(Error::Protocol(format!(
            "expected AuthenticationSASLContinue, got {type_byte:#04x}"
        )));
    }
    let server_first = match AuthenticationMessage::parse(buf)? {
        AuthenticationMessage::SaslContinue { data } => std::str::from_utf8(data)
            .map_err(|e| Error::Auth(format!("SCRAM server-first-message is not UTF-8: {e}")))?
            .to_string(),
        _ => return Err(Error::Protocol("expected AuthenticationSASLContinue".into())),
    };

    let client_final = scram.process_server_first(&server_first)?;
    out.clear();
    write_sasl_response(&mut out, client_final.as_bytes());
    stream.write_all(&out)?;
    stream.flush()?;

    let type_byte = read_message(stream, buf)?;
    if type_byte != backend_msg::AUTHENTICATION {
        return Err(Error::Protocol(format!(
            "expected AuthenticationSASLFinal, got {type_byte:#04x}"
        )));
    }
    match AuthenticationMessage::parse(buf)? {
        AuthenticationMessage::SaslFinal { data } => {
            let server_final = std::str::from_utf8(data)
                .map_err(|e| Error::Auth(format!("SCRAM server-final-message is not UTF-8: {e}")))?;
            scram.verify_server_final(server_final)
        }
        _ => Err(Error::Protocol("expected AuthenticationSASLFinal".into())),
    }
}

fn send_password<S: Read + Write>(stream: &mut S, password: &str) -> Result<()> {
    let mut out = Vec::new();
    write_password(&mut out, password);
    stream.write_all(&out)?;
    stream.flush()?;
    Ok(())
}

fn password(config: &Config) -> Result<&str> {
    config
        .password
        .as_deref()
        .ok_or_else(|| Error::Auth("server requires a password, but none was configured".into()))
}

/// Consume `ParameterStatus`/`BackendKeyData`/`NoticeResponse` until
/// `ReadyForQuery`. An interleaved `ErrorResponse` is retained and only
/// raised once the terminating `ReadyForQuery` arrives, per the protocol's
/// guarantee that `ReadyForQuery` always follows an error.
fn await_ready_for_query<S: Read + Write>(stream: &mut S, buf: &mut Vec<u8>) -> Result<Handshake> {
    let mut server_params = Vec::new();
    let mut backend_key = None;
    let mut pending_error = None;

    loop {
        let type_byte = read_message(stream, buf)?;
        match type_byte {
            backend_msg::PARAMETER_STATUS => {
                let status = ParameterStatus::parse(buf)?;
                server_params.push((status.name.to_string(), status.value.to_string()));
            }
            backend_msg::BACKEND_KEY_DATA => {
                backend_key = Some(*BackendKeyData::parse(buf)?);
            }
            backend_msg::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(buf)?.into_server_error();
                tracing::warn!(message = %notice, "notice during session startup");
            }
            backend_msg::ERROR_RESPONSE => {
                pending_error = Some(ErrorResponse::parse(buf)?.into_error());
            }
            backend_msg::READY_FOR_QUERY => {
                if let Some(err) = pending_error {
                    return Err(err);
                }
                let ready = ReadyForQuery::parse(buf)?;
                let transaction_status = ready
                    .transaction_status()
                    .ok_or_else(|| Error::Protocol("unknown transaction status byte".into()))?;
                return Ok(Handshake {
                    backend_key,
                    server_params,
                    transaction_status,
                });
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message before ReadyForQuery: {other:#04x}"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A fake duplex stream backed by a fixed server script; writes are
    /// discarded since these tests only exercise the read-side dispatch.
    struct Scripted {
        script: Cursor<Vec<u8>>,
    }

    impl Read for Scripted {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            self.script.read(out)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn message(type_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![type_byte];
        out.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn config() -> Config {
        Config::new("localhost", "alice", "app").with_password("secret")
    }

    #[test]
    fn cleartext_then_ready_for_query_succeeds() {
        let mut script = Vec::new();
        script.extend(message(backend_msg::AUTHENTICATION, &3_i32.to_be_bytes()));
        script.extend(message(backend_msg::AUTHENTICATION, &0_i32.to_be_bytes()));
        script.extend(message(backend_msg::BACKEND_KEY_DATA, &[0, 0, 0, 1, 0, 0, 0, 2]));
        script.extend(message(backend_msg::READY_FOR_QUERY, b"I"));

        let mut stream = Scripted {
            script: Cursor::new(script),
        };
        let handshake = authenticate(&mut stream, &config()).unwrap();
        assert_eq!(handshake.transaction_status, TransactionStatus::Idle);
        assert_eq!(handshake.backend_key.unwrap().process_id(), 1);
    }

    #[test]
    fn cleartext_without_configured_password_fails_before_writing() {
        let mut script = Vec::new();
        script.extend(message(backend_msg::AUTHENTICATION, &3_i32.to_be_bytes()));

        let mut stream = Scripted {
            script: Cursor::new(script),
        };
        let config = Config::new("localhost", "alice", "app");
        assert!(authenticate(&mut stream, &config).is_err());
    }

    #[test]
    fn interleaved_error_before_ready_for_query_is_raised() {
        let mut script = Vec::new();
        script.extend(message(backend_msg::AUTHENTICATION, &0_i32.to_be_bytes()));
        let mut error_payload = Vec::new();
        error_payload.push(b'S');
        error_payload.extend_from_slice(b"FATAL\0");
        error_payload.push(b'C');
        error_payload.extend_from_slice(b"53300\0");
        error_payload.push(b'M');
        error_payload.extend_from_slice(b"too many connections\0");
        error_payload.push(0);
        script.extend(message(backend_msg::ERROR_RESPONSE, &error_payload));
        script.extend(message(backend_msg::READY_FOR_QUERY, b"I"));

        let mut stream = Scripted {
            script: Cursor::new(script),
        };
        let err = authenticate(&mut stream, &config()).unwrap_err();
        assert_eq!(err.sqlstate(), Some("53300"));
    }

    #[test]
    fn unsupported_auth_method_is_rejected() {
        let mut script = Vec::new();
        script.extend(message(backend_msg::AUTHENTICATION, &2_i32.to_be_bytes()));

        let mut stream = Scripted {
            script: Cursor::new(script),
        };
        assert!(authenticate(&mut stream, &config()).is_err());
    }
}
