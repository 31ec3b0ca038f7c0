//! A PostgreSQL client speaking the wire protocol directly.
//!
//! # Features
//!
//! - **Zero-copy message parsing**: backend messages are parsed in place out
//!   of the read buffer via `zerocopy`.
//! - **Extended query protocol**: statements are prepared once and cached by
//!   SQL text, then bound and executed with text-format parameters.
//! - **SCRAM-SHA-256, MD5, and cleartext auth**, negotiated automatically
//!   against whatever the server requests.
//! - **Optional TLS** via `native-tls`, controlled by [`SslMode`].
//!
//! # Example
//!
//! ```no_run
//! use pgcore::{Config, Session};
//!
//! fn main() -> pgcore::Result<()> {
//!     let config = Config::new("localhost", "postgres", "mydb")
//!         .with_password("secret");
//!     let session = Session::connect(config)?;
//!
//!     let stmt = session.prepare("SELECT $1::int4 AS num")?;
//!     let rows = session.execute(&stmt, &[Some("1".into())], 0)?;
//!     for row in &rows {
//!         println!("{:?}", row);
//!     }
//!
//!     session.close()?;
//!     Ok(())
//! }
//! ```

mod authenticator;
mod config;
mod error;
mod row;
mod scram;
pub mod session;
mod statement;
mod value;

pub mod protocol;

pub use config::{Config, SslMode};
pub use error::{Error, Result, ServerError};
pub use row::Row;
pub use session::{Rows, Session};
pub use statement::{Column, Statement};
pub use value::Value;
