//! Prepared statement metadata.

use crate::protocol::types::Oid;

/// A column reported in a statement's `RowDescription`.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
}

/// A statement prepared on the server via Parse/`ParameterDescription`.
///
/// Cheap to clone: [`crate::session::Session::prepare`] returns a clone of
/// its cached entry rather than re-parsing the SQL on every call.
#[derive(Debug, Clone)]
pub struct Statement {
    /// Server-side statement name (never the unnamed statement: the session
    /// cache only holds statements it intends to reuse).
    pub(crate) name: String,
    /// The SQL text this statement was prepared from, used as the cache key.
    pub(crate) sql: String,
    /// Parameter type OIDs, in `$1, $2, ...` order.
    pub(crate) param_oids: Vec<Oid>,
    /// Result columns, in positional order.
    pub(crate) columns: Vec<Column>,
}

impl Statement {
    pub(crate) fn new(
        name: String,
        sql: String,
        param_oids: Vec<Oid>,
        columns: Vec<Column>,
    ) -> Self {
        Self {
            name,
            sql,
            param_oids,
            columns,
        }
    }

    /// Server-side name of this prepared statement.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The SQL this statement was prepared from.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of bind parameters this statement expects.
    pub fn num_params(&self) -> usize {
        self.param_oids.len()
    }

    /// Parameter type OIDs, in `$1, $2, ...` order.
    pub fn param_oids(&self) -> &[Oid] {
        &self.param_oids
    }

    /// Result columns, in positional order. Empty for statements that don't
    /// return rows (e.g. a bare `INSERT` with no `RETURNING`).
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}
