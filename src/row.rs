//! Decoded result rows.

use crate::error::{Error, Result};
use crate::statement::Column;
use crate::value::Value;

/// One decoded `DataRow`: a sequence of values aligned with the statement's
/// column descriptors.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Vec<Column>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Vec<Column>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column value by position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Column value by name, first match if the query produced duplicate
    /// column names.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| self.values.get(i))
    }

    /// Column value by name, erroring if the row has no such column.
    pub fn try_get(&self, name: &str) -> Result<&Value> {
        self.get_by_name(name)
            .ok_or_else(|| Error::Decode(format!("no such column: {name}")))
    }

    /// Column names, in positional order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Iterate over `(name, value)` pairs in positional order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .zip(self.values.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        Row::new(
            vec![
                Column {
                    name: "id".into(),
                    type_oid: crate::protocol::types::oid::INT4,
                },
                Column {
                    name: "name".into(),
                    type_oid: crate::protocol::types::oid::TEXT,
                },
            ],
            vec![Value::I32(1), Value::Text("alice".into())],
        )
    }

    #[test]
    fn get_by_name_and_position_agree() {
        let row = row();
        assert_eq!(row.get(0), row.get_by_name("id"));
        assert_eq!(row.get_by_name("name"), Some(&Value::Text("alice".into())));
    }

    #[test]
    fn try_get_missing_column_errors() {
        let row = row();
        assert!(row.try_get("missing").is_err());
    }

    #[test]
    fn iter_pairs_names_with_values() {
        let row = row();
        let pairs: Vec<_> = row.iter().collect();
        assert_eq!(pairs[0].0, "id");
        assert_eq!(pairs[1].0, "name");
    }
}
