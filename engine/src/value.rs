//! Row and value types shared by storage, queries, and the wire codec.

use serde::{Deserialize, Serialize};

use crate::ColumnName;

/// A tagged SQLite value.
///
/// Storage and the wire format use the five SQLite variants; [`Value::Json`]
/// only appears in query results, produced by the JSON-marker post-processor
/// (see the query module). It is never written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    /// Rough byte size of the value, used for mutation size accounting.
    pub fn byte_size(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Integer(_) | Value::Real(_) => 8,
            Value::Text(s) => s.len(),
            Value::Blob(b) => b.len(),
            Value::Json(v) => v.to_string().len(),
        }
    }

    /// The text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The integer content, if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Integer(b as i64)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Blob(b)
    }
}

/// One result row: column names paired with values, in select order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row(Vec<(ColumnName, Value)>);

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a row from column/value pairs.
    pub fn from_pairs(pairs: Vec<(ColumnName, Value)>) -> Self {
        Self(pairs)
    }

    /// Append a column.
    pub fn push(&mut self, column: impl Into<ColumnName>, value: Value) {
        self.0.push((column.into(), value));
    }

    /// Look up a value by column name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Iterate column/value pairs in select order.
    pub fn iter(&self) -> impl Iterator<Item = &(ColumnName, Value)> {
        self.0.iter()
    }

    /// Mutable iteration, used by the JSON post-processor.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut (ColumnName, Value)> {
        self.0.iter_mut()
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(ColumnName, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (ColumnName, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_lookup() {
        let mut row = Row::new();
        row.push("title", Value::from("hi"));
        row.push("done", Value::from(false));

        assert_eq!(row.get("title"), Some(&Value::Text("hi".into())));
        assert_eq!(row.get("done"), Some(&Value::Integer(0)));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn value_conversions() {
        assert_eq!(Value::from(true), Value::Integer(1));
        assert_eq!(Value::from(42i64), Value::Integer(42));
        assert_eq!(Value::from(1.5), Value::Real(1.5));
        assert_eq!(Value::from(vec![1u8, 2]), Value::Blob(vec![1, 2]));
    }

    #[test]
    fn byte_size() {
        assert_eq!(Value::Null.byte_size(), 1);
        assert_eq!(Value::Text("abc".into()).byte_size(), 3);
        assert_eq!(Value::Blob(vec![0; 10]).byte_size(), 10);
        assert_eq!(Value::Integer(0).byte_size(), 8);
    }

    #[test]
    fn serialization_roundtrip() {
        let row = Row::from_pairs(vec![
            ("a".into(), Value::Integer(1)),
            ("b".into(), Value::Text("x".into())),
        ]);
        let json = serde_json::to_string(&row).unwrap();
        let parsed: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(row, parsed);
    }
}
