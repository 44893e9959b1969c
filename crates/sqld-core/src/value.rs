//! Dynamically typed values flowing in and out of statements.

use std::fmt;

use serde::{
    ser::{SerializeMap, Serializer},
    Deserialize, Serialize,
};
use serde_json::Value;

/// A single materialized cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Raw bytes from the driver are surfaced as text.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("null"),
            SqlValue::Bool(v) => write!(f, "{v}"),
            SqlValue::Int(v) => write!(f, "{v}"),
            SqlValue::UInt(v) => write!(f, "{v}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Text(v) => f.write_str(v),
        }
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_none(),
            SqlValue::Bool(v) => serializer.serialize_bool(*v),
            SqlValue::Int(v) => serializer.serialize_i64(*v),
            SqlValue::UInt(v) => serializer.serialize_u64(*v),
            SqlValue::Float(v) => serializer.serialize_f64(*v),
            SqlValue::Text(v) => serializer.serialize_str(v),
        }
    }
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(v) => SqlValue::Bool(*v),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    SqlValue::UInt(u)
                } else {
                    SqlValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

/// One result row: column names mapped to values, in result-set column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn with_capacity(columns: usize) -> Self {
        Self {
            cells: Vec::with_capacity(columns),
        }
    }

    /// Appends a cell. A repeated column name (e.g. from a join) replaces the
    /// earlier value, like a map would.
    pub fn insert(&mut self, column: impl Into<String>, value: SqlValue) {
        let column = column.into();
        match self.cells.iter_mut().find(|(name, _)| *name == column) {
            Some((_, slot)) => *slot = value,
            None => self.cells.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.cells.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (name, value) in &self.cells {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl From<&serde_json::Map<String, Value>> for Row {
    fn from(object: &serde_json::Map<String, Value>) -> Self {
        let mut row = Row::with_capacity(object.len());
        for (key, value) in object {
            row.insert(key.clone(), SqlValue::from(value));
        }
        row
    }
}

/// A parameter bound to a prepared statement. SQL `NULL` is never bound; the
/// builder writes the literal instead.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlArg {
    /// Converts a JSON payload value. `None` means the value is SQL `NULL`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(v) => Some(SqlArg::Bool(*v)),
            Value::Number(n) => Some(if let Some(i) = n.as_i64() {
                SqlArg::Int(i)
            } else if let Some(u) = n.as_u64() {
                // Past i64::MAX: bound as its decimal text so no digit is lost.
                SqlArg::Text(u.to_string())
            } else {
                SqlArg::Float(n.as_f64().unwrap_or(f64::NAN))
            }),
            Value::String(s) => Some(SqlArg::Text(s.clone())),
            nested => Some(SqlArg::Text(nested.to_string())),
        }
    }
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub rows_affected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_serializes_in_column_order() {
        let mut row = Row::default();
        row.insert("zeta", SqlValue::Int(1));
        row.insert("alpha", SqlValue::Text("a".into()));
        row.insert("none", SqlValue::Null);

        let text = serde_json::to_string(&row).unwrap();
        assert_eq!(text, r#"{"zeta":1,"alpha":"a","none":null}"#);
    }

    #[test]
    fn duplicate_columns_keep_last_value() {
        let mut row = Row::default();
        row.insert("id", SqlValue::Int(1));
        row.insert("id", SqlValue::Int(2));
        assert_eq!(row.len(), 1);
        assert_eq!(row.get("id"), Some(&SqlValue::Int(2)));
    }

    #[test]
    fn json_payload_values_to_args() {
        assert_eq!(SqlArg::from_json(&json!(null)), None);
        assert_eq!(SqlArg::from_json(&json!(3)), Some(SqlArg::Int(3)));
        assert_eq!(SqlArg::from_json(&json!(19.99)), Some(SqlArg::Float(19.99)));
        assert_eq!(SqlArg::from_json(&json!(-7)), Some(SqlArg::Int(-7)));
        assert_eq!(
            SqlArg::from_json(&json!({"a": [1]})),
            Some(SqlArg::Text("{\"a\":[1]}".into()))
        );
    }

    #[test]
    fn unsigned_past_i64_keeps_every_digit() {
        assert_eq!(
            SqlArg::from_json(&json!(18446744073709551615u64)),
            Some(SqlArg::Text("18446744073709551615".into()))
        );
        assert_eq!(
            SqlArg::from_json(&json!(9223372036854775807i64)),
            Some(SqlArg::Int(i64::MAX))
        );
    }

    #[test]
    fn bytes_become_text() {
        assert_eq!(
            SqlValue::from_bytes(b"hello"),
            SqlValue::Text("hello".into())
        );
    }
}
