//! Row values returned by a session.
//!
//! Principal queries only ever read integers, strings and flags, so rows are
//! flattened into a small owned representation that fake and real sessions
//! can both produce.

use mssql_client::SqlValue;
use serde::{Deserialize, Serialize};

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<SqlValue> for Value {
    fn from(value: SqlValue) -> Self {
        match value {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(v) => Value::Bool(v),
            SqlValue::TinyInt(v) => Value::Int(i64::from(v)),
            SqlValue::SmallInt(v) => Value::Int(i64::from(v)),
            SqlValue::Int(v) => Value::Int(i64::from(v)),
            SqlValue::BigInt(v) => Value::Int(v),
            SqlValue::String(v) => Value::Text(v),
            SqlValue::Uuid(v) => Value::Text(v.to_string()),
            SqlValue::Binary(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
                Value::Text(format!("0x{}", hex))
            }
            other => Value::Text(format!("{:?}", other)),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    columns: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column, builder style.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.columns.push((name.to_string(), value.into()));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    /// Look up a column by case-insensitive name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Int(v)) => Some(*v),
            Some(Value::Bool(v)) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        self.get_i64(name).and_then(|v| i32::try_from(v).ok())
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(Value::Bool(v)) => Some(*v),
            Some(Value::Int(v)) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl From<&mssql_client::Row> for Record {
    fn from(row: &mssql_client::Row) -> Self {
        let mut record = Record::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let value = row.get_raw(idx).map(Value::from).unwrap_or(Value::Null);
            record.push(column.name.clone(), value);
        }
        record
    }
}
