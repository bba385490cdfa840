//! Query Result - Standardized, transport-safe result of one execution

use crate::connector::{RawResultSet, SqlValue};
use crate::error::FailureKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standardized query result from any connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Success status
    pub success: bool,

    /// Column names, in result order
    pub columns: Vec<String>,

    /// Row-major data; every row is aligned to `columns`
    pub rows: Vec<Vec<Value>>,

    /// Number of rows returned
    pub row_count: usize,

    /// Execution time in milliseconds
    pub execution_time_ms: u64,

    /// Data source that executed the query
    pub source_id: String,

    /// Failure class when `success` is false
    pub failure: Option<FailureKind>,

    /// Warnings (non-fatal issues)
    pub warnings: Vec<String>,

    /// Errors (if any)
    pub errors: Vec<String>,
}

impl QueryResult {
    /// Create a successful result from connector rows
    pub fn success(raw: RawResultSet, source_id: String, execution_time_ms: u64) -> Self {
        let width = raw.columns.len();
        let rows: Vec<Vec<Value>> = raw
            .rows
            .into_iter()
            .map(|row| {
                let mut values: Vec<Value> = row.into_iter().map(normalize_value).collect();
                values.resize(width, Value::Null);
                values
            })
            .collect();

        let mut warnings = Vec::new();
        if raw.truncated {
            warnings.push(format!("Result truncated to {} rows", rows.len()));
        }

        Self {
            success: true,
            row_count: rows.len(),
            columns: raw.columns,
            rows,
            execution_time_ms,
            source_id,
            failure: None,
            warnings,
            errors: Vec::new(),
        }
    }

    /// Create an error result
    pub fn error(source_id: String, failure: FailureKind, error: String, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            execution_time_ms,
            source_id,
            failure: Some(failure),
            warnings: Vec::new(),
            errors: vec![error],
        }
    }

    pub fn error_text(&self) -> String {
        self.errors.join("; ")
    }

    /// Indexes of columns whose non-null values are all numeric
    pub fn numeric_columns(&self) -> Vec<usize> {
        (0..self.columns.len())
            .filter(|&idx| {
                let mut seen = false;
                let all_numeric = self.rows.iter().all(|row| match row.get(idx) {
                    Some(Value::Number(_)) => {
                        seen = true;
                        true
                    }
                    Some(Value::Null) | None => true,
                    Some(_) => false,
                });
                all_numeric && seen
            })
            .collect()
    }

    /// Headline value: first row, first numeric column (or first column)
    pub fn scalar(&self) -> Option<&Value> {
        let row = self.rows.first()?;
        let idx = self.numeric_columns().first().copied().unwrap_or(0);
        row.get(idx)
    }
}

/// Convert a native connector value into a transport-safe JSON value.
///
/// Decimals become floats, temporal values canonical strings, identifiers
/// and bytes strings; lists and maps are converted element-wise.
pub fn normalize_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Bool(b),
        SqlValue::Int(i) => Value::Number(i.into()),
        SqlValue::Float(f) => float_value(f),
        SqlValue::Decimal(d) => match d.trim().parse::<f64>() {
            Ok(f) => float_value(f),
            Err(_) => Value::String(d),
        },
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        SqlValue::Timestamp(ts) => Value::String(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
        SqlValue::TimestampTz(ts) => Value::String(ts.to_rfc3339()),
        SqlValue::Uuid(u) => Value::String(u.hyphenated().to_string()),
        SqlValue::Bytes(bytes) => Value::String(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
        SqlValue::List(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        SqlValue::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, normalize_value(v)))
                .collect(),
        ),
    }
}

fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
