//! Data-source connectors
//!
//! A connector is the narrow seam to a live data source: it lists tables and
//! columns and runs read-only queries. Values come back in their native shape
//! ([`SqlValue`]); normalisation for transport happens in the executor.

pub mod sqlite;

pub use sqlite::{SqliteConnectionProvider, SqliteConnector};

use crate::error::{FailureKind, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Native value as reported by a connector
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision decimal in its textual form
    Decimal(String),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
    Bytes(Vec<u8>),
    List(Vec<SqlValue>),
    Map(BTreeMap<String, SqlValue>),
}

/// Rows exactly as the connector produced them
#[derive(Debug, Clone, Default)]
pub struct RawResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    /// Whether more rows were available beyond the requested limit
    pub truncated: bool,
}

/// Failure class reported by a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorFailure {
    Execution,
    Permission,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct ConnectorError {
    pub class: ConnectorFailure,
    pub message: String,
}

impl ConnectorError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self { class: ConnectorFailure::Execution, message: message.into() }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self { class: ConnectorFailure::Permission, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self { class: ConnectorFailure::Timeout, message: message.into() }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self.class {
            ConnectorFailure::Execution => FailureKind::ExecutionError,
            ConnectorFailure::Permission => FailureKind::PermissionError,
            ConnectorFailure::Timeout => FailureKind::Timeout,
        }
    }
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.class, self.message)
    }
}

impl std::error::Error for ConnectorError {}

/// Connector to one data source
#[async_trait]
pub trait Connector: Send + Sync {
    /// Identifier of the data source this connector talks to
    fn source_id(&self) -> &str;

    async fn list_tables(&self) -> std::result::Result<Vec<String>, ConnectorError>;

    async fn list_columns(&self, table: &str) -> std::result::Result<Vec<String>, ConnectorError>;

    /// Run a read-only statement, returning at most `limit` rows
    async fn run_query(
        &self,
        sql: &str,
        limit: usize,
    ) -> std::result::Result<RawResultSet, ConnectorError>;
}

/// Registry resolving a data-source id to a connector
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connect(&self, data_source_id: &str) -> Result<Arc<dyn Connector>>;
}

/// Quote an identifier for inclusion in generated SQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
