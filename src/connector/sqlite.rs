//! SQLite connector
//!
//! rusqlite is synchronous, so every call hops onto the blocking pool.
//! File-backed sources are opened read-only; a write attempt surfaces as a
//! permission failure. A query whose caller stops waiting (for example on
//! an executor timeout) is aborted through SQLite's progress handler so it
//! releases the connection for the next query.

use crate::connector::{quote_identifier, ConnectionProvider, Connector, ConnectorError, RawResultSet, SqlValue};
use crate::error::{ResolveError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// VM instructions between checks of the abandon flag
const PROGRESS_CHECK_OPS: i32 = 1_000;

/// Flags a running query as abandoned when the awaiting future is dropped.
struct AbandonOnDrop {
    flag: Arc<AtomicBool>,
    finished: bool,
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if !self.finished {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

pub struct SqliteConnector {
    source_id: String,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConnector {
    /// Open a database file read-only.
    pub fn open_read_only(source_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| ResolveError::Execution(format!("Failed to open {}: {}", path.display(), e)))?;

        info!("Opened SQLite data source {}", path.display());
        Ok(Self::from_connection(source_id, conn))
    }

    /// Wrap an existing connection (used for in-memory sources).
    pub fn from_connection(source_id: impl Into<String>, conn: Connection) -> Self {
        Self {
            source_id: source_id.into(),
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> std::result::Result<T, ConnectorError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> std::result::Result<T, ConnectorError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| ConnectorError::execution("SQLite connection lock poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| ConnectorError::execution(format!("SQLite task failed: {}", e)))?
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn list_tables(&self) -> std::result::Result<Vec<String>, ConnectorError> {
        self.blocking(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                )
                .map_err(classify)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(classify)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(classify)?;
            Ok(names)
        })
        .await
    }

    async fn list_columns(&self, table: &str) -> std::result::Result<Vec<String>, ConnectorError> {
        let pragma = format!("PRAGMA table_info({})", quote_identifier(table));
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&pragma).map_err(classify)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .map_err(classify)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(classify)?;
            Ok(names)
        })
        .await
    }

    async fn run_query(
        &self,
        sql: &str,
        limit: usize,
    ) -> std::result::Result<RawResultSet, ConnectorError> {
        debug!("SQLite[{}] executing: {}", self.source_id, sql);
        let sql = sql.to_string();
        let abandoned = Arc::new(AtomicBool::new(false));
        let mut guard = AbandonOnDrop { flag: Arc::clone(&abandoned), finished: false };
        let source_id = self.source_id.clone();

        let result = self
            .blocking(move |conn| {
                if abandoned.load(Ordering::SeqCst) {
                    return Err(ConnectorError::timeout("query abandoned before it started"));
                }
                let flag = Arc::clone(&abandoned);
                conn.progress_handler(PROGRESS_CHECK_OPS, Some(move || flag.load(Ordering::SeqCst)));
                let result = read_rows(conn, &sql, limit);
                conn.progress_handler(0, None::<fn() -> bool>);
                if abandoned.load(Ordering::SeqCst) {
                    warn!("SQLite[{}] query interrupted after its caller gave up", source_id);
                }
                result
            })
            .await;
        guard.finished = true;
        result
    }
}

fn read_rows(conn: &Connection, sql: &str, limit: usize) -> std::result::Result<RawResultSet, ConnectorError> {
    let mut stmt = conn.prepare(sql).map_err(classify)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query([]).map_err(classify)?;
    let mut data = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(classify)? {
        if data.len() >= limit {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(from_value_ref(row.get_ref(idx).map_err(classify)?));
        }
        data.push(values);
    }

    Ok(RawResultSet { columns, rows: data, truncated })
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Int(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Bytes(bytes.to_vec()),
    }
}

fn classify(err: rusqlite::Error) -> ConnectorError {
    let code = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
        _ => None,
    };
    match code {
        Some(ErrorCode::ReadOnly)
        | Some(ErrorCode::PermissionDenied)
        | Some(ErrorCode::AuthorizationForStatementDenied) => ConnectorError::permission(err.to_string()),
        Some(ErrorCode::DatabaseBusy)
        | Some(ErrorCode::DatabaseLocked)
        | Some(ErrorCode::OperationInterrupted) => ConnectorError::timeout(err.to_string()),
        _ => ConnectorError::execution(err.to_string()),
    }
}

/// Resolves data-source ids to SQLite files registered up front.
#[derive(Default)]
pub struct SqliteConnectionProvider {
    paths: HashMap<String, PathBuf>,
    open: DashMap<String, Arc<SqliteConnector>>,
}

impl SqliteConnectionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, data_source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(data_source_id.into(), path.into());
        self
    }

    /// Register an already-open connector (used for in-memory sources).
    pub fn register_connector(self, connector: SqliteConnector) -> Self {
        self.open.insert(connector.source_id.clone(), Arc::new(connector));
        self
    }
}

#[async_trait]
impl ConnectionProvider for SqliteConnectionProvider {
    async fn connect(&self, data_source_id: &str) -> Result<Arc<dyn Connector>> {
        if let Some(existing) = self.open.get(data_source_id) {
            let connector: Arc<SqliteConnector> = Arc::clone(&*existing);
            return Ok(connector);
        }

        let path = self
            .paths
            .get(data_source_id)
            .cloned()
            .ok_or_else(|| ResolveError::Execution(format!("Unknown data source: {}", data_source_id)))?;

        let id = data_source_id.to_string();
        let connector = tokio::task::spawn_blocking(move || SqliteConnector::open_read_only(id, path))
            .await
            .map_err(|e| ResolveError::Execution(format!("Failed to open data source: {}", e)))??;

        let connector = Arc::new(connector);
        self.open.insert(data_source_id.to_string(), Arc::clone(&connector));
        Ok(connector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorFailure;

    fn orders_connector() -> SqliteConnector {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, amount REAL, created_at TEXT);
             INSERT INTO orders (amount, created_at) VALUES (10.5, '2025-09-14'), (20.0, '2025-09-13'), (5.0, '2025-08-01');",
        )
        .unwrap();
        SqliteConnector::from_connection("shop", conn)
    }

    #[tokio::test]
    async fn test_lists_tables_and_columns() {
        let connector = orders_connector();
        assert_eq!(connector.list_tables().await.unwrap(), vec!["orders".to_string()]);
        assert_eq!(
            connector.list_columns("orders").await.unwrap(),
            vec!["id".to_string(), "amount".to_string(), "created_at".to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_query_respects_limit() {
        let connector = orders_connector();
        let result = connector.run_query("SELECT id, amount FROM orders ORDER BY id", 2).await.unwrap();
        assert_eq!(result.columns, vec!["id".to_string(), "amount".to_string()]);
        assert_eq!(result.rows.len(), 2);
        assert!(result.truncated);
        assert_eq!(result.rows[0], vec![SqlValue::Int(1), SqlValue::Float(10.5)]);
    }

    #[tokio::test]
    async fn test_bad_sql_is_execution_failure() {
        let connector = orders_connector();
        let err = connector.run_query("SELECT nope FROM orders", 10).await.unwrap_err();
        assert_eq!(err.class, ConnectorFailure::Execution);
    }

    #[tokio::test]
    async fn test_timed_out_query_releases_connection() {
        use crate::error::FailureKind;
        use crate::execution::{ConnectorExecutor, ExecutionContext, SqlExecutor};
        use std::time::{Duration, Instant};

        let connector = orders_connector();
        let executor = ConnectorExecutor::new();
        let runaway = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT COUNT(*) FROM c";

        let slow = executor
            .execute(runaway, &connector, &ExecutionContext::new(Duration::from_millis(50), 10))
            .await;
        assert!(!slow.success);
        assert_eq!(slow.failure, Some(FailureKind::Timeout));

        let started = Instant::now();
        let next = executor
            .execute("SELECT COUNT(*) FROM orders", &connector, &ExecutionContext::new(Duration::from_secs(2), 10))
            .await;
        assert!(next.success, "{:?}", next);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(next.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_read_only_file_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE orders (id INTEGER);").unwrap();
        }

        let provider = SqliteConnectionProvider::new().register("shop", &path);
        let connector = provider.connect("shop").await.unwrap();
        let err = connector.run_query("INSERT INTO orders (id) VALUES (1)", 10).await.unwrap_err();
        assert_eq!(err.class, ConnectorFailure::Permission);
    }

    #[tokio::test]
    async fn test_unknown_source_is_error() {
        let provider = SqliteConnectionProvider::new();
        assert!(provider.connect("missing").await.is_err());
    }
}
