//! Key-value persistence behind the result cache
//!
//! Two backends with identical semantics:
//! - `MemoryKvStore`: ordered in-process map, for tests and one-shot runs
//! - `SqliteKvStore`: single-table SQLite file, durable across runs
//!
//! `commit` applies a batch atomically and only if all preconditions hold,
//! which is what the cache needs for its "flip latest" transition.

use crate::error::{ResolveError, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::info;

/// Condition checked before a batch is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Key must not exist
    Absent(String),
    /// Key must hold exactly this value
    Equals(String, String),
}

#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub preconditions: Vec<Precondition>,
    pub puts: Vec<(String, String)>,
    pub deletes: Vec<String>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, condition: Precondition) -> Self {
        self.preconditions.push(condition);
        self
    }

    pub fn put(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.puts.push((key.into(), value.into()));
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.deletes.push(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Apply a batch atomically. Returns `false`, writing nothing, when a
    /// precondition fails.
    async fn commit(&self, batch: WriteBatch) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    data: RwLock<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.data.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.data.write().await.remove(key).is_some())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<bool> {
        let mut data = self.data.write().await;
        let holds = batch.preconditions.iter().all(|c| match c {
            Precondition::Absent(key) => !data.contains_key(key),
            Precondition::Equals(key, value) => data.get(key) == Some(value),
        });
        if !holds {
            return Ok(false);
        }
        for key in batch.deletes {
            data.remove(&key);
        }
        for (key, value) in batch.puts {
            data.insert(key, value);
        }
        Ok(true)
    }
}

/// SQLite-backed store: one `kv(key, value)` table.
pub struct SqliteKvStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path)
            .map_err(|e| ResolveError::Storage(format!("Failed to open cache database: {}", e)))?;
        let store = Self::from_connection(db)?;
        info!("Opened result cache at {}", path.display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()
            .map_err(|e| ResolveError::Storage(format!("Failed to open cache database: {}", e)))?;
        Self::from_connection(db)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| ResolveError::Storage(format!("Failed to create table: {}", e)))?;
        Ok(Self { db: Arc::new(Mutex::new(db)) })
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|_| ResolveError::Storage("cache connection lock poisoned".to_string()))?;
            work(&mut conn)
        })
        .await
        .map_err(|e| ResolveError::Storage(format!("cache task failed: {}", e)))?
    }
}

fn storage_err(context: &str) -> impl Fn(rusqlite::Error) -> ResolveError + '_ {
    move |e| ResolveError::Storage(format!("{}: {}", context, e))
}

fn lookup(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
        .optional()
        .map_err(storage_err("Failed to read key"))
}

/// Escape `%`, `_` and `\` for a LIKE pattern with `ESCAPE '\'`
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.blocking(move |conn| lookup(conn, &key)).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(storage_err("Failed to write key"))?;
            Ok(())
        })
        .await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let pattern = like_prefix(prefix);
        let prefix = prefix.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare("SELECT key, value FROM kv WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")
                .map_err(storage_err("Failed to prepare prefix scan"))?;
            let rows = stmt
                .query_map(params![pattern], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(storage_err("Failed to scan prefix"))?;
            let mut out = Vec::new();
            for row in rows {
                let (key, value) = row.map_err(storage_err("Failed to read row"))?;
                // LIKE is case-insensitive for ASCII in SQLite.
                if key.starts_with(&prefix) {
                    out.push((key, value));
                }
            }
            Ok(out)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let removed = conn
                .execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(storage_err("Failed to delete key"))?;
            Ok(removed > 0)
        })
        .await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<bool> {
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(storage_err("Failed to start transaction"))?;

            for condition in &batch.preconditions {
                let holds = match condition {
                    Precondition::Absent(key) => lookup(&tx, key)?.is_none(),
                    Precondition::Equals(key, value) => lookup(&tx, key)?.as_deref() == Some(value.as_str()),
                };
                if !holds {
                    // Dropping the transaction rolls it back.
                    return Ok(false);
                }
            }

            for key in &batch.deletes {
                tx.execute("DELETE FROM kv WHERE key = ?1", params![key])
                    .map_err(storage_err("Failed to delete key"))?;
            }
            for (key, value) in &batch.puts {
                tx.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )
                .map_err(storage_err("Failed to write key"))?;
            }

            tx.commit().map_err(storage_err("Failed to commit transaction"))?;
            Ok(true)
        })
        .await
    }
}
