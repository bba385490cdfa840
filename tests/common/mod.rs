#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use report_resolver::cache::{KvStore, ResultCache, WriteBatch};
use report_resolver::chart::MemoryArtifactStore;
use report_resolver::connector::sqlite::{SqliteConnectionProvider, SqliteConnector};
use report_resolver::sql::{GenerationRequest, SqlGenerationResult, SqlGenerator};
use report_resolver::{Components, Orchestrator, ResolverConfig};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const SOURCE: &str = "shop";

/// Monday 2025-09-15; the weekly window is 2025-09-08 ~ 2025-09-14.
pub fn reference() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 15, 9, 0, 0).unwrap()
}

/// Orders table with 5 rows inside the weekly window and 2 outside.
pub fn create_shop_db(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer TEXT, amount REAL, order_date TEXT);
         INSERT INTO orders (customer, amount, order_date) VALUES
             ('alice', 120.5, '2025-09-08'),
             ('bob',    80.0, '2025-09-09'),
             ('alice',  40.0, '2025-09-09'),
             ('carol', 200.0, '2025-09-12'),
             ('bob',    15.5, '2025-09-14'),
             ('dave',   99.0, '2025-09-01'),
             ('erin',   10.0, '2025-09-15');",
    )
    .unwrap();
}

pub fn shop_connector(path: &Path) -> SqliteConnector {
    SqliteConnector::open_read_only(SOURCE, path).unwrap()
}

/// Generator replaying fixed SQL per placeholder id. The last entry repeats
/// once the script runs out; an unknown id yields an empty generation.
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: HashMap<String, Vec<String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, placeholder_id: &str, sql: &[&str]) -> Self {
        self.scripts
            .insert(placeholder_id.to_string(), sql.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn calls(&self, placeholder_id: &str) -> usize {
        self.calls.lock().unwrap().get(placeholder_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl SqlGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest<'_>) -> SqlGenerationResult {
        let id = request.placeholder.id.clone();
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        match self.scripts.get(&id) {
            Some(script) if !script.is_empty() => {
                let sql = &script[(call - 1).min(script.len() - 1)];
                SqlGenerationResult::new(sql.clone(), 0.8, format!("scripted attempt {}", call))
            }
            _ => SqlGenerationResult::new("", 0.0, "no script"),
        }
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub generator: Arc<ScriptedGenerator>,
    pub cache: Arc<ResultCache>,
    pub artifacts: Arc<MemoryArtifactStore>,
}

pub fn harness(db: &Path, generator: ScriptedGenerator, cache: Arc<ResultCache>) -> Harness {
    let config = ResolverConfig::default();
    let generator = Arc::new(generator);
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let connections = SqliteConnectionProvider::new().register(SOURCE, db);
    let components = Components::with_defaults(
        Arc::new(connections),
        generator.clone(),
        Arc::clone(&cache),
        artifacts.clone(),
        &config,
    );
    Harness { orchestrator: Orchestrator::new(components, config), generator, cache, artifacts }
}

/// Where a [`GatedStore`] holds its first commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Before the batch reaches the inner store
    BeforeCommit,
    /// After the batch landed, before the caller sees the result
    AfterCommit,
}

/// Store wrapper that pauses the first commit after `arm` until `release`.
pub struct GatedStore {
    inner: Arc<dyn KvStore>,
    gate: Gate,
    armed: AtomicBool,
    reached: Notify,
    resume: Notify,
}

impl GatedStore {
    pub fn new(inner: Arc<dyn KvStore>, gate: Gate) -> Self {
        Self { inner, gate, armed: AtomicBool::new(false), reached: Notify::new(), resume: Notify::new() }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until the armed commit is being held.
    pub async fn held(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.resume.notify_one();
    }

    async fn pause(&self) {
        self.reached.notify_one();
        self.resume.notified().await;
    }
}

#[async_trait]
impl KvStore for GatedStore {
    async fn get(&self, key: &str) -> report_resolver::Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &str) -> report_resolver::Result<()> {
        self.inner.put(key, value).await
    }

    async fn list_prefix(&self, prefix: &str) -> report_resolver::Result<Vec<(String, String)>> {
        self.inner.list_prefix(prefix).await
    }

    async fn delete(&self, key: &str) -> report_resolver::Result<bool> {
        self.inner.delete(key).await
    }

    async fn commit(&self, batch: WriteBatch) -> report_resolver::Result<bool> {
        let held = self.armed.swap(false, Ordering::SeqCst);
        if held && self.gate == Gate::BeforeCommit {
            self.pause().await;
        }
        let applied = self.inner.commit(batch).await?;
        if held && self.gate == Gate::AfterCommit {
            self.pause().await;
        }
        Ok(applied)
    }
}
