//! Versioned Result Cache
//!
//! Every resolution appends a new version; the previous latest version is
//! flipped in the same atomic commit. Key layout in the backing store:
//!
//! ```text
//! entry/{placeholder}/{data_source}/{version:020}  -> PlaceholderValue (JSON)
//! latest/{placeholder}/{data_source}               -> entry key of the latest version
//! fp/{cache_key}                                   -> entry key holding that fingerprint
//! ```

pub mod store;

pub use store::{KvStore, MemoryKvStore, Precondition, SqliteKvStore, WriteBatch};

use crate::chart::ChartArtifact;
use crate::error::{FailureKind, ResolveError, Result};
use crate::execution::QueryResult;
use crate::period::TimeWindow;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resolved payload carried by a cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CachedPayload {
    /// Query result plus its formatted headline value
    Value {
        result: QueryResult,
        formatted: String,
        narration: String,
    },
    /// Reference to a rendered artifact
    Artifact {
        artifact: ChartArtifact,
        narration: String,
        row_count: usize,
    },
    /// No payload, e.g. for a failed resolution
    Empty,
}

impl CachedPayload {
    pub fn narration(&self) -> Option<&str> {
        match self {
            CachedPayload::Value { narration, .. } | CachedPayload::Artifact { narration, .. } => {
                Some(narration.as_str())
            }
            CachedPayload::Empty => None,
        }
    }
}

/// One cached resolution of a placeholder against a data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderValue {
    pub placeholder_id: String,
    pub data_source_id: String,
    /// Assigned by the cache on `put`
    #[serde(default)]
    pub version: u64,
    pub payload: CachedPayload,
    /// SQL with time tokens unbound, reusable across windows
    pub sql: String,
    pub execution_time_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub quality_score: f64,
    pub cache_key: String,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub is_latest_version: bool,
    #[serde(default)]
    pub hit_count: u64,
}

impl PlaceholderValue {
    /// New successful (or failed, when `failure` is set) resolution
    /// expiring `ttl` from now.
    pub fn new(
        placeholder_id: impl Into<String>,
        data_source_id: impl Into<String>,
        sql: impl Into<String>,
        window: Option<&TimeWindow>,
        payload: CachedPayload,
        ttl: Duration,
    ) -> Self {
        let placeholder_id = placeholder_id.into();
        let data_source_id = data_source_id.into();
        let sql = sql.into();
        let now = Utc::now();
        Self {
            cache_key: fingerprint(&placeholder_id, &data_source_id, &sql, window),
            placeholder_id,
            data_source_id,
            version: 0,
            payload,
            sql,
            execution_time_ms: 0,
            success: true,
            error: None,
            failure: None,
            quality_score: 0.0,
            window_start: window.map(|w| w.start_str()),
            window_end: window.map(|w| w.end_str()),
            created_at: now,
            expires_at: now + ttl,
            is_latest_version: false,
            hit_count: 0,
        }
    }

    pub fn failed(mut self, kind: FailureKind, error: impl Into<String>) -> Self {
        self.success = false;
        self.failure = Some(kind);
        self.error = Some(error.into());
        self
    }

    pub fn with_quality(mut self, score: f64) -> Self {
        self.quality_score = score.clamp(0.0, 1.0);
        self
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = ms;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Cache read annotated with advisory expiry
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub value: PlaceholderValue,
    pub expired: bool,
}

impl CacheLookup {
    fn at(value: PlaceholderValue, now: DateTime<Utc>) -> Self {
        let expired = value.is_expired_at(now);
        Self { value, expired }
    }

    /// Usable without re-resolution
    pub fn is_fresh(&self) -> bool {
        !self.expired && self.value.success
    }
}

/// Stable identifier of placeholder + data source + SQL + window
pub fn fingerprint(placeholder_id: &str, data_source_id: &str, sql: &str, window: Option<&TimeWindow>) -> String {
    let (start, end) = window.map(|w| (w.start_str(), w.end_str())).unwrap_or_default();
    let material = [placeholder_id, data_source_id, sql.trim(), &start, &end].join("\u{1f}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes()).simple().to_string()
}

fn segment(raw: &str) -> String {
    raw.replace('%', "%25").replace('/', "%2F")
}

fn entry_prefix(placeholder_id: &str) -> String {
    format!("entry/{}/", segment(placeholder_id))
}

fn pair_prefix(placeholder_id: &str, data_source_id: &str) -> String {
    format!("entry/{}/{}/", segment(placeholder_id), segment(data_source_id))
}

fn entry_key(placeholder_id: &str, data_source_id: &str, version: u64) -> String {
    format!("{}{:020}", pair_prefix(placeholder_id, data_source_id), version)
}

fn latest_key(placeholder_id: &str, data_source_id: &str) -> String {
    format!("latest/{}/{}", segment(placeholder_id), segment(data_source_id))
}

fn fp_key(cache_key: &str) -> String {
    format!("fp/{}", segment(cache_key))
}

/// Read-modify-write attempts before giving up with a conflict
const CAS_ATTEMPTS: usize = 3;

fn conflict(placeholder_id: &str, data_source_id: &str, detail: &str) -> ResolveError {
    ResolveError::CacheConflict {
        placeholder_id: placeholder_id.to_string(),
        data_source_id: data_source_id.to_string(),
        detail: detail.to_string(),
    }
}

pub struct ResultCache {
    store: Arc<dyn KvStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store, locks: DashMap::new() }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKvStore::new()))
    }

    fn lock_for(&self, placeholder_id: &str, data_source_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(latest_key(placeholder_id, data_source_id))
            .or_default()
            .clone()
    }

    async fn load(&self, key: &str) -> Result<Option<PlaceholderValue>> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Latest version for the pair, returned even when expired.
    pub async fn get_latest(&self, placeholder_id: &str, data_source_id: &str) -> Result<Option<CacheLookup>> {
        let Some(pointer) = self.store.get(&latest_key(placeholder_id, data_source_id)).await? else {
            return Ok(None);
        };
        let value = self.load(&pointer).await?;
        if value.is_none() {
            warn!("Latest pointer for {}@{} is dangling: {}", placeholder_id, data_source_id, pointer);
        }
        Ok(value.map(|v| CacheLookup::at(v, Utc::now())))
    }

    pub async fn get_by_key(&self, cache_key: &str) -> Result<Option<CacheLookup>> {
        let Some(pointer) = self.store.get(&fp_key(cache_key)).await? else {
            return Ok(None);
        };
        Ok(self.load(&pointer).await?.map(|v| CacheLookup::at(v, Utc::now())))
    }

    /// Append `value` as the new latest version and flip the previous one.
    ///
    /// Returns the stored value with its assigned version.
    pub async fn put(&self, mut value: PlaceholderValue) -> Result<PlaceholderValue> {
        let (ph, ds) = (value.placeholder_id.clone(), value.data_source_id.clone());
        let lock = self.lock_for(&ph, &ds);
        let _guard = lock.lock().await;

        let latest = latest_key(&ph, &ds);
        let previous_pointer = self.store.get(&latest).await?;

        let mut batch = WriteBatch::new();
        let mut version = 1;

        if let Some(pointer) = &previous_pointer {
            batch = batch.require(Precondition::Equals(latest.clone(), pointer.clone()));
            if let Some(mut previous) = self.load(pointer).await? {
                version = previous.version + 1;
                previous.is_latest_version = false;
                batch = batch.put(pointer.clone(), serde_json::to_string(&previous)?);
            }
        } else {
            batch = batch.require(Precondition::Absent(latest.clone()));
        }

        // Versions are monotonic even if the pointer was lost.
        if let Some((last_key, _)) = self.store.list_prefix(&pair_prefix(&ph, &ds)).await?.last() {
            if let Some(last) = last_key.rsplit('/').next().and_then(|v| v.parse::<u64>().ok()) {
                version = version.max(last + 1);
            }
        }

        value.version = version;
        value.is_latest_version = true;
        let key = entry_key(&ph, &ds, version);

        batch = batch
            .require(Precondition::Absent(key.clone()))
            .put(key.clone(), serde_json::to_string(&value)?)
            .put(latest, key.clone())
            .put(fp_key(&value.cache_key), key.clone());

        if !self.store.commit(batch).await? {
            return Err(conflict(&ph, &ds, "latest version changed during write"));
        }

        info!(
            "Cached {}@{} version {} (success={})",
            value.placeholder_id, value.data_source_id, version, value.success
        );
        Ok(value)
    }

    /// Count a cache hit on the stored version of `value`.
    ///
    /// The write-back is conditional on the entry being unchanged since it
    /// was read; other caches may share the store.
    pub async fn record_hit(&self, value: &PlaceholderValue) -> Result<u64> {
        let (ph, ds) = (&value.placeholder_id, &value.data_source_id);
        let lock = self.lock_for(ph, ds);
        let _guard = lock.lock().await;

        let key = entry_key(ph, ds, value.version);
        for _ in 0..CAS_ATTEMPTS {
            let Some(raw) = self.store.get(&key).await? else {
                return Ok(0);
            };
            let mut stored: PlaceholderValue = serde_json::from_str(&raw)?;
            stored.hit_count += 1;
            let batch = WriteBatch::new()
                .require(Precondition::Equals(key.clone(), raw))
                .put(key.clone(), serde_json::to_string(&stored)?);
            if self.store.commit(batch).await? {
                debug!("Cache hit {} on {}", stored.hit_count, key);
                return Ok(stored.hit_count);
            }
            debug!("{} changed while counting a hit, retrying", key);
        }
        Err(conflict(ph, ds, "entry kept changing while counting a hit"))
    }

    /// Expire every unexpired version of the pair. Returns how many changed.
    pub async fn mark_stale(&self, placeholder_id: &str, data_source_id: &str) -> Result<usize> {
        let lock = self.lock_for(placeholder_id, data_source_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        for _ in 0..CAS_ATTEMPTS {
            let mut batch = WriteBatch::new();
            let mut count = 0;
            for (key, raw) in self.store.list_prefix(&pair_prefix(placeholder_id, data_source_id)).await? {
                let mut value: PlaceholderValue = serde_json::from_str(&raw)?;
                if !value.is_expired_at(now) {
                    value.expires_at = now;
                    batch = batch
                        .require(Precondition::Equals(key.clone(), raw))
                        .put(key, serde_json::to_string(&value)?);
                    count += 1;
                }
            }

            if batch.is_empty() || self.store.commit(batch).await? {
                info!("Marked {} versions of {}@{} stale", count, placeholder_id, data_source_id);
                return Ok(count);
            }
            debug!("Versions of {}@{} changed while expiring, retrying", placeholder_id, data_source_id);
        }
        Err(conflict(placeholder_id, data_source_id, "versions kept changing while expiring"))
    }

    /// Keep the `keep_n` most recent versions per data source; the latest
    /// version always survives. Returns how many versions were removed.
    pub async fn prune(&self, placeholder_id: &str, keep_n: usize) -> Result<usize> {
        let entries = self.store.list_prefix(&entry_prefix(placeholder_id)).await?;

        let mut by_source: Vec<(String, Vec<(String, PlaceholderValue)>)> = Vec::new();
        for (key, raw) in entries {
            let value: PlaceholderValue = serde_json::from_str(&raw)?;
            match by_source.iter_mut().find(|(ds, _)| *ds == value.data_source_id) {
                Some((_, versions)) => versions.push((key, value)),
                None => by_source.push((value.data_source_id.clone(), vec![(key, value)])),
            }
        }

        let mut removed = 0;
        for (data_source_id, mut versions) in by_source {
            let lock = self.lock_for(placeholder_id, &data_source_id);
            let _guard = lock.lock().await;

            versions.sort_by(|a, b| b.1.version.cmp(&a.1.version));
            let mut batch = WriteBatch::new();
            for (idx, (key, value)) in versions.iter().enumerate() {
                if idx < keep_n || value.is_latest_version {
                    continue;
                }
                let fp = fp_key(&value.cache_key);
                if self.store.get(&fp).await?.as_deref() == Some(key.as_str()) {
                    batch = batch.delete(fp);
                }
                batch = batch.delete(key.clone());
                removed += 1;
            }
            if !batch.is_empty() {
                self.store.commit(batch).await?;
            }
        }

        info!("Pruned {} versions of {}", removed, placeholder_id);
        Ok(removed)
    }

    /// All stored versions for the pair, oldest first
    pub async fn versions(&self, placeholder_id: &str, data_source_id: &str) -> Result<Vec<PlaceholderValue>> {
        self.store
            .list_prefix(&pair_prefix(placeholder_id, data_source_id))
            .await?
            .into_iter()
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(ResolveError::from))
            .collect()
    }
}
