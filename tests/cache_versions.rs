mod common;

use chrono::{Duration, NaiveDate};
use common::{Gate, GatedStore};
use report_resolver::cache::{fingerprint, CachedPayload, KvStore, MemoryKvStore, PlaceholderValue, ResultCache, SqliteKvStore};
use report_resolver::period::TimeWindow;
use report_resolver::ResolveError;
use std::sync::Arc;

fn window(day: u32) -> TimeWindow {
    let date = NaiveDate::from_ymd_opt(2025, 9, day).unwrap();
    TimeWindow::single_day(date)
}

fn entry(ph: &str, ds: &str, day: u32) -> PlaceholderValue {
    PlaceholderValue::new(
        ph,
        ds,
        "SELECT COUNT(*) FROM orders WHERE order_date = {{start_date}}",
        Some(&window(day)),
        CachedPayload::Empty,
        Duration::hours(1),
    )
}

async fn assert_single_latest(cache: &ResultCache, ph: &str, ds: &str) -> u64 {
    let versions = cache.versions(ph, ds).await.unwrap();
    let latest: Vec<_> = versions.iter().filter(|v| v.is_latest_version).collect();
    assert_eq!(latest.len(), 1, "versions: {:?}", versions.iter().map(|v| v.version).collect::<Vec<_>>());
    let max = versions.iter().map(|v| v.version).max().unwrap();
    assert_eq!(latest[0].version, max);
    let pointed = cache.get_latest(ph, ds).await.unwrap().unwrap();
    assert_eq!(pointed.value.version, max);
    max
}

async fn concurrent_puts(cache: Arc<ResultCache>) {
    let mut handles = Vec::new();
    for day in 1..=8 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move { cache.put(entry("total orders", "shop", day)).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(assert_single_latest(&cache, "total orders", "shop").await, 8);
    assert_eq!(cache.versions("total orders", "shop").await.unwrap().len(), 8);
}

#[tokio::test]
async fn test_concurrent_puts_keep_one_latest_in_memory() {
    concurrent_puts(Arc::new(ResultCache::in_memory())).await;
}

#[tokio::test]
async fn test_concurrent_puts_keep_one_latest_in_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteKvStore::open(dir.path().join("cache.db")).unwrap();
    concurrent_puts(Arc::new(ResultCache::new(Arc::new(store)))).await;
}

#[tokio::test]
async fn test_sqlite_cache_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
        let cache = ResultCache::new(Arc::new(SqliteKvStore::open(&path).unwrap()));
        cache.put(entry("total orders", "shop", 1)).await.unwrap();
        cache.put(entry("total orders", "shop", 2)).await.unwrap();
    }

    let cache = ResultCache::new(Arc::new(SqliteKvStore::open(&path).unwrap()));
    assert_eq!(assert_single_latest(&cache, "total orders", "shop").await, 2);

    let key = fingerprint(
        "total orders",
        "shop",
        "SELECT COUNT(*) FROM orders WHERE order_date = {{start_date}}",
        Some(&window(1)),
    );
    let by_key = cache.get_by_key(&key).await.unwrap().unwrap();
    assert_eq!(by_key.value.version, 1);
    assert!(!by_key.value.is_latest_version);
}

#[tokio::test]
async fn test_writers_sharing_a_store_never_fork_latest() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let writers: Vec<Arc<ResultCache>> = (0..4).map(|_| Arc::new(ResultCache::new(Arc::clone(&store)))).collect();

    let mut handles = Vec::new();
    for (i, cache) in writers.iter().enumerate() {
        for round in 0..3u32 {
            let cache = Arc::clone(cache);
            let day = 1 + i as u32 * 3 + round;
            handles.push(tokio::spawn(async move { cache.put(entry("total orders", "shop", day)).await }));
        }
    }

    let mut committed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => committed += 1,
            Err(ResolveError::CacheConflict { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    let reader = ResultCache::new(store);
    assert!(committed >= 1);
    assert_eq!(reader.versions("total orders", "shop").await.unwrap().len(), committed);
    assert_eq!(assert_single_latest(&reader, "total orders", "shop").await, committed as u64);
}

#[tokio::test]
async fn test_stale_and_prune() {
    let cache = ResultCache::in_memory();
    for day in 1..=5 {
        cache.put(entry("total orders", "shop", day)).await.unwrap();
    }
    cache.put(entry("total orders", "warehouse", 1)).await.unwrap();

    assert_eq!(cache.mark_stale("total orders", "shop").await.unwrap(), 5);
    let latest = cache.get_latest("total orders", "shop").await.unwrap().unwrap();
    assert!(latest.expired);
    assert_eq!(latest.value.version, 5);
    assert!(!cache.get_latest("total orders", "warehouse").await.unwrap().unwrap().expired);

    assert_eq!(cache.prune("total orders", 2).await.unwrap(), 3);
    let kept: Vec<u64> = cache
        .versions("total orders", "shop")
        .await
        .unwrap()
        .iter()
        .map(|v| v.version)
        .collect();
    assert_eq!(kept, vec![4, 5]);
    assert_eq!(cache.versions("total orders", "warehouse").await.unwrap().len(), 1);

    let pruned_key = fingerprint(
        "total orders",
        "shop",
        "SELECT COUNT(*) FROM orders WHERE order_date = {{start_date}}",
        Some(&window(1)),
    );
    assert!(cache.get_by_key(&pruned_key).await.unwrap().is_none());

    assert_eq!(cache.prune("total orders", 0).await.unwrap(), 1);
    assert_single_latest(&cache, "total orders", "shop").await;
}

#[tokio::test]
async fn test_hit_count_does_not_restore_replaced_latest() {
    let inner: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let gated = Arc::new(GatedStore::new(Arc::clone(&inner), Gate::BeforeCommit));
    let reader = Arc::new(ResultCache::new(gated.clone()));
    let writer = ResultCache::new(Arc::clone(&inner));

    let first = writer.put(entry("total orders", "shop", 1)).await.unwrap();
    gated.arm();
    let hit = {
        let reader = Arc::clone(&reader);
        tokio::spawn(async move { reader.record_hit(&first).await })
    };
    gated.held().await;
    writer.put(entry("total orders", "shop", 2)).await.unwrap();
    gated.release();

    assert_eq!(hit.await.unwrap().unwrap(), 1);
    assert_eq!(assert_single_latest(&writer, "total orders", "shop").await, 2);
    let versions = writer.versions("total orders", "shop").await.unwrap();
    assert_eq!(versions[0].hit_count, 1);
    assert!(!versions[0].is_latest_version);
}

#[tokio::test]
async fn test_mark_stale_does_not_restore_replaced_latest() {
    let dir = tempfile::tempdir().unwrap();
    let inner: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(dir.path().join("cache.db")).unwrap());
    let gated = Arc::new(GatedStore::new(Arc::clone(&inner), Gate::BeforeCommit));
    let reader = Arc::new(ResultCache::new(gated.clone()));
    let writer = ResultCache::new(Arc::clone(&inner));

    writer.put(entry("total orders", "shop", 1)).await.unwrap();
    gated.arm();
    let stale = {
        let reader = Arc::clone(&reader);
        tokio::spawn(async move { reader.mark_stale("total orders", "shop").await })
    };
    gated.held().await;
    writer.put(entry("total orders", "shop", 2)).await.unwrap();
    gated.release();

    assert_eq!(stale.await.unwrap().unwrap(), 2);
    assert_eq!(assert_single_latest(&writer, "total orders", "shop").await, 2);
    assert!(writer.get_latest("total orders", "shop").await.unwrap().unwrap().expired);
}
