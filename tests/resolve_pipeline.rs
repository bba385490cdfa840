mod common;

use common::{create_shop_db, harness, reference, Gate, GatedStore, ScriptedGenerator, SOURCE};
use report_resolver::cache::{KvStore, MemoryKvStore, ResultCache};
use report_resolver::placeholder::{ReanalysisReason, ScanStatus};
use report_resolver::{FailureKind, PlaceholderStatus, RunOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const TOTAL_ORDERS: &str =
    "SELECT COUNT(*) AS total FROM orders WHERE order_date BETWEEN {{start_date}} AND {{end_date}}";
const TOTAL_REVENUE: &str =
    "SELECT SUM(amount) AS revenue FROM orders WHERE order_date BETWEEN {{start_date}} AND {{end_date}}";
const AVERAGE_AMOUNT: &str =
    "SELECT AVG(amount) AS average FROM orders WHERE order_date BETWEEN {{start_date}} AND {{end_date}}";
const DAILY_ORDERS: &str = "SELECT order_date, COUNT(*) AS orders FROM orders \
     WHERE order_date BETWEEN {{start_date}} AND {{end_date}} GROUP BY order_date ORDER BY order_date";

const WEEKLY_TEMPLATE: &str = "Weekly report {{report period}}
Orders: {{total orders}}
Revenue: {{total revenue}}
From {{report start date}}
[chart:daily_orders \"daily orders\"]";

fn weekly() -> RunOptions {
    RunOptions::new(SOURCE).with_schedule("weekly").with_reference(reference())
}

fn weekly_generator() -> ScriptedGenerator {
    ScriptedGenerator::new()
        .script("total orders", &[TOTAL_ORDERS])
        .script("total revenue", &[TOTAL_REVENUE])
        .script("chart:daily_orders", &[DAILY_ORDERS])
}

#[tokio::test]
async fn test_weekly_report_resolves_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shop.db");
    create_shop_db(&db);
    let h = harness(&db, weekly_generator(), Arc::new(ResultCache::in_memory()));

    let report = h.orchestrator.run(WEEKLY_TEMPLATE, &weekly()).await;

    assert!(report.is_complete(), "{:#?}", report.outcomes);
    assert!(!report.degraded);
    assert_eq!(report.window.to_string(), "2025-09-08 ~ 2025-09-14");

    let lines: Vec<&str> = report.text.lines().collect();
    assert_eq!(lines[0], "Weekly report 2025-09-08 ~ 2025-09-14");
    assert_eq!(lines[1], "Orders: 5（total orders）");
    assert_eq!(lines[2], "Revenue: 456（total revenue）");
    assert_eq!(lines[3], "From 2025-09-08");
    assert_eq!(lines[4], "![peak: 2025-09-09](mem://shop_daily_orders_20250914.svg)");

    let svg = h.artifacts.get("mem://shop_daily_orders_20250914.svg").await.unwrap();
    assert_eq!(svg.0, "image/svg+xml");
    assert!(String::from_utf8(svg.1).unwrap().contains("<svg"));

    for id in ["total orders", "total revenue", "chart:daily_orders"] {
        let outcome = report.outcome(id).unwrap();
        assert_eq!(outcome.status, PlaceholderStatus::Resolved);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.reanalysis, Some(ReanalysisReason::MissingSql));
        assert_eq!(h.generator.calls(id), 1);

        let cached = h.cache.get_latest(id, SOURCE).await.unwrap().unwrap();
        assert!(cached.is_fresh());
        assert_eq!(cached.value.window_start.as_deref(), Some("2025-09-08"));
    }
}

#[tokio::test]
async fn test_second_run_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shop.db");
    create_shop_db(&db);
    let h = harness(&db, weekly_generator(), Arc::new(ResultCache::in_memory()));

    let first = h.orchestrator.run(WEEKLY_TEMPLATE, &weekly()).await;
    let calls = h.generator.total_calls();
    let second = h.orchestrator.run(WEEKLY_TEMPLATE, &weekly()).await;

    assert_eq!(first.text, second.text);
    assert_eq!(h.generator.total_calls(), calls);
    for id in ["total orders", "total revenue", "chart:daily_orders"] {
        let outcome = second.outcome(id).unwrap();
        assert_eq!(outcome.status, PlaceholderStatus::ResolvedFromCache, "{}", id);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.reanalysis, None);
    }

    let versions = h.cache.versions("total orders", SOURCE).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].hit_count, 1);
}

#[tokio::test]
async fn test_new_window_reuses_sql_but_executes_again() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shop.db");
    create_shop_db(&db);
    let h = harness(&db, weekly_generator(), Arc::new(ResultCache::in_memory()));

    h.orchestrator.run("Orders: {{total orders}}", &weekly()).await;
    let daily = RunOptions::new(SOURCE).with_schedule("daily").with_reference(reference());
    let report = h.orchestrator.run("Orders: {{total orders}}", &daily).await;

    // 2025-09-14 holds a single order
    assert_eq!(report.text, "Orders: 1（total orders）");
    assert_eq!(report.outcome("total orders").unwrap().status, PlaceholderStatus::Resolved);
    assert_eq!(h.generator.calls("total orders"), 1);
    assert_eq!(h.cache.versions("total orders", SOURCE).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failing_placeholder_does_not_affect_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shop.db");
    create_shop_db(&db);
    let generator = ScriptedGenerator::new()
        .script("total orders", &[TOTAL_ORDERS])
        .script("total refunds", &["SELECT SUM(amount) FROM refunds"])
        .script("average amount", &[AVERAGE_AMOUNT]);
    let h = harness(&db, generator, Arc::new(ResultCache::in_memory()));

    let text = "A={{total orders}} B={{total refunds}} C={{average amount}}";
    let report = h.orchestrator.run(text, &weekly()).await;

    assert_eq!(report.text, "A=5（total orders） B={{total refunds}} C=91.2（average amount）");
    assert!(!report.is_complete());

    let refunds = report.outcome("total refunds").unwrap();
    match &refunds.status {
        PlaceholderStatus::Failed { kind, reason } => {
            assert_eq!(*kind, FailureKind::SchemaError);
            assert!(reason.contains("refunds"), "{}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(refunds.attempts, 3);
    assert_eq!(h.generator.calls("total refunds"), 3);
    assert_eq!(report.failures().count(), 1);

    let recorded = h.cache.get_latest("total refunds", SOURCE).await.unwrap().unwrap();
    assert!(!recorded.value.success);
    assert_eq!(recorded.value.failure, Some(FailureKind::SchemaError));

    let scan = h.orchestrator.scan(text, SOURCE).await;
    let status = scan.placeholders.iter().find(|p| p.spec.id == "total refunds").unwrap().status.clone();
    assert_eq!(status, ScanStatus::NeedsReanalysis { reason: ReanalysisReason::PreviousError });
}

#[tokio::test]
async fn test_repair_recovers_from_misspelled_table() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shop.db");
    create_shop_db(&db);
    let misspelled = "SELECT COUNT(*) AS total FROM order_list WHERE order_date BETWEEN {{start_date}} AND {{end_date}}";
    let generator = ScriptedGenerator::new().script("total orders", &[misspelled, TOTAL_ORDERS]);
    let h = harness(&db, generator, Arc::new(ResultCache::in_memory()));

    let report = h.orchestrator.run("{{total orders}}", &weekly()).await;

    assert_eq!(report.text, "5（total orders）");
    let outcome = report.outcome("total orders").unwrap();
    assert_eq!(outcome.status, PlaceholderStatus::Resolved);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.sql.as_deref(), Some(TOTAL_ORDERS));
}

#[tokio::test]
async fn test_unknown_data_source_degrades_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shop.db");
    create_shop_db(&db);
    let h = harness(&db, weekly_generator(), Arc::new(ResultCache::in_memory()));

    let options = RunOptions::new("warehouse").with_schedule("weekly").with_reference(reference());
    let report = h.orchestrator.run("{{report period}} {{total orders}}", &options).await;

    assert!(report.degraded);
    assert!(!report.warnings.is_empty());
    assert_eq!(report.text, "2025-09-08 ~ 2025-09-14 {{total orders}}");
    assert!(matches!(
        report.outcome("total orders").unwrap().status,
        PlaceholderStatus::Failed { kind: FailureKind::SchemaError, .. }
    ));
    assert_eq!(h.generator.total_calls(), 0);
}

#[tokio::test]
async fn test_cancelled_run_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shop.db");
    create_shop_db(&db);
    let h = harness(&db, weekly_generator(), Arc::new(ResultCache::in_memory()));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = h.orchestrator.run_with_cancel(WEEKLY_TEMPLATE, &weekly(), cancel).await;

    for id in ["total orders", "total revenue", "chart:daily_orders"] {
        assert_eq!(report.outcome(id).unwrap().status, PlaceholderStatus::Cancelled, "{}", id);
        assert!(h.cache.get_latest(id, SOURCE).await.unwrap().is_none());
    }
    assert_eq!(report.outcome("report period").unwrap().status, PlaceholderStatus::Resolved);
    assert!(report.text.contains("{{total orders}}"));
    assert_eq!(h.artifacts.len().await, 0);
}

#[tokio::test]
async fn test_cancel_during_cache_commit_reports_what_was_stored() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shop.db");
    create_shop_db(&db);
    let inner: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let gated = Arc::new(GatedStore::new(inner, Gate::AfterCommit));
    let h = harness(&db, weekly_generator(), Arc::new(ResultCache::new(gated.clone())));

    gated.arm();
    let cancel = CancellationToken::new();
    let window = weekly();
    let run = h.orchestrator.run_with_cancel("Orders: {{total orders}}", &window, cancel.clone());
    let cancel_mid_commit = async {
        gated.held().await;
        cancel.cancel();
        gated.release();
    };
    let (report, ()) = tokio::join!(run, cancel_mid_commit);

    let outcome = report.outcome("total orders").unwrap();
    let cached = h.cache.get_latest("total orders", SOURCE).await.unwrap().unwrap();
    assert_eq!(outcome.status, PlaceholderStatus::Resolved, "{:#?}", report.outcomes);
    assert_eq!(outcome.cache_version, Some(cached.value.version));
    assert_eq!(report.text, "Orders: 5（total orders）");
}
