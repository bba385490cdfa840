//! Placeholder Scanner
//!
//! Extracts and classifies template tokens, then decides per token whether
//! the cached SQL can be reused. Read-only: nothing is written anywhere.

use crate::cache::{CacheLookup, ResultCache};
use crate::connector::Connector;
use crate::placeholder::classifier::PlaceholderClassifier;
use crate::placeholder::grammar::tokenize;
use crate::placeholder::spec::{PlaceholderKind, PlaceholderSpec};
use crate::schema::{SchemaContext, SchemaDiscovery};
use crate::sql::SqlValidator;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReanalysisReason {
    MissingSql,
    Expired,
    PreviousError,
    SchemaChanged,
}

impl ReanalysisReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReanalysisReason::MissingSql => "missing_sql",
            ReanalysisReason::Expired => "expired",
            ReanalysisReason::PreviousError => "previous_error",
            ReanalysisReason::SchemaChanged => "schema_changed",
        }
    }
}

impl fmt::Display for ReanalysisReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanStatus {
    /// Cached SQL is reusable; skip generation
    Fresh,
    NeedsReanalysis { reason: ReanalysisReason },
    /// Computed without SQL (period tokens)
    Computed,
}

#[derive(Debug, Clone)]
pub struct ScannedPlaceholder {
    pub spec: PlaceholderSpec,
    pub status: ScanStatus,
    /// Latest cache entry, when one exists
    pub cached: Option<CacheLookup>,
}

impl ScannedPlaceholder {
    pub fn is_fresh(&self) -> bool {
        self.status == ScanStatus::Fresh
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Unique placeholders in first-occurrence order
    pub placeholders: Vec<ScannedPlaceholder>,
    /// Present when schema discovery succeeded
    pub schema: Option<SchemaContext>,
    pub warnings: Vec<String>,
}

impl ScanReport {
    /// Reduced confidence: classification ran without a schema
    pub fn is_degraded(&self) -> bool {
        self.schema.is_none()
    }
}

pub struct Scanner {
    classifier: Arc<dyn PlaceholderClassifier>,
    cache: Arc<ResultCache>,
    discovery: Arc<dyn SchemaDiscovery>,
    validator: SqlValidator,
}

impl Scanner {
    pub fn new(
        classifier: Arc<dyn PlaceholderClassifier>,
        cache: Arc<ResultCache>,
        discovery: Arc<dyn SchemaDiscovery>,
    ) -> Self {
        Self { classifier, cache, discovery, validator: SqlValidator::new() }
    }

    /// Classified tokens of `text` without cache or schema lookups
    pub fn classify(&self, text: &str) -> Vec<PlaceholderSpec> {
        let mut seen = HashSet::new();
        tokenize(text)
            .into_iter()
            .filter(|token| seen.insert(token.id()))
            .map(|token| {
                let kind = self.classifier.classify(&token.description, &token.syntax);
                let granularity = self.classifier.granularity(&token.description);
                PlaceholderSpec::from_token(&token, kind, granularity)
            })
            .collect()
    }

    /// Scan `text` for `data_source_id`. A missing connector or a failed
    /// discovery degrades the scan instead of failing it.
    pub async fn scan(&self, text: &str, data_source_id: &str, connector: Option<&dyn Connector>) -> ScanReport {
        let mut report = ScanReport::default();

        match connector {
            Some(connector) => match self.discovery.discover(connector).await {
                Ok(schema) => report.schema = Some(schema),
                Err(e) => {
                    warn!("Schema discovery for {} failed: {}", data_source_id, e);
                    report
                        .warnings
                        .push(format!("schema discovery failed, classification has reduced confidence: {}", e));
                }
            },
            None => report
                .warnings
                .push(format!("data source {} unavailable, classification has reduced confidence", data_source_id)),
        }

        for spec in self.classify(text) {
            if spec.kind == PlaceholderKind::Period {
                report.placeholders.push(ScannedPlaceholder { spec, status: ScanStatus::Computed, cached: None });
                continue;
            }

            let cached = match self.cache.get_latest(&spec.id, data_source_id).await {
                Ok(cached) => cached,
                Err(e) => {
                    warn!("Cache lookup for '{}' failed: {}", spec.id, e);
                    report.warnings.push(format!("cache lookup for '{}' failed: {}", spec.id, e));
                    None
                }
            };
            let status = self.freshness(cached.as_ref(), report.schema.as_ref());
            report.placeholders.push(ScannedPlaceholder { spec, status, cached });
        }

        info!(
            "Scanned {} placeholders ({} fresh) for {}",
            report.placeholders.len(),
            report.placeholders.iter().filter(|p| p.is_fresh()).count(),
            data_source_id
        );
        report
    }

    fn freshness(&self, cached: Option<&CacheLookup>, schema: Option<&SchemaContext>) -> ScanStatus {
        let reason = match cached {
            None => Some(ReanalysisReason::MissingSql),
            Some(c) if c.value.sql.trim().is_empty() => Some(ReanalysisReason::MissingSql),
            Some(c) if !c.value.success => Some(ReanalysisReason::PreviousError),
            Some(c) if c.expired => Some(ReanalysisReason::Expired),
            Some(c) => match schema {
                Some(schema) if !self.validator.validate(&c.value.sql, schema).invalid_tables.is_empty() => {
                    Some(ReanalysisReason::SchemaChanged)
                }
                _ => None,
            },
        };
        match reason {
            Some(reason) => ScanStatus::NeedsReanalysis { reason },
            None => ScanStatus::Fresh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachedPayload, PlaceholderValue};
    use crate::connector::{ConnectorError, RawResultSet};
    use crate::error::{FailureKind, ResolveError, Result};
    use crate::placeholder::classifier::KeywordClassifier;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    struct FixedSchema(Option<SchemaContext>);

    #[async_trait]
    impl SchemaDiscovery for FixedSchema {
        async fn discover(&self, _connector: &dyn Connector) -> Result<SchemaContext> {
            self.0.clone().ok_or_else(|| ResolveError::Schema("connection refused".to_string()))
        }
    }

    struct Idle;

    #[async_trait]
    impl Connector for Idle {
        fn source_id(&self) -> &str {
            "shop"
        }
        async fn list_tables(&self) -> std::result::Result<Vec<String>, ConnectorError> {
            Ok(Vec::new())
        }
        async fn list_columns(&self, _t: &str) -> std::result::Result<Vec<String>, ConnectorError> {
            Ok(Vec::new())
        }
        async fn run_query(&self, _s: &str, _l: usize) -> std::result::Result<RawResultSet, ConnectorError> {
            Ok(RawResultSet::default())
        }
    }

    fn scanner(cache: Arc<ResultCache>, schema: Option<SchemaContext>) -> Scanner {
        Scanner::new(Arc::new(KeywordClassifier::new()), cache, Arc::new(FixedSchema(schema)))
    }

    fn entry(ph: &str, sql: &str) -> PlaceholderValue {
        PlaceholderValue::new(ph, "shop", sql, None, CachedPayload::Empty, Duration::hours(1))
    }

    const TEMPLATE: &str = "Period {{report period}}: {{total orders}} / {{order count}} / {{top customers}} / {{refund rate}} / {{total orders}}";

    #[tokio::test]
    async fn test_statuses() {
        let cache = Arc::new(ResultCache::in_memory());
        cache.put(entry("total orders", "SELECT COUNT(*) FROM orders")).await.unwrap();
        cache
            .put(entry("order count", "SELECT COUNT(*) FROM orders").failed(FailureKind::SchemaError, "boom"))
            .await
            .unwrap();
        let mut expired = entry("top customers", "SELECT name FROM customers LIMIT 5");
        expired.expires_at = Utc::now() - Duration::seconds(1);
        cache.put(expired).await.unwrap();
        cache.put(entry("refund rate", "SELECT AVG(x) FROM refunds")).await.unwrap();

        let schema = SchemaContext::new()
            .with_table("orders", &["id"])
            .with_table("customers", &["name"]);
        let report = scanner(cache, Some(schema)).scan(TEMPLATE, "shop", Some(&Idle)).await;

        let statuses: Vec<_> = report.placeholders.iter().map(|p| (p.spec.id.as_str(), p.status.clone())).collect();
        assert_eq!(
            statuses,
            vec![
                ("report period", ScanStatus::Computed),
                ("total orders", ScanStatus::Fresh),
                ("order count", ScanStatus::NeedsReanalysis { reason: ReanalysisReason::PreviousError }),
                ("top customers", ScanStatus::NeedsReanalysis { reason: ReanalysisReason::Expired }),
                ("refund rate", ScanStatus::NeedsReanalysis { reason: ReanalysisReason::SchemaChanged }),
            ]
        );
        assert!(report.warnings.is_empty());
        assert!(!report.is_degraded());
    }

    #[tokio::test]
    async fn test_discovery_failure_degrades_scan() {
        let cache = Arc::new(ResultCache::in_memory());
        let report = scanner(cache, None).scan("{{total orders}}", "shop", Some(&Idle)).await;
        assert!(report.is_degraded());
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.placeholders[0].spec.kind, PlaceholderKind::Statistical);
        assert_eq!(
            report.placeholders[0].status,
            ScanStatus::NeedsReanalysis { reason: ReanalysisReason::MissingSql }
        );
    }
}
