//! Two-Phase Orchestrator
//!
//! Phase 1 (analysis) runs the repair loop for every placeholder whose cached
//! SQL cannot be reused. Phase 2 (execution) runs the SQL, renders charts,
//! narrates and writes the cache. Each phase fans out one task per
//! placeholder behind a semaphore; a placeholder's failure never touches its
//! siblings. Assembly substitutes whatever resolved.

use crate::cache::{fingerprint, CacheLookup, CachedPayload, PlaceholderValue, ResultCache};
use crate::chart::{ArtifactStore, ChartIntent, ChartRenderer, ChartType, SvgChartRenderer};
use crate::config::ResolverConfig;
use crate::connector::{ConnectionProvider, Connector};
use crate::error::{FailureKind, ResolveError, Result};
use crate::execution::{ConnectorExecutor, ExecutionContext, QueryResult, SqlExecutor};
use crate::execution_loop::{RepairInput, RepairLoop};
use crate::narration::{clamp_narration, NarrationRequest, Narrator, TemplateNarrator};
use crate::period::{bind_time_window, DateOverrides, PeriodResolver, TimeWindow};
use crate::placeholder::spec::slug;
use crate::placeholder::{
    ArtifactKind, ArtifactTarget, KeywordClassifier, PlaceholderClassifier, PlaceholderKind, PlaceholderSpec,
    ReanalysisReason, Replacer, ResolvedValue, ScanReport, ScanStatus, Scanner,
};
use crate::schema::{ConnectorSchemaDiscovery, SchemaContext, SchemaDiscovery};
use crate::sql::SqlGenerator;
use crate::template::TemplateSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Adapters injected once per process
#[derive(Clone)]
pub struct Components {
    pub connections: Arc<dyn ConnectionProvider>,
    pub discovery: Arc<dyn SchemaDiscovery>,
    pub generator: Arc<dyn SqlGenerator>,
    pub executor: Arc<dyn SqlExecutor>,
    pub cache: Arc<ResultCache>,
    pub renderer: Arc<dyn ChartRenderer>,
    pub narrator: Arc<dyn Narrator>,
    pub classifier: Arc<dyn PlaceholderClassifier>,
    pub period: Arc<PeriodResolver>,
}

impl Components {
    /// Default adapters around the given collaborators
    pub fn with_defaults(
        connections: Arc<dyn ConnectionProvider>,
        generator: Arc<dyn SqlGenerator>,
        cache: Arc<ResultCache>,
        artifacts: Arc<dyn ArtifactStore>,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            connections,
            discovery: Arc::new(ConnectorSchemaDiscovery::new()),
            generator,
            executor: Arc::new(ConnectorExecutor::new()),
            cache,
            renderer: Arc::new(SvgChartRenderer::new(artifacts, config.chart_width, config.chart_height)),
            narrator: Arc::new(TemplateNarrator::new()),
            classifier: Arc::new(KeywordClassifier::new()),
            period: Arc::new(PeriodResolver::default()),
        }
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(Arc::clone(&self.classifier), Arc::clone(&self.cache), Arc::clone(&self.discovery))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub data_source_id: String,
    pub schedule: Option<String>,
    pub reference: Option<DateTime<Utc>>,
    pub overrides: DateOverrides,
}

impl RunOptions {
    pub fn new(data_source_id: impl Into<String>) -> Self {
        Self { data_source_id: data_source_id.into(), ..Self::default() }
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn with_reference(mut self, reference: DateTime<Utc>) -> Self {
        self.reference = Some(reference);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlaceholderStatus {
    Resolved,
    ResolvedFromCache,
    Failed { kind: FailureKind, reason: String },
    Cancelled,
}

impl fmt::Display for PlaceholderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceholderStatus::Resolved => f.write_str("resolved"),
            PlaceholderStatus::ResolvedFromCache => f.write_str("resolved_from_cache"),
            PlaceholderStatus::Failed { kind, reason } => write!(f, "failed: {}: {}", kind, reason),
            PlaceholderStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderOutcome {
    pub id: String,
    pub kind: PlaceholderKind,
    pub status: PlaceholderStatus,
    /// Generation calls spent in phase 1
    pub attempts: usize,
    pub quality_score: Option<f64>,
    pub sql: Option<String>,
    pub cache_version: Option<u64>,
    /// Why phase 1 ran, when it did
    pub reanalysis: Option<ReanalysisReason>,
}

impl PlaceholderOutcome {
    fn new(spec: &PlaceholderSpec, status: PlaceholderStatus) -> Self {
        Self {
            id: spec.id.clone(),
            kind: spec.kind,
            status,
            attempts: 0,
            quality_score: None,
            sql: None,
            cache_version: None,
            reanalysis: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.status, PlaceholderStatus::Resolved | PlaceholderStatus::ResolvedFromCache)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub data_source_id: String,
    pub window: TimeWindow,
    /// Assembled template text
    pub text: String,
    pub outcomes: Vec<PlaceholderOutcome>,
    /// True when schema discovery was unavailable
    pub degraded: bool,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.is_resolved())
    }

    pub fn outcome(&self, id: &str) -> Option<&PlaceholderOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &PlaceholderOutcome> {
        self.outcomes.iter().filter(|o| !o.is_resolved())
    }
}

/// Terminal state of one placeholder within a run
struct Resolution {
    outcome: PlaceholderOutcome,
    value: Option<ResolvedValue>,
    warnings: Vec<String>,
}

impl Resolution {
    fn resolved(outcome: PlaceholderOutcome, value: ResolvedValue) -> Self {
        Self { outcome, value: Some(value), warnings: Vec::new() }
    }

    fn failed(spec: &PlaceholderSpec, kind: FailureKind, reason: impl Into<String>) -> Self {
        let status = PlaceholderStatus::Failed { kind, reason: reason.into() };
        Self { outcome: PlaceholderOutcome::new(spec, status), value: None, warnings: Vec::new() }
    }

    fn cancelled(spec: &PlaceholderSpec) -> Self {
        Self { outcome: PlaceholderOutcome::new(spec, PlaceholderStatus::Cancelled), value: None, warnings: Vec::new() }
    }

    fn with_attempts(mut self, attempts: usize, quality: Option<f64>, sql: Option<String>) -> Self {
        self.outcome.attempts = attempts;
        self.outcome.quality_score = quality;
        self.outcome.sql = sql;
        self
    }
}

enum Analysis {
    Ready { sql: String, quality: f64, attempts: usize },
    Done(Resolution),
}

/// Where phase 2 gets its SQL from
enum SqlSource {
    Cached(CacheLookup),
    Generated { sql: String, quality: f64, attempts: usize },
}

type Job<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// State shared by the tasks of one run
struct RunContext {
    components: Components,
    config: ResolverConfig,
    repair: RepairLoop,
    window: TimeWindow,
    data_source_id: String,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    components: Components,
    config: ResolverConfig,
}

impl Orchestrator {
    pub fn new(components: Components, config: ResolverConfig) -> Self {
        Self { components, config }
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn resolve_window(&self, options: &RunOptions) -> TimeWindow {
        self.components
            .period
            .resolve(options.schedule.as_deref(), options.reference, &options.overrides)
    }

    async fn connect(&self, data_source_id: &str) -> (Option<Arc<dyn Connector>>, Option<String>) {
        match self.components.connections.connect(data_source_id).await {
            Ok(connector) => (Some(connector), None),
            Err(e) => {
                warn!("Could not connect to {}: {}", data_source_id, e);
                (None, Some(format!("could not connect to {}: {}", data_source_id, e)))
            }
        }
    }

    /// Scan only; nothing is generated, executed or written.
    pub async fn scan(&self, text: &str, data_source_id: &str) -> ScanReport {
        let (connector, warning) = self.connect(data_source_id).await;
        let mut report = self.components.scanner().scan(text, data_source_id, connector.as_deref()).await;
        report.warnings.extend(warning);
        report
    }

    /// Load a template by id and resolve it.
    pub async fn run_template(
        &self,
        source: &dyn TemplateSource,
        template_id: &str,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let text = source.load(template_id).await?;
        Ok(self.run(&text, options).await)
    }

    pub async fn run(&self, text: &str, options: &RunOptions) -> RunReport {
        self.run_with_cancel(text, options, CancellationToken::new()).await
    }

    /// Resolve every placeholder in `text`. Cancelling `cancel` stops pending
    /// tasks. A placeholder reported as cancelled wrote nothing to the cache;
    /// a cache commit already under way completes and is reported as such.
    pub async fn run_with_cancel(&self, text: &str, options: &RunOptions, cancel: CancellationToken) -> RunReport {
        let window = self.resolve_window(options);
        let data_source_id = options.data_source_id.clone();
        info!("Resolving template for {} over {}", data_source_id, window);

        let (connector, connect_warning) = self.connect(&data_source_id).await;
        let scan = self.components.scanner().scan(text, &data_source_id, connector.as_deref()).await;
        let mut warnings: Vec<String> = connect_warning.into_iter().collect();
        warnings.extend(scan.warnings.iter().cloned());
        let degraded = scan.is_degraded();
        let schema: Option<Arc<SchemaContext>> = scan.schema.clone().map(Arc::new);

        let ctx = Arc::new(RunContext {
            components: self.components.clone(),
            config: self.config.clone(),
            repair: RepairLoop::new(
                Arc::clone(&self.components.generator),
                Arc::clone(&self.components.executor),
                self.config.max_iterations,
                self.config.abort_on_repeat_error,
            ),
            window,
            data_source_id: data_source_id.clone(),
            cancel: cancel.clone(),
        });

        let mut resolutions: HashMap<String, Resolution> = HashMap::new();
        let mut phase2: Vec<(PlaceholderSpec, SqlSource)> = Vec::new();
        let mut phase1: Vec<(String, Job<Analysis>)> = Vec::new();
        let mut reasons: HashMap<String, ReanalysisReason> = HashMap::new();

        for scanned in &scan.placeholders {
            let spec = scanned.spec.clone();
            match &scanned.status {
                ScanStatus::Computed => {
                    let value = ResolvedValue::Period { text: window.format_for(&spec.description) };
                    let outcome = PlaceholderOutcome::new(&spec, PlaceholderStatus::Resolved);
                    resolutions.insert(spec.id.clone(), Resolution::resolved(outcome, value));
                }
                ScanStatus::Fresh => match scanned.cached.clone() {
                    Some(cached) => phase2.push((spec, SqlSource::Cached(cached))),
                    None => {
                        let failure = Resolution::failed(&spec, FailureKind::ExecutionError, "cache entry vanished");
                        resolutions.insert(spec.id.clone(), failure);
                    }
                },
                ScanStatus::NeedsReanalysis { reason } => {
                    reasons.insert(spec.id.clone(), *reason);
                    match (&schema, &connector) {
                        (Some(schema), Some(connector)) => {
                            let job: Job<Analysis> =
                                Box::pin(analyse(Arc::clone(&ctx), spec.clone(), Arc::clone(schema), Arc::clone(connector)));
                            phase1.push((spec.id.clone(), job));
                        }
                        _ => {
                            let failure = Resolution::failed(&spec, FailureKind::SchemaError, "schema unavailable for data source");
                            resolutions.insert(spec.id.clone(), failure);
                        }
                    }
                }
            }
        }

        // Phase 1: analysis
        info!("Phase 1: analysing {} placeholders", phase1.len());
        let analysed = run_bounded(self.config.max_concurrency, &cancel, phase1).await;
        let specs: HashMap<&str, &PlaceholderSpec> =
            scan.placeholders.iter().map(|p| (p.spec.id.as_str(), &p.spec)).collect();
        for (id, analysis) in analysed {
            let Some(spec) = specs.get(id.as_str()) else { continue };
            match analysis {
                Some(Analysis::Ready { sql, quality, attempts }) => {
                    phase2.push(((*spec).clone(), SqlSource::Generated { sql, quality, attempts }));
                }
                Some(Analysis::Done(resolution)) => {
                    resolutions.insert(id, resolution);
                }
                None => {
                    resolutions.insert(id, Resolution::cancelled(spec));
                }
            }
        }

        // Phase 2: execution
        let mut jobs: Vec<(String, Job<Resolution>)> = Vec::new();
        for (spec, source) in phase2 {
            if cancel.is_cancelled() {
                resolutions.insert(spec.id.clone(), Resolution::cancelled(&spec));
                continue;
            }
            let id = spec.id.clone();
            let job: Job<Resolution> = Box::pin(execute(Arc::clone(&ctx), spec, source, connector.clone()));
            jobs.push((id, job));
        }
        info!("Phase 2: executing {} placeholders", jobs.len());
        let executed = run_bounded(self.config.max_concurrency, &cancel, jobs).await;
        for (id, result) in executed {
            let Some(spec) = specs.get(id.as_str()) else { continue };
            let resolution = result.unwrap_or_else(|| Resolution::cancelled(spec));
            resolutions.insert(id, resolution);
        }

        // Assembly
        let mut resolved_values = HashMap::new();
        let mut outcomes = Vec::new();
        for scanned in &scan.placeholders {
            let id = &scanned.spec.id;
            let mut resolution = resolutions.remove(id).unwrap_or_else(|| {
                if cancel.is_cancelled() {
                    Resolution::cancelled(&scanned.spec)
                } else {
                    Resolution::failed(&scanned.spec, FailureKind::ExecutionError, "task aborted")
                }
            });
            resolution.outcome.reanalysis = reasons.get(id).copied();
            if let Some(value) = resolution.value.take() {
                resolved_values.insert(id.clone(), value);
            }
            warnings.append(&mut resolution.warnings);
            outcomes.push(resolution.outcome);
        }

        let assembled = Replacer::new().replace(text, &resolved_values);
        let report = RunReport {
            data_source_id,
            window,
            text: assembled,
            outcomes,
            degraded,
            warnings,
        };
        info!(
            "Resolved {}/{} placeholders",
            report.outcomes.iter().filter(|o| o.is_resolved()).count(),
            report.outcomes.len()
        );
        report
    }
}

/// Run jobs with at most `limit` in flight. A job missing from the result
/// panicked; `None` means it was cancelled before it started. Jobs that
/// started are awaited to completion and watch the token themselves, so a
/// cache commit is never dropped halfway.
async fn run_bounded<T: Send + 'static>(
    limit: usize,
    cancel: &CancellationToken,
    jobs: Vec<(String, Job<T>)>,
) -> HashMap<String, Option<T>> {
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();

    for (id, job) in jobs {
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        set.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let outcome = match permit {
                Some(_permit) => Some(job.await),
                None => None,
            };
            (id, outcome)
        });
    }

    let mut results = HashMap::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((id, outcome)) => {
                results.insert(id, outcome);
            }
            Err(e) => error!("Placeholder task failed: {}", e),
        }
    }
    results
}

/// Phase 1 for one placeholder
async fn analyse(
    ctx: Arc<RunContext>,
    spec: PlaceholderSpec,
    schema: Arc<SchemaContext>,
    connector: Arc<dyn Connector>,
) -> Analysis {
    let input = RepairInput {
        placeholder: &spec,
        schema: &schema,
        window: &ctx.window,
        business_context: &ctx.config.business_context,
        connector: connector.as_ref(),
        execution: ExecutionContext::new(ctx.config.query_timeout(), ctx.config.analysis_row_limit),
    };
    let Some(outcome) = until_cancelled(&ctx.cancel, ctx.repair.run(&input)).await else {
        return Analysis::Done(Resolution::cancelled(&spec));
    };
    let attempts = outcome.generation_calls();

    if let (Some(sql), Some(best)) = (outcome.sql(), outcome.best.as_ref()) {
        return Analysis::Ready { sql: sql.to_string(), quality: best.quality_score, attempts };
    }

    let kind = outcome.failure.unwrap_or(FailureKind::GenerationFailure);
    let reason = outcome.error.clone().unwrap_or_else(|| kind.to_string());
    let best_sql = outcome.best.as_ref().map(|b| b.sql.clone());
    let quality = outcome.best.as_ref().map(|b| b.quality_score);

    let mut resolution = Resolution::failed(&spec, kind, reason.clone())
        .with_attempts(attempts, quality, best_sql.clone());
    if let Some(warning) = record_failure(&ctx, &spec, best_sql.as_deref().unwrap_or(""), kind, &reason, quality).await {
        resolution.warnings.push(warning);
    }
    Analysis::Done(resolution)
}

/// Await `fut` unless the run is cancelled first.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Write a failure version so the next scan reports `previous_error`.
async fn record_failure(
    ctx: &RunContext,
    spec: &PlaceholderSpec,
    sql: &str,
    kind: FailureKind,
    reason: &str,
    quality: Option<f64>,
) -> Option<String> {
    if ctx.cancel.is_cancelled() {
        return None;
    }
    let value = PlaceholderValue::new(
        spec.id.clone(),
        ctx.data_source_id.clone(),
        sql,
        Some(&ctx.window),
        CachedPayload::Empty,
        ctx.config.cache_ttl(),
    )
    .failed(kind, reason)
    .with_quality(quality.unwrap_or(0.0));

    match ctx.components.cache.put(value).await {
        Ok(_) => None,
        Err(e) => {
            warn!("Could not record failure for '{}': {}", spec.id, e);
            Some(format!("could not record failure for '{}': {}", spec.id, e))
        }
    }
}

/// Format a headline value for inline text
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "N/A".to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{:.0}", f),
            (None, Some(f)) => {
                let text = format!("{:.2}", f);
                text.trim_end_matches('0').trim_end_matches('.').to_string()
            }
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn value_from_payload(spec: &PlaceholderSpec, payload: &CachedPayload) -> Option<ResolvedValue> {
    match payload {
        CachedPayload::Value { formatted, narration, .. } => {
            Some(ResolvedValue::Statistic { value: formatted.clone(), narration: narration.clone() })
        }
        CachedPayload::Artifact { artifact, narration, .. } => Some(ResolvedValue::Artifact {
            kind: spec.artifact.as_ref().map(|a| a.kind).unwrap_or(ArtifactKind::Chart),
            handle: artifact.handle.clone(),
            narration: narration.clone(),
        }),
        CachedPayload::Empty => None,
    }
}

/// Phase 2 for one placeholder
async fn execute(
    ctx: Arc<RunContext>,
    spec: PlaceholderSpec,
    source: SqlSource,
    connector: Option<Arc<dyn Connector>>,
) -> Resolution {
    let (sql, quality, attempts) = match source {
        SqlSource::Cached(lookup) => {
            let key = fingerprint(&spec.id, &ctx.data_source_id, &lookup.value.sql, Some(&ctx.window));
            match ctx.components.cache.get_by_key(&key).await {
                Ok(Some(hit)) if hit.is_fresh() => {
                    if let Some(value) = value_from_payload(&spec, &hit.value.payload) {
                        if let Err(e) = ctx.components.cache.record_hit(&hit.value).await {
                            warn!("Could not count cache hit for '{}': {}", spec.id, e);
                        }
                        let mut outcome = PlaceholderOutcome::new(&spec, PlaceholderStatus::ResolvedFromCache);
                        outcome.quality_score = Some(hit.value.quality_score);
                        outcome.sql = Some(hit.value.sql.clone());
                        outcome.cache_version = Some(hit.value.version);
                        return Resolution::resolved(outcome, value);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Cache lookup by key for '{}' failed: {}", spec.id, e),
            }
            (lookup.value.sql, lookup.value.quality_score, 0)
        }
        SqlSource::Generated { sql, quality, attempts } => (sql, quality, attempts),
    };

    let Some(connector) = connector else {
        return Resolution::failed(&spec, FailureKind::ExecutionError, "data source unavailable")
            .with_attempts(attempts, Some(quality), Some(sql));
    };

    let bound = bind_time_window(&sql, &ctx.window);
    let exec_ctx = ExecutionContext::new(ctx.config.query_timeout(), ctx.config.row_limit);
    let Some(result) =
        until_cancelled(&ctx.cancel, ctx.components.executor.execute(&bound, connector.as_ref(), &exec_ctx)).await
    else {
        return Resolution::cancelled(&spec);
    };

    if !result.success {
        let kind = result.failure.unwrap_or(FailureKind::ExecutionError);
        let reason = result.error_text();
        let mut resolution =
            Resolution::failed(&spec, kind, reason.clone()).with_attempts(attempts, Some(quality), Some(sql.clone()));
        if let Some(warning) = record_failure(&ctx, &spec, &sql, kind, &reason, Some(quality)).await {
            resolution.warnings.push(warning);
        }
        return resolution;
    }

    let execution_time_ms = result.execution_time_ms;
    let rendering = async {
        match spec.kind {
            PlaceholderKind::Chart => render_artifact(&ctx, &spec, &result).await,
            _ => Ok(render_value(&ctx, &spec, result).await),
        }
    };
    let (payload, value) = match until_cancelled(&ctx.cancel, rendering).await {
        None => return Resolution::cancelled(&spec),
        Some(Ok(rendered)) => rendered,
        Some(Err(e)) => {
            warn!("Rendering '{}' failed: {}", spec.id, e);
            return Resolution::failed(&spec, e.failure_kind(), e.to_string())
                .with_attempts(attempts, Some(quality), Some(sql));
        }
    };

    if ctx.cancel.is_cancelled() {
        return Resolution::cancelled(&spec);
    }

    let entry = PlaceholderValue::new(
        spec.id.clone(),
        ctx.data_source_id.clone(),
        sql.clone(),
        Some(&ctx.window),
        payload,
        ctx.config.cache_ttl(),
    )
    .with_quality(quality)
    .with_execution_time(execution_time_ms);

    let mut outcome = PlaceholderOutcome::new(&spec, PlaceholderStatus::Resolved);
    outcome.attempts = attempts;
    outcome.quality_score = Some(quality);
    outcome.sql = Some(sql);

    match ctx.components.cache.put(entry).await {
        Ok(stored) => {
            outcome.cache_version = Some(stored.version);
            Resolution::resolved(outcome, value)
        }
        Err(e @ ResolveError::CacheConflict { .. }) => {
            warn!("{}", e);
            let mut failed = Resolution::failed(&spec, FailureKind::CacheConflict, e.to_string());
            failed.outcome.attempts = outcome.attempts;
            failed.outcome.quality_score = outcome.quality_score;
            failed.outcome.sql = outcome.sql;
            failed
        }
        Err(e) => {
            warn!("Could not cache '{}': {}", spec.id, e);
            let mut resolved = Resolution::resolved(outcome, value);
            resolved.warnings.push(format!("could not cache '{}': {}", spec.id, e));
            resolved
        }
    }
}

async fn render_value(ctx: &RunContext, spec: &PlaceholderSpec, result: QueryResult) -> (CachedPayload, ResolvedValue) {
    let formatted = result.scalar().map(format_value).unwrap_or_else(|| "N/A".to_string());
    let narration = clamp_narration(
        &ctx.components
            .narrator
            .narrate(&NarrationRequest { description: &spec.description, result: &result, chart_type: None })
            .await,
    );
    let value = ResolvedValue::Statistic { value: formatted.clone(), narration: narration.clone() };
    (CachedPayload::Value { result, formatted, narration }, value)
}

async fn render_artifact(
    ctx: &RunContext,
    spec: &PlaceholderSpec,
    result: &QueryResult,
) -> Result<(CachedPayload, ResolvedValue)> {
    let target = spec
        .artifact
        .clone()
        .unwrap_or_else(|| ArtifactTarget { kind: ArtifactKind::Chart, name: slug(&spec.id) });
    let chart_type = ChartType::infer(&spec.description, target.kind);
    let intent = ChartIntent::infer(chart_type, spec.description.clone(), result);
    let name = format!(
        "{}_{}_{}",
        slug(&ctx.data_source_id),
        slug(&target.name),
        ctx.window.end.format("%Y%m%d")
    );

    let artifact = ctx.components.renderer.render(&name, &intent, result).await?;
    let narration = clamp_narration(
        &ctx.components
            .narrator
            .narrate(&NarrationRequest { description: &spec.description, result, chart_type: Some(chart_type) })
            .await,
    );
    let value = ResolvedValue::Artifact { kind: target.kind, handle: artifact.handle.clone(), narration: narration.clone() };
    Ok((CachedPayload::Artifact { artifact, narration, row_count: result.row_count }, value))
}
