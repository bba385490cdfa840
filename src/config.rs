//! Resolver configuration
//!
//! Defaults cover a single-node deployment; every field can be overridden
//! through `RESOLVER_*` environment variables.

use crate::error::{ResolveError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Generation calls allowed per placeholder in the repair loop
    pub max_iterations: u8,

    /// Placeholders resolved concurrently in each phase
    pub max_concurrency: usize,

    /// Ceiling for a single LLM exchange, in milliseconds
    pub llm_timeout_ms: u64,

    /// Ceiling for a single SQL execution, in milliseconds
    pub query_timeout_ms: u64,

    /// Row limit used when the repair loop test-executes a candidate
    pub analysis_row_limit: usize,

    /// Row limit used in the execution phase
    pub row_limit: usize,

    /// Time-to-live of cache entries, in seconds
    pub cache_ttl_secs: i64,

    /// Versions retained per placeholder by the pruning pass
    pub keep_versions: usize,

    /// Tool round-trips allowed inside one generation call
    pub max_tool_rounds: usize,

    /// Stop the repair loop early when the same failure class repeats
    pub abort_on_repeat_error: bool,

    /// Retries on rate-limited or unavailable LLM responses
    pub llm_max_retries: u32,

    /// Base delay for exponential backoff, in milliseconds
    pub llm_backoff_base_ms: u64,

    pub chart_width: u32,
    pub chart_height: u32,

    /// Free-form business context appended to every generation prompt
    pub business_context: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_concurrency: 4,
            llm_timeout_ms: 60_000,
            query_timeout_ms: 30_000,
            analysis_row_limit: 10,
            row_limit: 1_000,
            cache_ttl_secs: 24 * 60 * 60,
            keep_versions: 5,
            max_tool_rounds: 6,
            abort_on_repeat_error: false,
            llm_max_retries: 3,
            llm_backoff_base_ms: 500,
            chart_width: 800,
            chart_height: 480,
            business_context: String::new(),
        }
    }
}

impl ResolverConfig {
    /// Build a config from defaults overlaid with `RESOLVER_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        overlay(&lookup, "RESOLVER_MAX_ITERATIONS", &mut config.max_iterations)?;
        overlay(&lookup, "RESOLVER_MAX_CONCURRENCY", &mut config.max_concurrency)?;
        overlay(&lookup, "RESOLVER_LLM_TIMEOUT_MS", &mut config.llm_timeout_ms)?;
        overlay(&lookup, "RESOLVER_QUERY_TIMEOUT_MS", &mut config.query_timeout_ms)?;
        overlay(&lookup, "RESOLVER_ANALYSIS_ROW_LIMIT", &mut config.analysis_row_limit)?;
        overlay(&lookup, "RESOLVER_ROW_LIMIT", &mut config.row_limit)?;
        overlay(&lookup, "RESOLVER_CACHE_TTL_SECS", &mut config.cache_ttl_secs)?;
        overlay(&lookup, "RESOLVER_KEEP_VERSIONS", &mut config.keep_versions)?;
        overlay(&lookup, "RESOLVER_MAX_TOOL_ROUNDS", &mut config.max_tool_rounds)?;
        overlay(&lookup, "RESOLVER_ABORT_ON_REPEAT_ERROR", &mut config.abort_on_repeat_error)?;
        overlay(&lookup, "RESOLVER_LLM_MAX_RETRIES", &mut config.llm_max_retries)?;
        overlay(&lookup, "RESOLVER_LLM_BACKOFF_BASE_MS", &mut config.llm_backoff_base_ms)?;
        overlay(&lookup, "RESOLVER_CHART_WIDTH", &mut config.chart_width)?;
        overlay(&lookup, "RESOLVER_CHART_HEIGHT", &mut config.chart_height)?;
        if let Some(context) = lookup("RESOLVER_BUSINESS_CONTEXT") {
            config.business_context = context;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(ResolveError::Config("max_iterations must be at least 1".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(ResolveError::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.row_limit == 0 || self.analysis_row_limit == 0 {
            return Err(ResolveError::Config("row limits must be positive".to_string()));
        }
        if self.keep_versions == 0 {
            return Err(ResolveError::Config("keep_versions must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs)
    }
}

fn overlay<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse::<T>()
            .map_err(|e| ResolveError::Config(format!("{}={:?}: {}", key, raw, e)))?;
    }
    Ok(())
}
