//! SQL Executor - Runs bound SQL on a connector and normalizes the result

use crate::connector::Connector;
use crate::error::FailureKind;
use crate::execution::result::QueryResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-call execution limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Timeout in milliseconds
    pub timeout_ms: u64,

    /// Row limit passed to the connector
    pub row_limit: usize,
}

impl ExecutionContext {
    pub fn new(timeout: Duration, row_limit: usize) -> Self {
        Self { timeout_ms: timeout.as_millis() as u64, row_limit }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Executor contract. Failures are reported inside the [`QueryResult`],
/// never as an `Err`, so callers can feed them straight into repair.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str, connector: &dyn Connector, ctx: &ExecutionContext) -> QueryResult;
}

/// Executor delegating to the connector under a timeout
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectorExecutor;

impl ConnectorExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SqlExecutor for ConnectorExecutor {
    async fn execute(&self, sql: &str, connector: &dyn Connector, ctx: &ExecutionContext) -> QueryResult {
        let source_id = connector.source_id().to_string();
        let start = Instant::now();

        let outcome = tokio::time::timeout(ctx.timeout(), connector.run_query(sql, ctx.row_limit)).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(raw)) => {
                debug!("Query on {} returned {} rows in {} ms", source_id, raw.rows.len(), elapsed);
                QueryResult::success(raw, source_id, elapsed)
            }
            Ok(Err(e)) => {
                warn!("Query on {} failed: {}", source_id, e);
                QueryResult::error(source_id, e.failure_kind(), e.message, elapsed)
            }
            Err(_) => {
                warn!("Query on {} exceeded {} ms", source_id, ctx.timeout_ms);
                QueryResult::error(
                    source_id,
                    FailureKind::Timeout,
                    format!("query exceeded {} ms", ctx.timeout_ms),
                    elapsed,
                )
            }
        }
    }
}
