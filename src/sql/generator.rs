//! SQL Generator - LLM tool-calling exchange producing one candidate statement

use crate::connector::Connector;
use crate::error::{FailureKind, ResolveError, Result};
use crate::llm::{ChatMessage, NlProvider, NlRequest};
use crate::period::{TimeWindow, END_TOKEN, START_TOKEN};
use crate::placeholder::{PlaceholderKind, PlaceholderSpec};
use crate::schema::SchemaContext;
use crate::sql::tools::{self, SubmittedSql, SUBMIT_SQL};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

lazy_static! {
    static ref AGGREGATE_CALL: Regex =
        Regex::new(r"(?i)\b(count|sum|avg|min|max)\s*\(").expect("valid aggregate regex");
    static ref LIMIT_CLAUSE: Regex = Regex::new(r"(?i)\blimit\s+\d+").expect("valid limit regex");
    static ref SELECT_STAR: Regex = Regex::new(r"(?i)\bselect\s+\*").expect("valid select-star regex");
    static ref STATEMENT_START: Regex = Regex::new(r"(?is)\b(with|select)\b.*").expect("valid statement regex");
}

/// Failure detail fed back into the next generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairContext {
    /// Attempt number about to run, starting at 2
    pub attempt: u8,
    pub previous_sql: String,
    pub failure: FailureKind,
    /// Targeted correction instructions
    pub prompt: String,
}

pub struct GenerationRequest<'a> {
    pub placeholder: &'a PlaceholderSpec,
    pub schema: &'a SchemaContext,
    pub window: &'a TimeWindow,
    pub business_context: &'a str,
    pub connector: &'a dyn Connector,
    pub repair: Option<&'a RepairContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlGenerationResult {
    pub sql: String,
    /// Confidence in [0, 1]
    pub quality_score: f64,
    pub reasoning: String,
    pub metadata: BTreeMap<String, Value>,
}

impl SqlGenerationResult {
    pub fn new(sql: impl Into<String>, quality_score: f64, reasoning: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            quality_score: quality_score.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Empty result standing in for a failed exchange
    pub fn failed(error: &ResolveError) -> Self {
        let mut result = Self::new("", 0.0, error.to_string());
        result.metadata.insert("error".to_string(), Value::String(error.to_string()));
        result
            .metadata
            .insert("failure".to_string(), Value::String(error.failure_kind().as_str().to_string()));
        result
    }

    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty()
    }

    /// Failure class recorded by [`SqlGenerationResult::failed`]
    pub fn failure(&self) -> Option<FailureKind> {
        self.metadata
            .get("failure")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// One generation call. Never fails: exchange errors yield an empty
    /// statement with score 0.
    async fn generate(&self, request: &GenerationRequest<'_>) -> SqlGenerationResult;
}

/// Structural confidence heuristic in [0, 1]
pub fn heuristic_quality(sql: &str) -> f64 {
    if sql.trim().is_empty() {
        return 0.0;
    }
    let mut score: f64 = 0.5;
    if sql.contains(START_TOKEN) || sql.contains(END_TOKEN) {
        score += 0.2;
    }
    if LIMIT_CLAUSE.is_match(sql) || AGGREGATE_CALL.is_match(sql) {
        score += 0.15;
    }
    if !SELECT_STAR.is_match(sql) {
        score += 0.15;
    }
    score.clamp(0.0, 1.0)
}

/// Pull a statement out of free text, stripping markdown fences.
pub fn extract_sql(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let inner = if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after
            .strip_prefix("sql")
            .or_else(|| after.strip_prefix("SQL"))
            .unwrap_or(after);
        match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        }
    } else {
        trimmed
    };

    let statement = STATEMENT_START.find(inner)?.as_str();
    let sql = statement.trim().trim_end_matches(';').trim();
    if sql.is_empty() {
        None
    } else {
        Some(sql.to_string())
    }
}

pub struct LlmSqlGenerator {
    provider: Arc<dyn NlProvider>,
    timeout: Duration,
    max_tool_rounds: usize,
}

impl LlmSqlGenerator {
    pub fn new(provider: Arc<dyn NlProvider>, timeout: Duration, max_tool_rounds: usize) -> Self {
        Self { provider, timeout, max_tool_rounds }
    }

    fn system_prompt(&self) -> String {
        [
            "You write one read-only SQL query that answers a report placeholder.",
            "Rules:",
            "- Only SELECT (or WITH ... SELECT); never modify data.",
            "- Use only tables and columns listed in the schema; call the tools to check.",
            "- Bound the result: aggregate, or add a LIMIT unless the result is naturally small.",
            "- Never write literal dates for the reporting window. Use '{{start_date}}' and '{{end_date}}'.",
            "- Put the headline value in the first numeric column.",
            "When done, call submit_sql with the SQL, your reasoning and a confidence between 0 and 1.",
        ]
        .join("\n")
    }

    fn user_prompt(&self, request: &GenerationRequest<'_>) -> String {
        let mut parts = Vec::new();
        parts.push(format!("PLACEHOLDER: {}", request.placeholder.description));
        parts.push(format!("KIND: {}", request.placeholder.kind));
        match request.placeholder.kind {
            PlaceholderKind::Chart => parts.push(
                "Return one category column followed by one or more numeric series columns.".to_string(),
            ),
            PlaceholderKind::Statistical | PlaceholderKind::Unknown => {
                parts.push("Return a single row whose first numeric column is the answer.".to_string())
            }
            PlaceholderKind::Period => {}
        }
        if let Some(granularity) = request.placeholder.granularity {
            parts.push(format!("GRANULARITY: {}", granularity));
        }
        parts.push(format!(
            "REPORTING WINDOW: {} to {} (inclusive), referenced as {} and {}",
            request.window.start_str(),
            request.window.end_str(),
            START_TOKEN,
            END_TOKEN
        ));
        parts.push(format!("\nSCHEMA:\n{}", request.schema.describe()));
        if !request.business_context.trim().is_empty() {
            parts.push(format!("\nBUSINESS CONTEXT:\n{}", request.business_context.trim()));
        }
        if let Some(repair) = request.repair {
            parts.push(format!("\n{}", repair.prompt));
        }
        parts.join("\n")
    }

    fn finish(&self, sql: String, reasoning: String, confidence: Option<f64>, rounds: usize) -> SqlGenerationResult {
        let heuristic = heuristic_quality(&sql);
        let score = match confidence {
            Some(c) => (c.clamp(0.0, 1.0) + heuristic) / 2.0,
            None => heuristic,
        };
        let mut result = SqlGenerationResult::new(sql, score, reasoning);
        result.metadata.insert("tool_rounds".to_string(), Value::from(rounds as u64));
        result.metadata.insert("heuristic_score".to_string(), Value::from(heuristic));
        if let Some(c) = confidence {
            result.metadata.insert("model_confidence".to_string(), Value::from(c));
        }
        result
    }

    async fn exchange(&self, request: &GenerationRequest<'_>) -> Result<SqlGenerationResult> {
        let mut messages = vec![ChatMessage::system(self.system_prompt()), ChatMessage::user(self.user_prompt(request))];
        let catalogue = tools::catalogue();

        for round in 0..=self.max_tool_rounds {
            let response = self
                .provider
                .complete(&NlRequest { messages: messages.clone(), tools: catalogue.clone() })
                .await?;

            if response.tool_calls.is_empty() {
                let text = response.text.unwrap_or_default();
                let sql = extract_sql(&text)
                    .ok_or_else(|| ResolveError::Llm("model replied without SQL".to_string()))?;
                return Ok(self.finish(sql, text, None, round));
            }

            if let Some(submit) = response.tool_calls.iter().find(|c| c.name == SUBMIT_SQL) {
                let submitted: SubmittedSql = serde_json::from_value(submit.parse_arguments()?)
                    .map_err(|e| ResolveError::Llm(format!("Invalid submit_sql arguments: {}", e)))?;
                let sql = extract_sql(&submitted.sql).unwrap_or(submitted.sql);
                return Ok(self.finish(sql, submitted.reasoning, submitted.confidence, round));
            }

            messages.push(ChatMessage::assistant(response.text.clone(), response.tool_calls.clone()));
            for call in &response.tool_calls {
                let reply = tools::run_tool(call, request.schema, request.connector).await;
                messages.push(ChatMessage::tool_result(&call.id, reply));
            }
            debug!("Tool round {} for '{}'", round + 1, request.placeholder.id);
        }

        Err(ResolveError::Llm(format!(
            "no SQL submitted within {} tool rounds",
            self.max_tool_rounds
        )))
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate(&self, request: &GenerationRequest<'_>) -> SqlGenerationResult {
        let outcome = match tokio::time::timeout(self.timeout, self.exchange(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ResolveError::LlmTimeout(self.timeout.as_millis() as u64)),
        };

        match outcome {
            Ok(result) => {
                info!(
                    "Generated SQL for '{}' (quality {:.2})",
                    request.placeholder.id, result.quality_score
                );
                result
            }
            Err(e) => {
                warn!("SQL generation for '{}' failed: {}", request.placeholder.id, e);
                SqlGenerationResult::failed(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorError, RawResultSet};
    use crate::llm::{NlResponse, ToolCall};
    use crate::placeholder::grammar::tokenize;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    struct NoData;

    #[async_trait]
    impl Connector for NoData {
        fn source_id(&self) -> &str {
            "shop"
        }
        async fn list_tables(&self) -> std::result::Result<Vec<String>, ConnectorError> {
            Ok(Vec::new())
        }
        async fn list_columns(&self, _t: &str) -> std::result::Result<Vec<String>, ConnectorError> {
            Ok(Vec::new())
        }
        async fn run_query(&self, _sql: &str, _l: usize) -> std::result::Result<RawResultSet, ConnectorError> {
            Ok(RawResultSet::default())
        }
    }

    /// Replays canned responses and records every request
    struct ScriptedProvider {
        replies: Mutex<Vec<NlResponse>>,
        requests: Mutex<Vec<NlRequest>>,
    }

    impl ScriptedProvider {
        fn new(mut replies: Vec<NlResponse>) -> Self {
            replies.reverse();
            Self { replies: Mutex::new(replies), requests: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl NlProvider for ScriptedProvider {
        async fn complete(&self, request: &NlRequest) -> Result<NlResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ResolveError::Llm("script exhausted".to_string()))
        }
    }

    struct Hanging;

    #[async_trait]
    impl NlProvider for Hanging {
        async fn complete(&self, _request: &NlRequest) -> Result<NlResponse> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(NlResponse::text("SELECT 1"))
        }
    }

    fn spec() -> PlaceholderSpec {
        let token = &tokenize("{{total orders last month}}")[0];
        PlaceholderSpec::from_token(token, PlaceholderKind::Statistical, None)
    }

    async fn run(generator: &LlmSqlGenerator, repair: Option<&RepairContext>) -> SqlGenerationResult {
        let spec = spec();
        let schema = SchemaContext::new().with_table("orders", &["id", "amount", "created_at"]);
        let day = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        let window = TimeWindow::new(day, day, None);
        let request = GenerationRequest {
            placeholder: &spec,
            schema: &schema,
            window: &window,
            business_context: "orders are sales",
            connector: &NoData,
            repair,
        };
        generator.generate(&request).await
    }

    #[test]
    fn test_extract_sql_strips_fences() {
        assert_eq!(
            extract_sql("Here you go:\n```sql\nSELECT COUNT(*) FROM orders;\n```").as_deref(),
            Some("SELECT COUNT(*) FROM orders")
        );
        assert_eq!(extract_sql("select 1").as_deref(), Some("select 1"));
        assert_eq!(extract_sql("I cannot answer that."), None);
    }

    #[test]
    fn test_heuristic_quality() {
        assert_eq!(heuristic_quality(""), 0.0);
        let good = heuristic_quality("SELECT COUNT(id) FROM orders WHERE created_at >= '{{start_date}}'");
        let poor = heuristic_quality("SELECT * FROM orders");
        assert!(good > poor);
        assert!((good - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_tool_round_then_submit() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            NlResponse::tool(ToolCall { id: "1".into(), name: "list_tables".into(), arguments: "{}".into() }),
            NlResponse::tool(ToolCall {
                id: "2".into(),
                name: SUBMIT_SQL.into(),
                arguments: r#"{"sql":"SELECT SUM(amount) FROM orders","reasoning":"sum","confidence":0.9}"#.into(),
            }),
        ]));
        let generator = LlmSqlGenerator::new(provider.clone(), Duration::from_secs(5), 4);
        let result = run(&generator, None).await;

        assert_eq!(result.sql, "SELECT SUM(amount) FROM orders");
        assert_eq!(result.reasoning, "sum");
        assert!(result.quality_score > 0.5 && result.quality_score <= 1.0);

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let last = requests[1].messages.last().unwrap();
        assert_eq!(last.role, "tool");
        assert!(last.content.as_deref().unwrap().contains("orders"));
    }

    #[tokio::test]
    async fn test_repair_prompt_is_included() {
        let provider = Arc::new(ScriptedProvider::new(vec![NlResponse::text("```sql\nSELECT 1\n```")]));
        let generator = LlmSqlGenerator::new(provider.clone(), Duration::from_secs(5), 2);
        let repair = RepairContext {
            attempt: 2,
            previous_sql: "SELECT x FROM sales".to_string(),
            failure: FailureKind::SchemaError,
            prompt: "RETRY ATTEMPT 2: unknown tables: sales".to_string(),
        };
        let result = run(&generator, Some(&repair)).await;
        assert_eq!(result.sql, "SELECT 1");

        let requests = provider.requests.lock().unwrap();
        let user = requests[0].messages[1].content.clone().unwrap();
        assert!(user.contains("unknown tables: sales"));
        assert!(user.contains("BUSINESS CONTEXT"));
    }

    #[tokio::test]
    async fn test_failures_yield_empty_sql() {
        let generator = LlmSqlGenerator::new(Arc::new(ScriptedProvider::new(Vec::new())), Duration::from_secs(5), 2);
        let result = run(&generator, None).await;
        assert!(result.is_empty());
        assert_eq!(result.quality_score, 0.0);
        assert_eq!(result.failure(), Some(FailureKind::GenerationFailure));

        let generator = LlmSqlGenerator::new(Arc::new(Hanging), Duration::from_millis(20), 2);
        let result = run(&generator, None).await;
        assert!(result.is_empty());
        assert_eq!(result.failure(), Some(FailureKind::Timeout));
    }
}
