//! Read-only tools offered to the model during SQL generation

use crate::connector::{quote_identifier, Connector};
use crate::execution::normalize_value;
use crate::llm::{ToolCall, ToolDefinition};
use crate::schema::SchemaContext;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

pub const LIST_TABLES: &str = "list_tables";
pub const LIST_COLUMNS: &str = "list_columns";
pub const SAMPLE_ROWS: &str = "sample_rows";
pub const SUBMIT_SQL: &str = "submit_sql";

const MAX_SAMPLE_ROWS: usize = 5;

/// Final answer carried by a `submit_sql` call
#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedSql {
    pub sql: String,
    #[serde(default)]
    pub reasoning: String,
    pub confidence: Option<f64>,
}

pub fn catalogue() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: LIST_TABLES.to_string(),
            description: "List the tables available in the data source.".to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: LIST_COLUMNS.to_string(),
            description: "List the columns of one table.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "table": { "type": "string" } },
                "required": ["table"]
            }),
        },
        ToolDefinition {
            name: SAMPLE_ROWS.to_string(),
            description: format!("Return up to {} sample rows from a table.", MAX_SAMPLE_ROWS),
            parameters: json!({
                "type": "object",
                "properties": {
                    "table": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1, "maximum": MAX_SAMPLE_ROWS }
                },
                "required": ["table"]
            }),
        },
        ToolDefinition {
            name: SUBMIT_SQL.to_string(),
            description: "Submit the final read-only SQL statement. Use {{start_date}} and {{end_date}} for the reporting window.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "sql": { "type": "string" },
                    "reasoning": { "type": "string" },
                    "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
                },
                "required": ["sql"]
            }),
        },
    ]
}

#[derive(Debug, Deserialize)]
struct TableArgs {
    table: String,
    limit: Option<usize>,
}

/// Run a read-only tool and return its JSON reply. Failures are reported
/// to the model in the reply, not raised.
pub async fn run_tool(call: &ToolCall, schema: &SchemaContext, connector: &dyn Connector) -> String {
    debug!("Running tool {} with {}", call.name, call.arguments);
    let reply = match call.name.as_str() {
        LIST_TABLES => json!({ "tables": schema.tables() }),
        LIST_COLUMNS | SAMPLE_ROWS => match table_args(call, schema) {
            Ok((table, _)) if call.name == LIST_COLUMNS => {
                json!({ "table": table, "columns": schema.columns(&table).unwrap_or_default() })
            }
            Ok((table, limit)) => sample_rows(&table, limit, connector).await,
            Err(e) => json!({ "error": e }),
        },
        other => json!({ "error": format!("unknown tool {}", other) }),
    };
    reply.to_string()
}

fn table_args(call: &ToolCall, schema: &SchemaContext) -> std::result::Result<(String, usize), String> {
    let value = call.parse_arguments().map_err(|e| e.to_string())?;
    let args: TableArgs = serde_json::from_value(value).map_err(|e| format!("invalid arguments: {}", e))?;
    let table = schema
        .lookup_table(&args.table)
        .ok_or_else(|| format!("unknown table {}; call list_tables", args.table))?;
    let limit = args.limit.unwrap_or(MAX_SAMPLE_ROWS).clamp(1, MAX_SAMPLE_ROWS);
    Ok((table.to_string(), limit))
}

async fn sample_rows(table: &str, limit: usize, connector: &dyn Connector) -> serde_json::Value {
    let sql = format!("SELECT * FROM {} LIMIT {}", quote_identifier(table), limit);
    match connector.run_query(&sql, limit).await {
        Ok(raw) => {
            let rows: Vec<Vec<serde_json::Value>> = raw
                .rows
                .into_iter()
                .map(|row| row.into_iter().map(normalize_value).collect())
                .collect();
            json!({ "table": table, "columns": raw.columns, "rows": rows })
        }
        Err(e) => json!({ "error": e.message }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorError, RawResultSet, SqlValue};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingConnector {
        queries: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        fn source_id(&self) -> &str {
            "rec"
        }

        async fn list_tables(&self) -> Result<Vec<String>, ConnectorError> {
            Ok(vec!["orders".to_string()])
        }

        async fn list_columns(&self, _table: &str) -> Result<Vec<String>, ConnectorError> {
            Ok(vec!["id".to_string()])
        }

        async fn run_query(&self, sql: &str, limit: usize) -> Result<RawResultSet, ConnectorError> {
            self.queries.lock().unwrap().push((sql.to_string(), limit));
            Ok(RawResultSet {
                columns: vec!["id".to_string()],
                rows: vec![vec![SqlValue::Int(1)]],
                truncated: false,
            })
        }
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall { id: "c".to_string(), name: name.to_string(), arguments: arguments.to_string() }
    }

    #[test]
    fn test_catalogue_names() {
        let names: Vec<String> = catalogue().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec![LIST_TABLES, LIST_COLUMNS, SAMPLE_ROWS, SUBMIT_SQL]);
    }

    #[tokio::test]
    async fn test_sample_rows_is_bounded_and_schema_checked() {
        let schema = SchemaContext::new().with_table("orders", &["id"]);
        let connector = RecordingConnector::default();

        let reply = run_tool(&call(SAMPLE_ROWS, r#"{"table":"ORDERS","limit":50}"#), &schema, &connector).await;
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["rows"][0][0], 1);
        assert_eq!(
            connector.queries.lock().unwrap()[0],
            ("SELECT * FROM \"orders\" LIMIT 5".to_string(), 5)
        );

        let reply = run_tool(&call(SAMPLE_ROWS, r#"{"table":"users"}"#), &schema, &connector).await;
        assert!(reply.contains("unknown table users"));
        assert_eq!(connector.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_tools() {
        let schema = SchemaContext::new().with_table("orders", &["id", "amount"]);
        let connector = RecordingConnector::default();
        let tables = run_tool(&call(LIST_TABLES, ""), &schema, &connector).await;
        assert_eq!(tables, r#"{"tables":["orders"]}"#);
        let columns = run_tool(&call(LIST_COLUMNS, r#"{"table":"orders"}"#), &schema, &connector).await;
        assert!(columns.contains("amount"));
        let unknown = run_tool(&call("drop_table", "{}"), &schema, &connector).await;
        assert!(unknown.contains("unknown tool"));
    }
}
