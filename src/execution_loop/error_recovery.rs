//! Error Recovery
//!
//! Builds recovery prompts from error classifications.

use crate::execution_loop::error_classifier::SqlErrorClass;
use crate::schema::SchemaContext;
use crate::sql::validator::CorrectionKind;
use crate::sql::ValidationVerdict;

/// Error recovery prompt builder
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorRecovery;

impl ErrorRecovery {
    pub fn new() -> Self {
        Self
    }

    /// Build a recovery prompt from an error classification
    pub fn build_recovery_prompt(
        &self,
        error_class: &SqlErrorClass,
        detail: &str,
        previous_sql: &str,
        verdict: Option<&ValidationVerdict>,
        schema: &SchemaContext,
        attempt: u8,
    ) -> String {
        let mut prompt_parts = Vec::new();

        prompt_parts.push(format!(
            "RETRY ATTEMPT {}: your previous SQL failed ({}).",
            attempt,
            error_class.failure_kind()
        ));

        match error_class {
            SqlErrorClass::TableNotFound => {
                prompt_parts.push("A table you referenced does not exist.".to_string());
                prompt_parts.push(format!("Available tables: {}", schema.tables().join(", ")));
            }
            SqlErrorClass::ColumnNotFound => {
                prompt_parts.push("A column you referenced does not exist in its table.".to_string());
                prompt_parts.push("Use only these tables and columns:".to_string());
                prompt_parts.push(schema.describe());
            }
            SqlErrorClass::AmbiguousColumn => {
                prompt_parts.push("A column reference is ambiguous (exists in multiple tables).".to_string());
                prompt_parts.push("Qualify every column with its table name or alias.".to_string());
            }
            SqlErrorClass::InvalidAggregation => {
                prompt_parts.push("The aggregation is invalid.".to_string());
                prompt_parts.push("Every non-aggregated selected column must appear in GROUP BY.".to_string());
            }
            SqlErrorClass::NotReadOnly => {
                prompt_parts.push("Only a single read-only SELECT statement is allowed.".to_string());
            }
            SqlErrorClass::SyntaxError(_) => {
                prompt_parts.push("The statement is not valid SQL. Return one complete SELECT statement.".to_string());
            }
            SqlErrorClass::PermissionDenied => {
                prompt_parts.push("The data source denied access. Avoid restricted tables and system catalogs.".to_string());
            }
            SqlErrorClass::Timeout => {
                prompt_parts.push("The query ran too long. Aggregate earlier, filter on the reporting window, and add a LIMIT.".to_string());
            }
            SqlErrorClass::EmptyGeneration => {
                prompt_parts.push("No SQL was produced. Call submit_sql with a complete statement.".to_string());
            }
            SqlErrorClass::ExecutionError(_) => {
                prompt_parts.push("The data source rejected the query at runtime.".to_string());
            }
        }

        if !detail.trim().is_empty() {
            prompt_parts.push(format!("Error details: {}", detail.trim()));
        }

        if let Some(verdict) = verdict {
            if !verdict.invalid_tables.is_empty() {
                prompt_parts.push(format!("Invalid tables: {}", verdict.invalid_tables.join(", ")));
            }
            if !verdict.invalid_columns.is_empty() {
                prompt_parts.push(format!("Invalid columns: {}", verdict.invalid_columns.join(", ")));
            }
            for suggestion in &verdict.suggestions {
                let kind = match suggestion.kind {
                    CorrectionKind::Table => "table",
                    CorrectionKind::Column => "column",
                };
                prompt_parts.push(format!(
                    "Did you mean {} '{}' instead of '{}'?",
                    kind, suggestion.suggestion, suggestion.invalid
                ));
            }
        }

        if !previous_sql.trim().is_empty() {
            prompt_parts.push("\nPrevious SQL:".to_string());
            prompt_parts.push(previous_sql.trim().to_string());
        }

        prompt_parts.push("\nPlease regenerate the SQL with the corrections above.".to_string());

        prompt_parts.join("\n")
    }
}
