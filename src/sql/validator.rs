//! SQL Validator
//!
//! Checks a candidate statement against the discovered schema. Every unknown
//! table and every column that can still be matched against a known table is
//! reported; nothing short-circuits, so repair prompts see the full picture.

use crate::period::{bind_time_window, TimeWindow};
use crate::schema::SchemaContext;
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, Query, SelectItem, SetExpr, Statement, TableFactor, Visit, Visitor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use strsim::jaro_winkler;
use tracing::debug;

lazy_static! {
    static ref FROM_JOIN_TABLE: Regex =
        Regex::new(r#"(?i)\b(?:from|join)\s+("[^"]+"|`[^`]+`|[A-Za-z_][A-Za-z0-9_.]*)"#).expect("valid table regex");
}

const AGGREGATES: &[&str] = &[
    "count", "sum", "avg", "min", "max", "total", "group_concat", "string_agg", "array_agg", "median",
];

const SUGGESTION_THRESHOLD: f64 = 0.8;

/// Outcome class of a validation or execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Valid,
    SyntaxError,
    ExecutionError,
    SchemaError,
    PermissionError,
    Timeout,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Valid => "valid",
            ValidationStatus::SyntaxError => "syntax_error",
            ValidationStatus::ExecutionError => "execution_error",
            ValidationStatus::SchemaError => "schema_error",
            ValidationStatus::PermissionError => "permission_error",
            ValidationStatus::Timeout => "timeout",
        }
    }

    pub fn failure_kind(&self) -> Option<crate::error::FailureKind> {
        use crate::error::FailureKind;
        match self {
            ValidationStatus::Pending | ValidationStatus::Valid => None,
            ValidationStatus::SyntaxError => Some(FailureKind::SyntaxError),
            ValidationStatus::ExecutionError => Some(FailureKind::ExecutionError),
            ValidationStatus::SchemaError => Some(FailureKind::SchemaError),
            ValidationStatus::PermissionError => Some(FailureKind::PermissionError),
            ValidationStatus::Timeout => Some(FailureKind::Timeout),
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    Table,
    Column,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedCorrection {
    pub kind: CorrectionKind,
    pub invalid: String,
    pub suggestion: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub status: ValidationStatus,
    pub valid: bool,
    pub invalid_tables: Vec<String>,
    pub invalid_columns: Vec<String>,
    pub errors: Vec<String>,
    pub suggestions: Vec<SuggestedCorrection>,
    /// Non-fatal findings, e.g. an unbounded row scan
    pub warnings: Vec<String>,
}

impl ValidationVerdict {
    fn from_findings(
        invalid_tables: Vec<String>,
        invalid_columns: Vec<String>,
        errors: Vec<String>,
        suggestions: Vec<SuggestedCorrection>,
        warnings: Vec<String>,
    ) -> Self {
        let status = if !invalid_tables.is_empty() || !invalid_columns.is_empty() {
            ValidationStatus::SchemaError
        } else if !errors.is_empty() {
            ValidationStatus::SyntaxError
        } else {
            ValidationStatus::Valid
        };
        Self {
            valid: status == ValidationStatus::Valid,
            status,
            invalid_tables,
            invalid_columns,
            errors,
            suggestions,
            warnings,
        }
    }

    /// Verdict for a statement that never reached the parser
    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::from_findings(Vec::new(), Vec::new(), vec![message.into()], Vec::new(), Vec::new())
    }

    /// One-paragraph summary for repair prompts and logs
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.invalid_tables.is_empty() {
            parts.push(format!("unknown tables: {}", self.invalid_tables.join(", ")));
        }
        if !self.invalid_columns.is_empty() {
            parts.push(format!("unknown columns: {}", self.invalid_columns.join(", ")));
        }
        parts.extend(self.errors.iter().cloned());
        if parts.is_empty() {
            self.status.to_string()
        } else {
            parts.join("; ")
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlValidator;

impl SqlValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, sql: &str, schema: &SchemaContext) -> ValidationVerdict {
        let sql = sql.trim();
        if sql.is_empty() {
            return ValidationVerdict::syntax_error("empty SQL statement");
        }

        // Time tokens are not SQL; bind them to a neutral window before parsing.
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
        let bound = bind_time_window(sql, &TimeWindow::new(epoch, epoch, None));

        match Parser::parse_sql(&GenericDialect {}, &bound) {
            Ok(statements) => self.validate_statements(&statements, schema),
            Err(e) => {
                debug!("SQL parse failed, falling back to name matching: {}", e);
                self.validate_by_name_matching(&bound, schema, e.to_string())
            }
        }
    }

    fn validate_statements(&self, statements: &[Statement], schema: &SchemaContext) -> ValidationVerdict {
        let mut errors = Vec::new();
        let query = match statements {
            [Statement::Query(query)] => query,
            [] => return ValidationVerdict::syntax_error("empty SQL statement"),
            [_] => return ValidationVerdict::syntax_error("statement is not read-only; only SELECT queries are allowed"),
            _ => return ValidationVerdict::syntax_error("multiple statements are not allowed"),
        };

        if !is_read_only(&query.body) {
            errors.push("statement is not read-only; only SELECT queries are allowed".to_string());
        }

        let mut refs = ReferenceCollector::default();
        let _ = statements[0].visit(&mut refs);

        let cte_names: HashSet<String> = refs.cte_names.iter().cloned().collect();
        let mut invalid_tables = Vec::new();
        let mut qualifiers: HashMap<String, Qualifier> = HashMap::new();
        let mut has_unresolved_source = refs.has_opaque_source || !cte_names.is_empty();
        let mut known_tables: Vec<String> = Vec::new();

        for (table, alias) in &refs.tables {
            let key = table.to_lowercase();
            if cte_names.contains(&key) {
                qualifiers.insert(key, Qualifier::Opaque);
                if let Some(alias) = alias {
                    qualifiers.insert(alias.to_lowercase(), Qualifier::Opaque);
                }
                continue;
            }
            match schema.lookup_table(table) {
                Some(canonical) => {
                    let canonical = canonical.to_string();
                    if !known_tables.contains(&canonical) {
                        known_tables.push(canonical.clone());
                    }
                    qualifiers.insert(key, Qualifier::Known(canonical.clone()));
                    if let Some(alias) = alias {
                        qualifiers.insert(alias.to_lowercase(), Qualifier::Known(canonical));
                    }
                }
                None => {
                    push_unique(&mut invalid_tables, table.clone());
                    has_unresolved_source = true;
                    qualifiers.insert(key, Qualifier::Opaque);
                    if let Some(alias) = alias {
                        qualifiers.insert(alias.to_lowercase(), Qualifier::Opaque);
                    }
                }
            }
        }
        for alias in &refs.opaque_aliases {
            qualifiers.insert(alias.to_lowercase(), Qualifier::Opaque);
        }

        let select_aliases: HashSet<String> = refs.select_aliases.iter().map(|a| a.to_lowercase()).collect();
        let mut invalid_columns = Vec::new();

        for (qualifier, column) in &refs.qualified_columns {
            match qualifiers.get(&qualifier.to_lowercase()) {
                Some(Qualifier::Known(table)) => {
                    if !schema.has_column(table, column) {
                        push_unique(&mut invalid_columns, format!("{}.{}", table, column));
                    }
                }
                Some(Qualifier::Opaque) => {}
                None => {
                    errors.push(format!("unknown table or alias '{}' in {}.{}", qualifier, qualifier, column));
                    push_unique(&mut invalid_columns, format!("{}.{}", qualifier, column));
                }
            }
        }

        for column in &refs.bare_columns {
            if select_aliases.contains(&column.to_lowercase()) {
                continue;
            }
            let found = known_tables.iter().any(|t| schema.has_column(t, column));
            if found || has_unresolved_source || known_tables.is_empty() {
                continue;
            }
            let reported = match known_tables.as_slice() {
                [only] => format!("{}.{}", only, column),
                _ => column.clone(),
            };
            push_unique(&mut invalid_columns, reported);
        }

        let mut warnings = Vec::new();
        if query.limit.is_none() && !refs.has_aggregate {
            warnings.push("query has no LIMIT and no aggregate; result size is unbounded".to_string());
        }

        let suggestions = suggest_corrections(&invalid_tables, &invalid_columns, &known_tables, schema);
        ValidationVerdict::from_findings(invalid_tables, invalid_columns, errors, suggestions, warnings)
    }

    /// Parse failed: still report unknown tables so the repair prompt is useful.
    fn validate_by_name_matching(&self, sql: &str, schema: &SchemaContext, parse_error: String) -> ValidationVerdict {
        let mut invalid_tables = Vec::new();
        for caps in FROM_JOIN_TABLE.captures_iter(sql) {
            let raw = caps[1].trim_matches(|c| c == '"' || c == '`');
            let table = raw.rsplit('.').next().unwrap_or(raw);
            if !schema.has_table(table) {
                push_unique(&mut invalid_tables, table.to_string());
            }
        }
        let suggestions = suggest_corrections(&invalid_tables, &[], &[], schema);
        ValidationVerdict::from_findings(
            invalid_tables,
            Vec::new(),
            vec![format!("SQL parse error: {}", parse_error)],
            suggestions,
            Vec::new(),
        )
    }
}

enum Qualifier {
    Known(String),
    Opaque,
}

#[derive(Default)]
struct ReferenceCollector {
    /// (table, alias) for every base-table reference
    tables: Vec<(String, Option<String>)>,
    cte_names: Vec<String>,
    opaque_aliases: Vec<String>,
    has_opaque_source: bool,
    qualified_columns: Vec<(String, String)>,
    bare_columns: Vec<String>,
    select_aliases: Vec<String>,
    has_aggregate: bool,
}

impl ReferenceCollector {
    /// Records the CTE names and projection aliases a query introduces.
    /// Nested queries in expressions and derived tables reach this through
    /// the visitor hooks below.
    fn collect_query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.push(cte.alias.name.value.to_lowercase());
                self.collect_query(&cte.query);
            }
        }
        self.collect_select_aliases(&query.body);
    }

    fn collect_select_aliases(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.select_aliases.push(alias.value.clone());
                    }
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_select_aliases(left);
                self.collect_select_aliases(right);
            }
            SetExpr::Query(query) => self.collect_query(query),
            _ => {}
        }
    }
}

impl Visitor for ReferenceCollector {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        if let Statement::Query(query) = statement {
            self.collect_query(query);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Table { name, alias, .. } => {
                if let Some(last) = name.0.last() {
                    self.tables.push((last.value.clone(), alias.as_ref().map(|a| a.name.value.clone())));
                }
            }
            TableFactor::NestedJoin { .. } => {}
            TableFactor::Derived { subquery, alias, .. } => {
                self.collect_query(subquery);
                self.has_opaque_source = true;
                if let Some(alias) = alias {
                    self.opaque_aliases.push(alias.name.value.clone());
                }
            }
            _ => self.has_opaque_source = true,
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.bare_columns.push(ident.value.clone()),
            Expr::Subquery(query) => self.collect_query(query),
            Expr::InSubquery { subquery, .. } | Expr::Exists { subquery, .. } => self.collect_query(subquery),
            Expr::CompoundIdentifier(idents) if idents.len() >= 2 => {
                let column = idents[idents.len() - 1].value.clone();
                let qualifier = idents[idents.len() - 2].value.clone();
                self.qualified_columns.push((qualifier, column));
            }
            Expr::Function(func) => {
                let name = func.name.to_string().to_lowercase();
                if AGGREGATES.contains(&name.as_str()) {
                    self.has_aggregate = true;
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn is_read_only(body: &SetExpr) -> bool {
    match body {
        SetExpr::Insert(_) => false,
        SetExpr::SetOperation { left, right, .. } => is_read_only(left) && is_read_only(right),
        SetExpr::Query(query) => is_read_only(&query.body),
        _ => true,
    }
}

fn push_unique(target: &mut Vec<String>, value: String) {
    if !target.iter().any(|v| v.eq_ignore_ascii_case(&value)) {
        target.push(value);
    }
}

fn suggest_corrections(
    invalid_tables: &[String],
    invalid_columns: &[String],
    known_tables: &[String],
    schema: &SchemaContext,
) -> Vec<SuggestedCorrection> {
    let mut suggestions = Vec::new();

    for table in invalid_tables {
        if let Some((best, score)) = best_match(table, schema.tables().iter()) {
            suggestions.push(SuggestedCorrection {
                kind: CorrectionKind::Table,
                invalid: table.clone(),
                suggestion: best,
                similarity: score,
            });
        }
    }

    for column in invalid_columns {
        let (table, bare) = match column.rsplit_once('.') {
            Some((t, c)) => (schema.lookup_table(t).map(|t| t.to_string()), c),
            None => (None, column.as_str()),
        };
        let candidates: Vec<String> = match table {
            Some(t) => schema.columns(&t).map(|c| c.to_vec()).unwrap_or_default(),
            None => known_tables
                .iter()
                .filter_map(|t| schema.columns(t))
                .flat_map(|c| c.iter().cloned())
                .collect(),
        };
        if let Some((best, score)) = best_match(bare, candidates.iter()) {
            suggestions.push(SuggestedCorrection {
                kind: CorrectionKind::Column,
                invalid: column.clone(),
                suggestion: best,
                similarity: score,
            });
        }
    }

    suggestions
}

fn best_match<'a, I>(needle: &str, candidates: I) -> Option<(String, f64)>
where
    I: Iterator<Item = &'a String>,
{
    let needle = needle.to_lowercase();
    candidates
        .map(|c| (c.clone(), jaro_winkler(&needle, &c.to_lowercase())))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_schema() -> SchemaContext {
        SchemaContext::new().with_table("orders", &["id", "amount"])
    }

    #[test]
    fn test_valid_query() {
        let verdict = SqlValidator::new().validate("SELECT orders.id, orders.amount FROM orders LIMIT 10", &orders_schema());
        assert!(verdict.valid, "{:?}", verdict);
        assert_eq!(verdict.status, ValidationStatus::Valid);
        assert!(verdict.invalid_tables.is_empty());
        assert!(verdict.invalid_columns.is_empty());
    }

    #[test]
    fn test_unknown_table_reported_alongside_column_issues() {
        let sql = "SELECT s.total, o.missing FROM sales s JOIN orders o ON o.id = s.order_id";
        let verdict = SqlValidator::new().validate(sql, &orders_schema());
        assert!(!verdict.valid);
        assert_eq!(verdict.status, ValidationStatus::SchemaError);
        assert_eq!(verdict.invalid_tables, vec!["sales".to_string()]);
        assert_eq!(verdict.invalid_columns, vec!["orders.missing".to_string()]);
    }

    #[test]
    fn test_only_unknown_table() {
        let verdict = SqlValidator::new().validate("SELECT SUM(amount) FROM sales", &orders_schema());
        assert!(!verdict.valid);
        assert_eq!(verdict.invalid_tables, vec!["sales".to_string()]);
        assert!(verdict.invalid_columns.is_empty());
    }

    #[test]
    fn test_bare_unknown_column() {
        let verdict = SqlValidator::new().validate("SELECT SUM(amout) AS total FROM orders ORDER BY total", &orders_schema());
        assert_eq!(verdict.invalid_columns, vec!["orders.amout".to_string()]);
        assert!(verdict
            .suggestions
            .iter()
            .any(|s| s.kind == CorrectionKind::Column && s.suggestion == "amount"));
    }

    #[test]
    fn test_time_tokens_and_aliases() {
        let schema = SchemaContext::new().with_table("complaints", &["id", "created_at", "region"]);
        let sql = "SELECT c.region, COUNT(*) AS n FROM complaints c \
                   WHERE c.created_at BETWEEN {{start_date}} AND '{{end_date}}' GROUP BY c.region ORDER BY n DESC";
        let verdict = SqlValidator::new().validate(sql, &schema);
        assert!(verdict.valid, "{:?}", verdict);
        assert!(verdict.warnings.is_empty());
    }

    #[test]
    fn test_cte_and_derived_tables_are_not_schema_errors() {
        let sql = "WITH recent AS (SELECT id, amount FROM orders) \
                   SELECT r.amount, t.x FROM recent r JOIN (SELECT 1 AS x) t ON 1 = 1 LIMIT 5";
        let verdict = SqlValidator::new().validate(sql, &orders_schema());
        assert!(verdict.valid, "{:?}", verdict);
    }

    #[test]
    fn test_nested_with_clauses_are_not_schema_errors() {
        let in_subquery = "SELECT o.amount FROM orders o WHERE o.id IN \
                           (WITH big AS (SELECT id FROM orders WHERE amount > 10) SELECT id FROM big) LIMIT 5";
        let verdict = SqlValidator::new().validate(in_subquery, &orders_schema());
        assert!(verdict.valid, "{:?}", verdict);
        assert!(verdict.invalid_tables.is_empty());

        let derived = "SELECT t.total FROM \
                       (WITH paid AS (SELECT amount FROM orders) SELECT SUM(amount) AS total FROM paid) t LIMIT 1";
        let verdict = SqlValidator::new().validate(derived, &orders_schema());
        assert!(verdict.valid, "{:?}", verdict);
        assert!(verdict.invalid_tables.is_empty());
    }

    #[test]
    fn test_cte_does_not_hide_unknown_tables() {
        let sql = "WITH recent AS (SELECT id FROM orderz) SELECT id FROM recent LIMIT 5";
        let verdict = SqlValidator::new().validate(sql, &orders_schema());
        assert!(!verdict.valid);
        assert_eq!(verdict.invalid_tables, vec!["orderz".to_string()]);
    }

    #[test]
    fn test_mutating_statement_rejected() {
        let verdict = SqlValidator::new().validate("DELETE FROM orders", &orders_schema());
        assert_eq!(verdict.status, ValidationStatus::SyntaxError);
        assert!(!verdict.valid);

        let verdict = SqlValidator::new().validate("SELECT 1; SELECT 2", &orders_schema());
        assert_eq!(verdict.status, ValidationStatus::SyntaxError);
    }

    #[test]
    fn test_parse_failure_still_reports_tables() {
        let verdict = SqlValidator::new().validate("SELECT amount FROM salez WHERE", &orders_schema());
        assert!(!verdict.valid);
        assert_eq!(verdict.invalid_tables, vec!["salez".to_string()]);
        assert!(verdict.errors.iter().any(|e| e.contains("parse error")));
        assert_eq!(verdict.status, ValidationStatus::SchemaError);
    }

    #[test]
    fn test_garbage_is_syntax_error() {
        let verdict = SqlValidator::new().validate("this is not sql", &orders_schema());
        assert_eq!(verdict.status, ValidationStatus::SyntaxError);
        assert!(SqlValidator::new().validate("   ", &orders_schema()).status == ValidationStatus::SyntaxError);
    }

    #[test]
    fn test_unbounded_scan_warning() {
        let verdict = SqlValidator::new().validate("SELECT id FROM orders", &orders_schema());
        assert!(verdict.valid);
        assert_eq!(verdict.warnings.len(), 1);
    }
}
