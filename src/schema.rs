//! Schema discovery
//!
//! Builds a [`SchemaContext`] for one data source per resolution run.

use crate::connector::Connector;
use crate::error::{ResolveError, Result};
use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Tables and their columns, in discovery order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaContext {
    tables: Vec<String>,
    columns: HashMap<String, Vec<String>>,
}

impl SchemaContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table; re-adding an existing table replaces its columns
    /// without changing its position.
    pub fn add_table(&mut self, table: impl Into<String>, columns: Vec<String>) {
        let table = table.into();
        if !self.columns.contains_key(&table) {
            self.tables.push(table.clone());
        }
        self.columns.insert(table, columns);
    }

    pub fn with_table(mut self, table: &str, columns: &[&str]) -> Self {
        self.add_table(table, columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn columns(&self, table: &str) -> Option<&[String]> {
        self.lookup_table(table).and_then(|t| self.columns.get(t)).map(|c| c.as_slice())
    }

    /// Case-insensitive table lookup returning the canonical name
    pub fn lookup_table(&self, table: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|t| t.eq_ignore_ascii_case(table))
            .map(|t| t.as_str())
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.lookup_table(table).is_some()
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.columns(table)
            .map(|cols| cols.iter().any(|c| c.eq_ignore_ascii_case(column)))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Render as `table(col, col)` lines for prompts.
    pub fn describe(&self) -> String {
        self.tables
            .iter()
            .map(|t| {
                let cols = self.columns.get(t).map(|c| c.join(", ")).unwrap_or_default();
                format!("- {}({})", t, cols)
            })
            .join("\n")
    }
}

#[async_trait]
pub trait SchemaDiscovery: Send + Sync {
    async fn discover(&self, connector: &dyn Connector) -> Result<SchemaContext>;
}

/// Discovery that walks the connector's table and column listings
#[derive(Debug, Clone, Default)]
pub struct ConnectorSchemaDiscovery {
    /// Restrict discovery to these tables when non-empty
    pub table_filter: Vec<String>,
}

impl ConnectorSchemaDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(tables: Vec<String>) -> Self {
        Self { table_filter: tables }
    }
}

#[async_trait]
impl SchemaDiscovery for ConnectorSchemaDiscovery {
    async fn discover(&self, connector: &dyn Connector) -> Result<SchemaContext> {
        let tables = connector
            .list_tables()
            .await
            .map_err(|e| ResolveError::Schema(format!("Failed to list tables: {}", e.message)))?;

        let mut schema = SchemaContext::new();
        for table in tables {
            if !self.table_filter.is_empty()
                && !self.table_filter.iter().any(|t| t.eq_ignore_ascii_case(&table))
            {
                continue;
            }
            match connector.list_columns(&table).await {
                Ok(columns) => schema.add_table(table, columns),
                Err(e) => {
                    // One unreadable table does not invalidate the rest.
                    warn!("Skipping table {}: {}", table, e.message);
                }
            }
        }

        info!(
            "Discovered {} tables on data source {}",
            schema.tables().len(),
            connector.source_id()
        );
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_and_lookup() {
        let schema = SchemaContext::new()
            .with_table("orders", &["id", "amount"])
            .with_table("complaints", &["id", "created_at"]);

        assert_eq!(schema.tables(), &["orders".to_string(), "complaints".to_string()]);
        assert!(schema.has_table("ORDERS"));
        assert!(schema.has_column("orders", "Amount"));
        assert!(!schema.has_column("orders", "created_at"));
        assert!(schema.describe().contains("- complaints(id, created_at)"));
    }

    #[test]
    fn test_readding_table_keeps_position() {
        let mut schema = SchemaContext::new().with_table("a", &["x"]).with_table("b", &["y"]);
        schema.add_table("a", vec!["z".to_string()]);
        assert_eq!(schema.tables(), &["a".to_string(), "b".to_string()]);
        assert_eq!(schema.columns("a").unwrap(), &["z".to_string()]);
    }
}
