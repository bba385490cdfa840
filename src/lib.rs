//! Report placeholder resolution
//!
//! Scans report templates for `{{description}}` and
//! `[chart|table:name "description"]` tokens, turns each one into validated
//! SQL with an LLM-driven generate-validate-repair loop, executes it against
//! the report's data source, caches versioned results and substitutes values,
//! narrations and artifact references back into the text.

pub mod cache;
pub mod chart;
pub mod config;
pub mod connector;
pub mod error;
pub mod execution;
pub mod execution_loop;
pub mod llm;
pub mod narration;
pub mod orchestrator;
pub mod period;
pub mod placeholder;
pub mod schema;
pub mod sql;
pub mod template;

pub use config::ResolverConfig;
pub use error::{FailureKind, ResolveError, Result};
pub use orchestrator::{Components, Orchestrator, PlaceholderOutcome, PlaceholderStatus, RunOptions, RunReport};
