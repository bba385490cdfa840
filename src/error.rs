use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM call timed out after {0} ms")]
    LlmTimeout(u64),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Cache conflict on {placeholder_id}@{data_source_id}: {detail}")]
    CacheConflict {
        placeholder_id: String,
        data_source_id: String,
        detail: String,
    },

    #[error("Render error: {0}")]
    Render(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ResolveError {
    /// Maps an error onto the failure taxonomy reported per placeholder.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ResolveError::Schema(_) => FailureKind::SchemaError,
            ResolveError::Llm(_) => FailureKind::GenerationFailure,
            ResolveError::LlmTimeout(_) => FailureKind::Timeout,
            ResolveError::Render(_) => FailureKind::RenderFailure,
            ResolveError::CacheConflict { .. } => FailureKind::CacheConflict,
            ResolveError::Execution(_)
            | ResolveError::Cache(_)
            | ResolveError::Template(_)
            | ResolveError::Config(_)
            | ResolveError::Storage(_)
            | ResolveError::Cancelled
            | ResolveError::Io(_)
            | ResolveError::Json(_) => FailureKind::ExecutionError,
        }
    }
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Failure taxonomy surfaced in run reports and fed back into repair prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SchemaError,
    SyntaxError,
    ExecutionError,
    PermissionError,
    Timeout,
    GenerationFailure,
    RenderFailure,
    CacheConflict,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SchemaError => "schema_error",
            FailureKind::SyntaxError => "syntax_error",
            FailureKind::ExecutionError => "execution_error",
            FailureKind::PermissionError => "permission_error",
            FailureKind::Timeout => "timeout",
            FailureKind::GenerationFailure => "generation_failure",
            FailureKind::RenderFailure => "render_failure",
            FailureKind::CacheConflict => "cache_conflict",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
