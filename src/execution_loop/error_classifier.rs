//! Error Classifier
//!
//! Classifies validator findings and raw data-source messages into a
//! taxonomy for recovery.

use crate::error::FailureKind;
use crate::sql::ValidationVerdict;
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL error classification taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlErrorClass {
    TableNotFound,
    ColumnNotFound,
    AmbiguousColumn,
    InvalidAggregation,
    NotReadOnly,
    SyntaxError(String),
    PermissionDenied,
    Timeout,
    EmptyGeneration,
    ExecutionError(String),
}

impl SqlErrorClass {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SqlErrorClass::TableNotFound | SqlErrorClass::ColumnNotFound | SqlErrorClass::AmbiguousColumn => {
                FailureKind::SchemaError
            }
            SqlErrorClass::InvalidAggregation | SqlErrorClass::NotReadOnly | SqlErrorClass::SyntaxError(_) => {
                FailureKind::SyntaxError
            }
            SqlErrorClass::PermissionDenied => FailureKind::PermissionError,
            SqlErrorClass::Timeout => FailureKind::Timeout,
            SqlErrorClass::EmptyGeneration => FailureKind::GenerationFailure,
            SqlErrorClass::ExecutionError(_) => FailureKind::ExecutionError,
        }
    }

    /// Same class, ignoring message payloads
    pub fn same_kind(&self, other: &SqlErrorClass) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for SqlErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlErrorClass::TableNotFound => write!(f, "TableNotFound"),
            SqlErrorClass::ColumnNotFound => write!(f, "ColumnNotFound"),
            SqlErrorClass::AmbiguousColumn => write!(f, "AmbiguousColumn"),
            SqlErrorClass::InvalidAggregation => write!(f, "InvalidAggregation"),
            SqlErrorClass::NotReadOnly => write!(f, "NotReadOnly"),
            SqlErrorClass::SyntaxError(msg) => write!(f, "SyntaxError({})", msg),
            SqlErrorClass::PermissionDenied => write!(f, "PermissionDenied"),
            SqlErrorClass::Timeout => write!(f, "Timeout"),
            SqlErrorClass::EmptyGeneration => write!(f, "EmptyGeneration"),
            SqlErrorClass::ExecutionError(msg) => write!(f, "ExecutionError({})", msg),
        }
    }
}

/// Error classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a rejected verdict
    pub fn classify_verdict(&self, verdict: &ValidationVerdict) -> SqlErrorClass {
        if !verdict.invalid_tables.is_empty() {
            return SqlErrorClass::TableNotFound;
        }
        if !verdict.invalid_columns.is_empty() {
            return SqlErrorClass::ColumnNotFound;
        }
        match self.classify(&verdict.summary(), FailureKind::SyntaxError) {
            SqlErrorClass::ExecutionError(msg) => SqlErrorClass::SyntaxError(msg),
            other => other,
        }
    }

    /// Classify a data-source error message. `reported` is the class the
    /// connector gave; permission and timeout classes are kept as reported.
    pub fn classify(&self, message: &str, reported: FailureKind) -> SqlErrorClass {
        match reported {
            FailureKind::PermissionError => return SqlErrorClass::PermissionDenied,
            FailureKind::Timeout => return SqlErrorClass::Timeout,
            FailureKind::GenerationFailure => return SqlErrorClass::EmptyGeneration,
            _ => {}
        }

        let error_msg = message.to_lowercase();

        if error_msg.contains("not read-only") || error_msg.contains("readonly") || error_msg.contains("read-only") {
            return SqlErrorClass::NotReadOnly;
        }

        if error_msg.contains("no such table")
            || (error_msg.contains("table") && (error_msg.contains("not found") || error_msg.contains("does not exist")))
        {
            return SqlErrorClass::TableNotFound;
        }

        if error_msg.contains("no such column")
            || (error_msg.contains("column") && (error_msg.contains("not found") || error_msg.contains("does not exist")))
        {
            return SqlErrorClass::ColumnNotFound;
        }

        if error_msg.contains("ambiguous") && error_msg.contains("column") {
            return SqlErrorClass::AmbiguousColumn;
        }

        if error_msg.contains("misuse of aggregate")
            || error_msg.contains("group by")
            || (error_msg.contains("aggregate") && error_msg.contains("not allowed"))
        {
            return SqlErrorClass::InvalidAggregation;
        }

        if error_msg.contains("syntax error") || error_msg.contains("parse error") || error_msg.contains("incomplete input") {
            return SqlErrorClass::SyntaxError(message.to_string());
        }

        if error_msg.contains("permission") || error_msg.contains("denied") || error_msg.contains("not authorized") {
            return SqlErrorClass::PermissionDenied;
        }

        if error_msg.contains("timed out") || error_msg.contains("timeout") || error_msg.contains("interrupted") {
            return SqlErrorClass::Timeout;
        }

        if reported == FailureKind::SyntaxError {
            return SqlErrorClass::SyntaxError(message.to_string());
        }

        // Default to execution error
        SqlErrorClass::ExecutionError(message.to_string())
    }
}
