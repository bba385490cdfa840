//! Generate-Validate-Repair Loop
//!
//! Bounded retry loop with error recovery. Iterations are strictly
//! sequential: each one is prompted with the previous failure.

use crate::connector::Connector;
use crate::error::FailureKind;
use crate::execution::{ExecutionContext, QueryResult, SqlExecutor};
use crate::execution_loop::error_classifier::{ErrorClassifier, SqlErrorClass};
use crate::execution_loop::error_recovery::ErrorRecovery;
use crate::period::{bind_time_window, TimeWindow};
use crate::placeholder::PlaceholderSpec;
use crate::schema::SchemaContext;
use crate::sql::{
    GenerationRequest, RepairContext, SqlGenerationResult, SqlGenerator, SqlValidator, ValidationStatus,
    ValidationVerdict,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Inputs shared by every iteration for one placeholder
pub struct RepairInput<'a> {
    pub placeholder: &'a PlaceholderSpec,
    pub schema: &'a SchemaContext,
    pub window: &'a TimeWindow,
    pub business_context: &'a str,
    pub connector: &'a dyn Connector,
    /// Limits for the probe execution of a valid candidate
    pub execution: ExecutionContext,
}

/// Diagnostics for one iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u8,
    pub sql: String,
    pub quality_score: f64,
    pub status: ValidationStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairOutcome {
    /// `Valid` on success, otherwise the last failure status
    pub status: ValidationStatus,
    /// The successful generation, or the best-scoring attempt on failure
    pub best: Option<SqlGenerationResult>,
    pub attempts: Vec<AttemptRecord>,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    /// Probe result of the successful candidate
    pub probe: Option<QueryResult>,
}

impl RepairOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ValidationStatus::Valid
    }

    /// SQL of the successful attempt
    pub fn sql(&self) -> Option<&str> {
        if self.is_success() {
            self.best.as_ref().map(|b| b.sql.as_str())
        } else {
            None
        }
    }

    pub fn generation_calls(&self) -> usize {
        self.attempts.len()
    }
}

fn status_for(kind: FailureKind) -> ValidationStatus {
    match kind {
        FailureKind::SchemaError => ValidationStatus::SchemaError,
        FailureKind::PermissionError => ValidationStatus::PermissionError,
        FailureKind::Timeout => ValidationStatus::Timeout,
        FailureKind::ExecutionError => ValidationStatus::ExecutionError,
        FailureKind::SyntaxError
        | FailureKind::GenerationFailure
        | FailureKind::RenderFailure
        | FailureKind::CacheConflict => ValidationStatus::SyntaxError,
    }
}

struct Failure {
    class: SqlErrorClass,
    detail: String,
    verdict: Option<ValidationVerdict>,
}

/// Execution loop with bounded retries
pub struct RepairLoop {
    generator: Arc<dyn SqlGenerator>,
    executor: Arc<dyn SqlExecutor>,
    validator: SqlValidator,
    max_iterations: u8,
    abort_on_repeat_error: bool,
    error_classifier: ErrorClassifier,
    error_recovery: ErrorRecovery,
}

impl RepairLoop {
    pub fn new(
        generator: Arc<dyn SqlGenerator>,
        executor: Arc<dyn SqlExecutor>,
        max_iterations: u8,
        abort_on_repeat_error: bool,
    ) -> Self {
        Self {
            generator,
            executor,
            validator: SqlValidator::new(),
            max_iterations: max_iterations.max(1),
            abort_on_repeat_error,
            error_classifier: ErrorClassifier::new(),
            error_recovery: ErrorRecovery::new(),
        }
    }

    pub fn max_iterations(&self) -> u8 {
        self.max_iterations
    }

    /// Run to the first success or until the iteration budget is spent.
    pub async fn run(&self, input: &RepairInput<'_>) -> RepairOutcome {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut generations: Vec<SqlGenerationResult> = Vec::new();
        let mut previous: Option<Failure> = None;
        let mut repair: Option<RepairContext> = None;

        for attempt in 1..=self.max_iterations {
            info!(
                "Generation attempt {} of {} for '{}'",
                attempt, self.max_iterations, input.placeholder.id
            );

            let request = GenerationRequest {
                placeholder: input.placeholder,
                schema: input.schema,
                window: input.window,
                business_context: input.business_context,
                connector: input.connector,
                repair: repair.as_ref(),
            };
            let generation = self.generator.generate(&request).await;

            let failure = match self.check(&generation, input).await {
                Ok(probe) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        sql: generation.sql.clone(),
                        quality_score: generation.quality_score,
                        status: ValidationStatus::Valid,
                        detail: None,
                    });
                    info!("SQL for '{}' succeeded on attempt {}", input.placeholder.id, attempt);
                    return RepairOutcome {
                        status: ValidationStatus::Valid,
                        best: Some(generation),
                        attempts,
                        failure: None,
                        error: None,
                        probe: Some(probe),
                    };
                }
                Err(failure) => failure,
            };

            let kind = failure.class.failure_kind();
            warn!(
                "Attempt {} for '{}' failed: {} ({})",
                attempt, input.placeholder.id, failure.class, failure.detail
            );
            attempts.push(AttemptRecord {
                attempt,
                sql: generation.sql.clone(),
                quality_score: generation.quality_score,
                status: status_for(kind),
                detail: Some(failure.detail.clone()),
            });

            if self.should_abort(&failure.class, previous.as_ref().map(|p| &p.class)) {
                generations.push(generation);
                previous = Some(failure);
                break;
            }

            repair = Some(RepairContext {
                attempt: attempt + 1,
                previous_sql: generation.sql.clone(),
                failure: kind,
                prompt: self.error_recovery.build_recovery_prompt(
                    &failure.class,
                    &failure.detail,
                    &generation.sql,
                    failure.verdict.as_ref(),
                    input.schema,
                    attempt + 1,
                ),
            });
            generations.push(generation);
            previous = Some(failure);
        }

        let (kind, detail) = match previous {
            Some(failure) => (failure.class.failure_kind(), failure.detail),
            None => (FailureKind::GenerationFailure, "no attempts were made".to_string()),
        };
        let best = generations
            .into_iter()
            .filter(|g| !g.is_empty())
            .max_by(|a, b| a.quality_score.partial_cmp(&b.quality_score).unwrap_or(std::cmp::Ordering::Equal));

        warn!(
            "SQL for '{}' failed after {} attempts: {}",
            input.placeholder.id,
            attempts.len(),
            kind
        );
        RepairOutcome {
            status: status_for(kind),
            best,
            attempts,
            failure: Some(kind),
            error: Some(detail),
            probe: None,
        }
    }

    /// Validate, bind and probe one candidate.
    async fn check(
        &self,
        generation: &SqlGenerationResult,
        input: &RepairInput<'_>,
    ) -> std::result::Result<QueryResult, Failure> {
        if generation.is_empty() {
            let reported = generation.failure().unwrap_or(FailureKind::GenerationFailure);
            let class = match reported {
                FailureKind::Timeout => SqlErrorClass::Timeout,
                _ => SqlErrorClass::EmptyGeneration,
            };
            return Err(Failure { class, detail: generation.reasoning.clone(), verdict: None });
        }

        let verdict = self.validator.validate(&generation.sql, input.schema);
        if !verdict.valid {
            return Err(Failure {
                class: self.error_classifier.classify_verdict(&verdict),
                detail: verdict.summary(),
                verdict: Some(verdict),
            });
        }

        let bound = bind_time_window(&generation.sql, input.window);
        let result = self.executor.execute(&bound, input.connector, &input.execution).await;
        if result.success {
            return Ok(result);
        }

        let detail = result.error_text();
        let reported = result.failure.unwrap_or(FailureKind::ExecutionError);
        Err(Failure { class: self.error_classifier.classify(&detail, reported), detail, verdict: None })
    }

    /// Determine if we should abort based on error patterns
    fn should_abort(&self, current_error: &SqlErrorClass, previous_error: Option<&SqlErrorClass>) -> bool {
        if !self.abort_on_repeat_error {
            return false;
        }

        if let Some(prev) = previous_error {
            // Abort if same error repeats
            if prev.same_kind(current_error) {
                warn!("Same error repeated, aborting: {}", current_error);
                return true;
            }
        }

        false
    }
}
