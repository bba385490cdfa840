pub mod generator;
pub mod tools;
pub mod validator;

pub use generator::{
    extract_sql, heuristic_quality, GenerationRequest, LlmSqlGenerator, RepairContext, SqlGenerationResult,
    SqlGenerator,
};
pub use validator::{SqlValidator, ValidationStatus, ValidationVerdict};
