//! Placeholder tokens: grammar, classification, scanning and replacement

pub mod classifier;
pub mod grammar;
pub mod replacer;
pub mod scanner;
pub mod spec;

pub use classifier::{declared_granularity, KeywordClassifier, PlaceholderClassifier};
pub use grammar::{tokenize, ArtifactKind, Token, TokenSyntax};
pub use replacer::{Replacer, ResolvedValue};
pub use scanner::{ReanalysisReason, ScanReport, ScanStatus, ScannedPlaceholder, Scanner};
pub use spec::{ArtifactTarget, PlaceholderKind, PlaceholderSpec};
