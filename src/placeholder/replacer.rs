//! Template Replacer
//!
//! Substitutes resolved values back into template text using the same token
//! grammar as the scanner. Tokens without a resolved value are copied
//! byte-for-byte, so failures stay visible in the output.

use crate::placeholder::grammar::{tokenize, ArtifactKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolvedValue {
    /// Formatted date or date range
    Period { text: String },
    /// `value（narration）`
    Statistic { value: String, narration: String },
    /// Reference to a stored artifact plus its caption
    Artifact { kind: ArtifactKind, handle: String, narration: String },
}

impl ResolvedValue {
    pub fn render(&self) -> String {
        match self {
            ResolvedValue::Period { text } => text.clone(),
            ResolvedValue::Statistic { value, narration } if narration.is_empty() => value.clone(),
            ResolvedValue::Statistic { value, narration } => format!("{}（{}）", value, narration),
            ResolvedValue::Artifact { kind: ArtifactKind::Chart, handle, narration } => {
                format!("![{}]({})", narration, handle)
            }
            ResolvedValue::Artifact { kind: ArtifactKind::Table, handle, narration } => {
                format!("[{}]({})", narration, handle)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Replacer;

impl Replacer {
    pub fn new() -> Self {
        Self
    }

    /// Assemble a new string; `text` itself is never modified.
    pub fn replace(&self, text: &str, resolved: &HashMap<String, ResolvedValue>) -> String {
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for token in tokenize(text) {
            out.push_str(&text[cursor..token.span.start]);
            match resolved.get(&token.id()) {
                Some(value) => out.push_str(&value.render()),
                None => out.push_str(&token.raw),
            }
            cursor = token.span.end;
        }
        out.push_str(&text[cursor..]);
        out
    }
}
