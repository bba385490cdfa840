//! Token grammar shared by the scanner and the replacer.
//!
//! Two forms are recognised:
//! - `{{description}}` for scalar, period and statistical tokens
//! - `[chart:name "description"]` / `[table:name "description"]` for artifacts

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

lazy_static! {
    static ref TOKEN: Regex = Regex::new(
        r#"\{\{(?P<desc>[^{}]*)\}\}|\[(?P<kind>chart|table):(?P<name>[^\s\]"]+)\s+"(?P<adesc>[^"]*)"\]"#
    )
    .expect("valid placeholder token regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Chart,
    Table,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Chart => "chart",
            ArtifactKind::Table => "table",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenSyntax {
    Brace,
    Artifact { kind: ArtifactKind, name: String },
}

/// One token occurrence in a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Byte range of the whole token in the source text
    pub span: Range<usize>,
    /// Exact source text of the token
    pub raw: String,
    /// Description with whitespace collapsed
    pub description: String,
    pub syntax: TokenSyntax,
}

impl Token {
    /// Identifier shared by every occurrence of the same token
    pub fn id(&self) -> String {
        match &self.syntax {
            TokenSyntax::Brace => self.description.clone(),
            TokenSyntax::Artifact { kind, name } => format!("{}:{}", kind, name),
        }
    }
}

pub fn normalize_description(desc: &str) -> String {
    desc.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Every token in `text`, in source order. Empty descriptions are not tokens.
pub fn tokenize(text: &str) -> Vec<Token> {
    TOKEN
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let (description, syntax) = if let Some(desc) = caps.name("desc") {
                (normalize_description(desc.as_str()), TokenSyntax::Brace)
            } else {
                let kind = match caps.name("kind")?.as_str() {
                    "chart" => ArtifactKind::Chart,
                    _ => ArtifactKind::Table,
                };
                let name = caps.name("name")?.as_str().to_string();
                let desc = caps.name("adesc").map(|d| d.as_str()).unwrap_or_default();
                (normalize_description(desc), TokenSyntax::Artifact { kind, name })
            };

            if description.is_empty() && syntax == TokenSyntax::Brace {
                return None;
            }

            Some(Token {
                span: whole.range(),
                raw: whole.as_str().to_string(),
                description,
                syntax,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_both_forms_in_order() {
        let text = r#"Period: {{ report  period }}. Total: {{total complaints last month}}. [chart:trend "daily complaint trend"]"#;
        let tokens = tokenize(text);

        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].description, "report period");
        assert_eq!(tokens[0].id(), "report period");
        assert_eq!(tokens[1].syntax, TokenSyntax::Brace);
        assert_eq!(tokens[2].id(), "chart:trend");
        assert_eq!(tokens[2].description, "daily complaint trend");
        assert_eq!(&text[tokens[2].span.clone()], tokens[2].raw);
    }

    #[test]
    fn test_empty_and_malformed_tokens_are_ignored() {
        let tokens = tokenize(r#"{{ }} {single} [chart: "x"] [image:a "b"]"#);
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_table_token() {
        let tokens = tokenize(r#"[table:top_regions "top 5 regions by revenue"]"#);
        assert_eq!(
            tokens[0].syntax,
            TokenSyntax::Artifact { kind: ArtifactKind::Table, name: "top_regions".to_string() }
        );
    }
}
