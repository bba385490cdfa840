use crate::period::Granularity;
use crate::placeholder::grammar::{ArtifactKind, Token, TokenSyntax};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceholderKind {
    Period,
    Statistical,
    Chart,
    Unknown,
}

impl PlaceholderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceholderKind::Period => "period",
            PlaceholderKind::Statistical => "statistical",
            PlaceholderKind::Chart => "chart",
            PlaceholderKind::Unknown => "unknown",
        }
    }

    /// Whether resolution goes through SQL
    pub fn needs_sql(&self) -> bool {
        !matches!(self, PlaceholderKind::Period)
    }
}

impl fmt::Display for PlaceholderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Rendering target of a chart-kind placeholder
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactTarget {
    pub kind: ArtifactKind,
    pub name: String,
}

/// A classified placeholder; immutable once scanned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaceholderSpec {
    pub id: String,
    pub description: String,
    pub kind: PlaceholderKind,
    pub granularity: Option<Granularity>,
    pub artifact: Option<ArtifactTarget>,
}

impl PlaceholderSpec {
    pub fn from_token(token: &Token, kind: PlaceholderKind, granularity: Option<Granularity>) -> Self {
        let artifact = match (&token.syntax, kind) {
            (TokenSyntax::Artifact { kind, name }, _) => Some(ArtifactTarget { kind: *kind, name: name.clone() }),
            (TokenSyntax::Brace, PlaceholderKind::Chart) => Some(ArtifactTarget {
                kind: ArtifactKind::Chart,
                name: slug(&token.description),
            }),
            (TokenSyntax::Brace, _) => None,
        };
        Self {
            id: token.id(),
            description: token.description.clone(),
            kind,
            granularity,
            artifact,
        }
    }
}

/// File-name-safe rendition of a description
pub fn slug(text: &str) -> String {
    let mut out = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    let out = out.trim_end_matches('_').to_string();
    if out.is_empty() {
        "artifact".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholder::grammar::tokenize;

    #[test]
    fn test_brace_chart_gets_artifact_target() {
        let token = &tokenize("{{Complaint trend chart}}")[0];
        let spec = PlaceholderSpec::from_token(token, PlaceholderKind::Chart, None);
        assert_eq!(
            spec.artifact,
            Some(ArtifactTarget { kind: ArtifactKind::Chart, name: "complaint_trend_chart".to_string() })
        );
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("  Top-5 regions!! "), "top_5_regions");
        assert_eq!(slug("%%"), "artifact");
        assert_eq!(slug("投诉 趋势"), "投诉_趋势");
    }
}
