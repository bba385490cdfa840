//! Narration: short inline captions for resolved values and charts

use crate::chart::ChartType;
use crate::execution::QueryResult;
use async_trait::async_trait;
use serde_json::Value;

/// Narration is always shorter than this many characters
pub const NARRATION_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct NarrationRequest<'a> {
    pub description: &'a str,
    pub result: &'a QueryResult,
    /// Set for chart and table artifacts
    pub chart_type: Option<ChartType>,
}

#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, request: &NarrationRequest<'_>) -> String;
}

/// Fixed phrasing, Chinese when the description is Chinese
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateNarrator;

impl TemplateNarrator {
    pub fn new() -> Self {
        Self
    }
}

fn is_cjk(text: &str) -> bool {
    text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

/// Clamp `text` below [`NARRATION_LIMIT`] characters.
pub fn clamp_narration(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() < NARRATION_LIMIT {
        return text.to_string();
    }
    let mut out: String = text.chars().take(NARRATION_LIMIT - 2).collect();
    out.push('…');
    out
}

fn top_label(result: &QueryResult) -> Option<String> {
    if result.rows.len() < 2 {
        return None;
    }
    let numeric = result.numeric_columns();
    let value_idx = *numeric.first()?;
    let label_idx = (0..result.columns.len()).find(|i| !numeric.contains(i))?;
    let best = result.rows.iter().max_by(|a, b| {
        let av = a.get(value_idx).and_then(Value::as_f64).unwrap_or(f64::MIN);
        let bv = b.get(value_idx).and_then(Value::as_f64).unwrap_or(f64::MIN);
        av.partial_cmp(&bv).unwrap_or(std::cmp::Ordering::Equal)
    })?;
    match best.get(label_idx)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl Narrator for TemplateNarrator {
    async fn narrate(&self, request: &NarrationRequest<'_>) -> String {
        let zh = is_cjk(request.description);
        let rows = request.result.row_count;

        let text = match request.chart_type {
            Some(ChartType::Table) if zh => format!("共{}行", rows),
            Some(ChartType::Table) => format!("{} rows", rows),
            Some(chart) => match top_label(request.result) {
                Some(label) if zh => format!("{}最高", label),
                Some(label) => format!("peak: {}", label),
                None if zh => format!("{}项数据", rows),
                None => format!("{} chart, {} pts", chart.as_str(), rows),
            },
            None => match (request.result.scalar(), top_label(request.result)) {
                (None, _) | (Some(Value::Null), _) if zh => "暂无数据".to_string(),
                (None, _) | (Some(Value::Null), _) => "no data".to_string(),
                (_, Some(label)) if zh => format!("{}居首", label),
                (_, Some(label)) => format!("led by {}", label),
                (Some(v), None) if v.as_f64() == Some(0.0) && zh => "本期无记录".to_string(),
                (Some(v), None) if v.as_f64() == Some(0.0) => "none this period".to_string(),
                _ => request.description.to_string(),
            },
        };

        clamp_narration(&text)
    }
}
