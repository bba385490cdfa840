//! Chart rendering
//!
//! Turns a tabular [`QueryResult`] into an artifact held by an
//! [`ArtifactStore`]. Bar, line and pie charts are drawn as SVG; table
//! artifacts are written as CSV. Rendering never retries.

use crate::error::{ResolveError, Result};
use crate::execution::QueryResult;
use crate::placeholder::grammar::ArtifactKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};

const PALETTE: &[&str] = &["#4e79a7", "#f28e2b", "#e15759", "#76b7b2", "#59a14f", "#edc948", "#b07aa1", "#ff9da7"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
    Pie,
    Table,
}

impl ChartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Bar => "bar",
            ChartType::Line => "line",
            ChartType::Pie => "pie",
            ChartType::Table => "table",
        }
    }

    /// Pick a chart type from the description keywords
    pub fn infer(description: &str, artifact: ArtifactKind) -> Self {
        if artifact == ArtifactKind::Table {
            return ChartType::Table;
        }
        let desc = description.to_lowercase();
        let has = |keywords: &[&str]| keywords.iter().any(|k| desc.contains(k));
        if has(&["pie", "share", "proportion", "breakdown", "饼", "占比", "构成"]) {
            ChartType::Pie
        } else if has(&["trend", "line", "over time", "daily", "趋势", "折线", "走势"]) {
            ChartType::Line
        } else {
            ChartType::Bar
        }
    }
}

/// Chart type plus its axis/series column bindings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartIntent {
    pub chart_type: ChartType,
    pub title: String,
    /// Category column; row index when absent
    pub x_column: Option<String>,
    pub y_columns: Vec<String>,
}

impl ChartIntent {
    /// Bind the first non-numeric column to x and numeric columns to series.
    pub fn infer(chart_type: ChartType, title: impl Into<String>, result: &QueryResult) -> Self {
        let numeric = result.numeric_columns();
        let x_idx = (0..result.columns.len()).find(|i| !numeric.contains(i));
        let mut y_columns: Vec<String> = numeric
            .iter()
            .filter(|i| Some(**i) != x_idx)
            .map(|i| result.columns[*i].clone())
            .collect();
        if chart_type == ChartType::Pie {
            y_columns.truncate(1);
        }
        Self {
            chart_type,
            title: title.into(),
            x_column: x_idx.map(|i| result.columns[i].clone()),
            y_columns,
        }
    }
}

/// Stored, referenceable render output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartArtifact {
    /// Path or handle returned by the artifact store
    pub handle: String,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `bytes` under `name` and return a retrievable handle.
    async fn store(&self, name: &str, mime_type: &str, bytes: Vec<u8>) -> Result<String>;
}

/// Writes artifacts into a directory
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn extension(mime_type: &str) -> &'static str {
    match mime_type {
        "image/svg+xml" => "svg",
        "text/csv" => "csv",
        _ => "bin",
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn store(&self, name: &str, mime_type: &str, bytes: Vec<u8>) -> Result<String> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(format!("{}.{}", name, extension(mime_type)));
        tokio::fs::write(&path, bytes).await?;
        debug!("Wrote artifact {}", path.display());
        Ok(path.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    items: RwLock<HashMap<String, (String, Vec<u8>)>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, handle: &str) -> Option<(String, Vec<u8>)> {
        self.items.read().await.get(handle).cloned()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn store(&self, name: &str, mime_type: &str, bytes: Vec<u8>) -> Result<String> {
        let handle = format!("mem://{}.{}", name, extension(mime_type));
        self.items.write().await.insert(handle.clone(), (mime_type.to_string(), bytes));
        Ok(handle)
    }
}

#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn render(&self, name: &str, intent: &ChartIntent, result: &QueryResult) -> Result<ChartArtifact>;
}

pub struct SvgChartRenderer {
    store: std::sync::Arc<dyn ArtifactStore>,
    width: u32,
    height: u32,
}

impl SvgChartRenderer {
    pub fn new(store: std::sync::Arc<dyn ArtifactStore>, width: u32, height: u32) -> Self {
        Self { store, width, height }
    }
}

#[async_trait]
impl ChartRenderer for SvgChartRenderer {
    async fn render(&self, name: &str, intent: &ChartIntent, result: &QueryResult) -> Result<ChartArtifact> {
        let (mime_type, bytes) = match intent.chart_type {
            ChartType::Table => ("text/csv", render_csv(result)?),
            _ => {
                let data = ChartData::extract(intent, result)?;
                let svg = match intent.chart_type {
                    ChartType::Pie => render_pie(&data, intent, self.width, self.height),
                    ChartType::Line => render_xy(&data, intent, self.width, self.height, true),
                    _ => render_xy(&data, intent, self.width, self.height, false),
                };
                ("image/svg+xml", svg.into_bytes())
            }
        };

        let handle = self.store.store(name, mime_type, bytes).await?;
        info!("Rendered {} artifact {} -> {}", intent.chart_type.as_str(), name, handle);

        let mut metadata = BTreeMap::new();
        metadata.insert("chart_type".to_string(), intent.chart_type.as_str().to_string());
        metadata.insert("rows".to_string(), result.row_count.to_string());
        metadata.insert("series".to_string(), intent.y_columns.join(","));
        if let Some(x) = &intent.x_column {
            metadata.insert("x".to_string(), x.clone());
        }

        Ok(ChartArtifact {
            handle,
            mime_type: mime_type.to_string(),
            width: self.width,
            height: self.height,
            metadata,
        })
    }
}

fn render_csv(result: &QueryResult) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&result.columns)
        .map_err(|e| ResolveError::Render(format!("CSV header: {}", e)))?;
    for row in &result.rows {
        writer
            .write_record(row.iter().map(cell_text))
            .map_err(|e| ResolveError::Render(format!("CSV row: {}", e)))?;
    }
    writer
        .into_inner()
        .map_err(|e| ResolveError::Render(format!("CSV flush: {}", e)))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct ChartData {
    labels: Vec<String>,
    series: Vec<(String, Vec<f64>)>,
}

impl ChartData {
    fn extract(intent: &ChartIntent, result: &QueryResult) -> Result<Self> {
        if result.rows.is_empty() {
            return Err(ResolveError::Render("no rows to plot".to_string()));
        }
        if intent.y_columns.is_empty() {
            return Err(ResolveError::Render("no numeric column to plot".to_string()));
        }
        let index_of = |name: &str| {
            result
                .columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| ResolveError::Render(format!("column {} not in result", name)))
        };

        let labels = match &intent.x_column {
            Some(x) => {
                let idx = index_of(x)?;
                result.rows.iter().map(|r| r.get(idx).map(cell_text).unwrap_or_default()).collect()
            }
            None => (1..=result.rows.len()).map(|i| i.to_string()).collect(),
        };

        let mut series = Vec::new();
        for column in &intent.y_columns {
            let idx = index_of(column)?;
            let values = result
                .rows
                .iter()
                .map(|r| r.get(idx).and_then(|v| v.as_f64()).unwrap_or(0.0))
                .collect();
            series.push((column.clone(), values));
        }
        Ok(Self { labels, series })
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

fn svg_open(out: &mut String, width: u32, height: u32, title: &str) {
    let _ = write!(
        out,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}" font-family="sans-serif">"#,
        w = width,
        h = height
    );
    let _ = write!(
        out,
        r##"<rect width="100%" height="100%" fill="#ffffff"/><text x="{}" y="24" text-anchor="middle" font-size="16">{}</text>"##,
        width / 2,
        escape(title)
    );
}

fn render_xy(data: &ChartData, intent: &ChartIntent, width: u32, height: u32, line: bool) -> String {
    let (left, right, top, bottom) = (60.0, 20.0, 40.0, 50.0);
    let plot_w = width as f64 - left - right;
    let plot_h = height as f64 - top - bottom;

    let max = data
        .series
        .iter()
        .flat_map(|(_, v)| v.iter().copied())
        .fold(0.0_f64, f64::max);
    let min = data
        .series
        .iter()
        .flat_map(|(_, v)| v.iter().copied())
        .fold(0.0_f64, f64::min);
    let span = if (max - min).abs() < f64::EPSILON { 1.0 } else { max - min };
    let y_of = |v: f64| top + plot_h - (v - min) / span * plot_h;

    let mut out = String::new();
    svg_open(&mut out, width, height, &intent.title);
    let _ = write!(
        out,
        r##"<line x1="{l}" y1="{b}" x2="{r}" y2="{b}" stroke="#333"/><line x1="{l}" y1="{t}" x2="{l}" y2="{b}" stroke="#333"/>"##,
        l = left,
        r = left + plot_w,
        t = top,
        b = y_of(min.max(0.0).min(max))
    );
    let _ = write!(out, r#"<text x="{}" y="{}" text-anchor="end" font-size="11">{}</text>"#, left - 6.0, top + 4.0, max);

    let n = data.labels.len().max(1);
    let slot = plot_w / n as f64;
    for (i, label) in data.labels.iter().enumerate() {
        let _ = write!(
            out,
            r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-size="11">{}</text>"#,
            left + slot * (i as f64 + 0.5),
            top + plot_h + 18.0,
            escape(label)
        );
    }

    let series_count = data.series.len();
    for (s, (name, values)) in data.series.iter().enumerate() {
        let color = PALETTE[s % PALETTE.len()];
        if line {
            let points: Vec<String> = values
                .iter()
                .enumerate()
                .map(|(i, v)| format!("{:.1},{:.1}", left + slot * (i as f64 + 0.5), y_of(*v)))
                .collect();
            let _ = write!(
                out,
                r#"<polyline fill="none" stroke="{}" stroke-width="2" points="{}"/>"#,
                color,
                points.join(" ")
            );
        } else {
            let bar_w = slot * 0.8 / series_count as f64;
            for (i, v) in values.iter().enumerate() {
                let x = left + slot * i as f64 + slot * 0.1 + bar_w * s as f64;
                let (y0, y1) = (y_of(v.max(0.0)), y_of(v.min(0.0)));
                let _ = write!(
                    out,
                    r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="{}"/>"#,
                    x,
                    y0,
                    bar_w,
                    (y1 - y0).max(0.5),
                    color
                );
            }
        }
        let _ = write!(
            out,
            r#"<text x="{:.1}" y="{}" font-size="11" fill="{}">{}</text>"#,
            left + 10.0 + 120.0 * s as f64,
            height - 8,
            color,
            escape(name)
        );
    }

    out.push_str("</svg>");
    out
}

fn render_pie(data: &ChartData, intent: &ChartIntent, width: u32, height: u32) -> String {
    let values: Vec<f64> = data.series[0].1.iter().map(|v| v.max(0.0)).collect();
    let total: f64 = values.iter().sum();
    let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0 + 12.0);
    let r = (width.min(height) as f64 / 2.0 - 40.0).max(10.0);

    let mut out = String::new();
    svg_open(&mut out, width, height, &intent.title);

    if total <= 0.0 {
        let _ = write!(out, r##"<circle cx="{}" cy="{}" r="{}" fill="#ddd"/>"##, cx, cy, r);
    } else {
        let mut angle = -std::f64::consts::FRAC_PI_2;
        for (i, v) in values.iter().enumerate() {
            let sweep = v / total * std::f64::consts::TAU;
            let color = PALETTE[i % PALETTE.len()];
            if sweep >= std::f64::consts::TAU - 1e-9 {
                let _ = write!(out, r#"<circle cx="{}" cy="{}" r="{}" fill="{}"/>"#, cx, cy, r, color);
            } else if sweep > 0.0 {
                let (x0, y0) = (cx + r * angle.cos(), cy + r * angle.sin());
                let end = angle + sweep;
                let (x1, y1) = (cx + r * end.cos(), cy + r * end.sin());
                let large = if sweep > std::f64::consts::PI { 1 } else { 0 };
                let _ = write!(
                    out,
                    r#"<path d="M{:.1},{:.1} L{:.1},{:.1} A{:.1},{:.1} 0 {} 1 {:.1},{:.1} Z" fill="{}"/>"#,
                    cx, cy, x0, y0, r, r, large, x1, y1, color
                );
            }
            let label = data.labels.get(i).map(|l| escape(l)).unwrap_or_default();
            let _ = write!(
                out,
                r#"<text x="10" y="{}" font-size="11" fill="{}">{} ({:.1}%)</text>"#,
                50 + 14 * i,
                color,
                label,
                v / total * 100.0
            );
            angle += sweep;
        }
    }

    out.push_str("</svg>");
    out
}
