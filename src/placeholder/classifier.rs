//! Keyword classification of placeholder descriptions
//!
//! Priority: chart > statistical > period > unknown. A description such as
//! "total complaints last month" names a period but asks for a number, so the
//! aggregation keywords win.

use crate::period::Granularity;
use crate::placeholder::grammar::TokenSyntax;
use crate::placeholder::spec::PlaceholderKind;

const CHART_KEYWORDS: &[&str] = &[
    "chart", "graph", "plot", "trend", "histogram", "pie", "bar", "图", "趋势", "分布", "柱状", "饼",
];

const STAT_KEYWORDS: &[&str] = &[
    "total", "count", "sum", "number of", "how many", "average", "avg", "mean", "max", "min", "rate",
    "ratio", "percent", "share", "top", "amount", "总", "数量", "次数", "合计", "平均", "最大", "最小",
    "占比", "比例", "率", "多少", "金额", "排名",
];

const PERIOD_KEYWORDS: &[&str] = &[
    "period", "date", "time", "range", "start", "end", "week", "month", "day", "时间", "日期", "周期",
    "期间", "开始", "结束", "起始", "截止",
];

/// Swappable description classifier
pub trait PlaceholderClassifier: Send + Sync {
    fn classify(&self, description: &str, syntax: &TokenSyntax) -> PlaceholderKind;

    fn granularity(&self, description: &str) -> Option<Granularity> {
        declared_granularity(description)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl PlaceholderClassifier for KeywordClassifier {
    fn classify(&self, description: &str, syntax: &TokenSyntax) -> PlaceholderKind {
        if matches!(syntax, TokenSyntax::Artifact { .. }) {
            return PlaceholderKind::Chart;
        }

        let desc = description.to_lowercase();
        let has = |keywords: &[&str]| keywords.iter().any(|k| desc.contains(k));

        if has(CHART_KEYWORDS) {
            PlaceholderKind::Chart
        } else if has(STAT_KEYWORDS) {
            PlaceholderKind::Statistical
        } else if has(PERIOD_KEYWORDS) {
            PlaceholderKind::Period
        } else {
            PlaceholderKind::Unknown
        }
    }
}

/// Granularity named by a description, if any
pub fn declared_granularity(description: &str) -> Option<Granularity> {
    let desc = description.to_lowercase();
    let has = |keywords: &[&str]| keywords.iter().any(|k| desc.contains(k));

    if has(&["monthly", "month", "每月", "月度", "本月", "上月"]) {
        Some(Granularity::Monthly)
    } else if has(&["weekly", "week", "每周", "周度", "本周", "上周"]) {
        Some(Granularity::Weekly)
    } else if has(&["daily", "day", "yesterday", "每日", "每天", "昨日", "昨天"]) {
        Some(Granularity::Daily)
    } else {
        None
    }
}
