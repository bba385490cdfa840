//! Period resolution
//!
//! Turns a schedule expression and a reference instant into the concrete
//! reporting window, and binds that window into SQL time tokens.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref TIME_TOKEN: Regex =
        Regex::new(r"'?\{\{\s*(start_date|end_date)\s*\}\}'?").expect("valid time token regex");
}

/// SQL token bound to the window start
pub const START_TOKEN: &str = "{{start_date}}";
/// SQL token bound to the window end
pub const END_TOKEN: &str = "{{end_date}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Daily,
    Weekly,
    Monthly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
            Granularity::Monthly => "monthly",
        }
    }

    /// Parse a schedule expression: a keyword or a 5/6-field cron line.
    pub fn from_schedule(expression: &str) -> Option<Self> {
        let expr = expression.trim().to_lowercase();
        if expr.is_empty() {
            return None;
        }

        match expr.as_str() {
            "daily" | "day" | "@daily" | "@midnight" | "每天" | "每日" => return Some(Granularity::Daily),
            "weekly" | "week" | "@weekly" | "每周" => return Some(Granularity::Weekly),
            "monthly" | "month" | "@monthly" | "每月" => return Some(Granularity::Monthly),
            _ => {}
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        let fields = match fields.len() {
            5 => &fields[..],
            6 => &fields[1..],
            _ => return None,
        };
        let (dom, dow) = (fields[2], fields[4]);
        let is_wild = |f: &str| f == "*" || f == "?";

        if !is_wild(dow) {
            Some(Granularity::Weekly)
        } else if !is_wild(dom) {
            Some(Granularity::Monthly)
        } else {
            Some(Granularity::Daily)
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive date range shared by every placeholder in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity: Option<Granularity>,
}

impl TimeWindow {
    pub fn new(start: NaiveDate, end: NaiveDate, granularity: Option<Granularity>) -> Self {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        Self { start, end, granularity }
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self::new(day, day, Some(Granularity::Daily))
    }

    /// Completed period immediately preceding `reference`.
    pub fn preceding(granularity: Granularity, reference: NaiveDate) -> Self {
        let yesterday = reference - Duration::days(1);
        match granularity {
            Granularity::Daily => Self::new(yesterday, yesterday, Some(granularity)),
            Granularity::Weekly => Self::new(reference - Duration::days(7), yesterday, Some(granularity)),
            Granularity::Monthly => {
                let first_of_this_month = reference.with_day(1).unwrap_or(reference);
                let last_of_previous = first_of_this_month - Duration::days(1);
                let first_of_previous = last_of_previous.with_day(1).unwrap_or(last_of_previous);
                Self::new(first_of_previous, last_of_previous, Some(granularity))
            }
        }
    }

    pub fn start_str(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }

    /// Text for a period token, picking a bound when the description names one.
    pub fn format_for(&self, description: &str) -> String {
        let desc = description.to_lowercase();
        let wants_start = ["start", "begin", "from", "开始", "起始"].iter().any(|k| desc.contains(k));
        let wants_end = ["end", "until", "through", "结束", "截止"].iter().any(|k| desc.contains(k));

        match (wants_start, wants_end) {
            (true, false) => self.start_str(),
            (false, true) => self.end_str(),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start_str())
        } else {
            write!(f, "{} ~ {}", self.start_str(), self.end_str())
        }
    }
}

/// Caller-supplied bounds used when no schedule applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverrides {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateOverrides {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    fn window(&self) -> Option<TimeWindow> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some(TimeWindow::new(s, e, None)),
            (Some(d), None) | (None, Some(d)) => Some(TimeWindow::new(d, d, None)),
            (None, None) => None,
        }
    }
}

/// Source of "today" for fallbacks without a reference instant
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

pub struct PeriodResolver {
    clock: Box<dyn Clock>,
}

impl Default for PeriodResolver {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl PeriodResolver {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self { clock: Box::new(clock) }
    }

    /// Resolve the reporting window. Never fails.
    ///
    /// Fallback chain: schedule → explicit overrides → yesterday. The clock is
    /// consulted only when no reference instant is given.
    pub fn resolve(
        &self,
        schedule_expression: Option<&str>,
        reference: Option<DateTime<Utc>>,
        overrides: &DateOverrides,
    ) -> TimeWindow {
        let reference_day = reference
            .map(|r| r.date_naive())
            .unwrap_or_else(|| self.clock.today());

        if let Some(granularity) = schedule_expression.and_then(Granularity::from_schedule) {
            return TimeWindow::preceding(granularity, reference_day);
        }

        if let Some(window) = overrides.window() {
            return window;
        }

        TimeWindow::single_day(reference_day - Duration::days(1))
    }
}

/// Replace `{{start_date}}` / `{{end_date}}` with quoted ISO dates.
///
/// Tokens that are already wrapped in single quotes are replaced together
/// with their quotes, so binding an already-bound statement is a no-op.
pub fn bind_time_window(sql: &str, window: &TimeWindow) -> String {
    TIME_TOKEN
        .replace_all(sql, |caps: &Captures| match &caps[1] {
            "start_date" => format!("'{}'", window.start_str()),
            _ => format!("'{}'", window.end_str()),
        })
        .into_owned()
}

/// Whether a statement still carries unbound time tokens
pub fn has_time_tokens(sql: &str) -> bool {
    TIME_TOKEN.is_match(sql)
}
