//! Cold-path shaping of backend rows into dashboard series.
//!
//! Local calendar days are derived from a UTC offset in minutes
//! (`local = utc + offset`), so all range math stays in `chrono` naive dates.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{AggregateRow, MetricPoint, TimeRange};
use crate::types::{MetricKind, ModelTokenBreakdown, TokenTypeTotals};

const HISTORY_WEEKS: i64 = 12;
const HISTORY_MONTHS: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!("unknown period: {}", other)),
        }
    }
}

/// "Now" as seen by a caller in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalClock {
    pub now: DateTime<Utc>,
    pub utc_offset_minutes: i32,
}

impl LocalClock {
    pub fn new(now: DateTime<Utc>, utc_offset_minutes: i32) -> Self {
        Self {
            now,
            utc_offset_minutes,
        }
    }

    /// Browsers report `getTimezoneOffset()`, which is `utc - local`.
    pub fn from_browser_offset(now: DateTime<Utc>, timezone_offset: i32) -> Self {
        Self::new(now, -timezone_offset)
    }

    fn offset(&self) -> Duration {
        Duration::minutes(i64::from(self.utc_offset_minutes))
    }

    pub fn today(&self) -> NaiveDate {
        (self.now.naive_utc() + self.offset()).date()
    }

    /// UTC instant of local midnight at the start of `date`.
    pub fn start_of(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = NaiveDateTime::new(date, NaiveTime::MIN);
        (midnight - self.offset()).and_utc()
    }

    fn until_tomorrow(&self, start: NaiveDate) -> TimeRange {
        let tomorrow = self.today() + Duration::days(1);
        TimeRange::between(self.start_of(start), self.start_of(tomorrow))
    }

    pub fn today_range(&self) -> TimeRange {
        self.until_tomorrow(self.today())
    }

    /// Window feeding the historical chart: today, the last twelve weeks, or
    /// the last twelve months.
    pub fn history_range(&self, period: Period) -> TimeRange {
        let today = self.today();
        let start = match period {
            Period::Daily => today,
            Period::Weekly => today - Duration::days(HISTORY_WEEKS * 7),
            Period::Monthly => first_of_month(today)
                .checked_sub_months(Months::new(HISTORY_MONTHS))
                .unwrap_or(today),
        };
        self.until_tomorrow(start)
    }

    /// The running calendar period: today, this week from Sunday, or this month.
    pub fn current_period_range(&self, period: Period) -> TimeRange {
        let today = self.today();
        let start = match period {
            Period::Daily => today,
            Period::Weekly => start_of_week(today),
            Period::Monthly => first_of_month(today),
        };
        self.until_tomorrow(start)
    }

    /// Model breakdown window: today, the last seven days, or this month.
    pub fn trailing_range(&self, period: Period) -> TimeRange {
        let today = self.today();
        let start = match period {
            Period::Daily => today,
            Period::Weekly => today - Duration::days(6),
            Period::Monthly => first_of_month(today),
        };
        self.until_tomorrow(start)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodTotals {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub cost: f64,
    pub tokens: f64,
    pub lines: f64,
    pub lines_added: f64,
    pub lines_removed: f64,
}

impl PeriodTotals {
    fn starting(date: NaiveDate) -> Self {
        Self {
            period_start: date,
            period_end: date,
            cost: 0.0,
            tokens: 0.0,
            lines: 0.0,
            lines_added: 0.0,
            lines_removed: 0.0,
        }
    }

    fn add(&mut self, other: &PeriodTotals) {
        self.cost += other.cost;
        self.tokens += other.tokens;
        self.lines += other.lines;
        self.lines_added += other.lines_added;
        self.lines_removed += other.lines_removed;
    }
}

/// Fold `GroupBy::Day` rows into one totals entry per day, ascending.
pub fn daily_totals(rows: &[AggregateRow]) -> Vec<PeriodTotals> {
    let mut days: BTreeMap<NaiveDate, PeriodTotals> = BTreeMap::new();

    for row in rows {
        let Some(date) = row
            .key
            .as_deref()
            .and_then(|key| NaiveDate::parse_from_str(key, "%Y-%m-%d").ok())
        else {
            continue;
        };
        let day = days
            .entry(date)
            .or_insert_with(|| PeriodTotals::starting(date));

        match MetricKind::from_name(&row.metric_name) {
            Some(MetricKind::CostUsage) => day.cost += row.total,
            Some(MetricKind::TokenUsage) => day.tokens += row.total,
            Some(MetricKind::LinesOfCode) => {
                day.lines += row.total;
                match row.sub_type.as_deref() {
                    Some("added") => day.lines_added += row.total,
                    Some("removed") => day.lines_removed += row.total,
                    _ => {}
                }
            }
            _ => {}
        }
    }

    days.into_values().collect()
}

pub fn aggregate_weekly(days: &[PeriodTotals]) -> Vec<PeriodTotals> {
    aggregate_by_period(days, start_of_week)
}

pub fn aggregate_monthly(days: &[PeriodTotals]) -> Vec<PeriodTotals> {
    aggregate_by_period(days, first_of_month)
}

fn aggregate_by_period<F>(days: &[PeriodTotals], period_start_resolver: F) -> Vec<PeriodTotals>
where
    F: Fn(NaiveDate) -> NaiveDate,
{
    let mut buckets: HashMap<NaiveDate, PeriodTotals> = HashMap::new();

    for day in days {
        let period_start = period_start_resolver(day.period_start);
        let entry = buckets
            .entry(period_start)
            .or_insert_with(|| PeriodTotals::starting(period_start));

        if day.period_end > entry.period_end {
            entry.period_end = day.period_end;
        }
        entry.add(day);
    }

    let mut periods: Vec<PeriodTotals> = buckets.into_values().collect();
    periods.sort_by_key(|period| period.period_start);
    periods
}

/// Weeks start on Sunday.
fn start_of_week(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_sunday()))
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Chart arrays for the historical view; tokens are reported in thousands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalSeries {
    pub labels: Vec<String>,
    pub cost: Vec<f64>,
    pub tokens: Vec<f64>,
    pub lines: Vec<f64>,
    pub lines_added: Vec<f64>,
    pub lines_removed: Vec<f64>,
}

impl HistoricalSeries {
    pub fn build(period: Period, rows: &[AggregateRow]) -> Self {
        let days = daily_totals(rows);
        let periods = match period {
            Period::Daily => days,
            Period::Weekly => aggregate_weekly(&days),
            Period::Monthly => aggregate_monthly(&days),
        };

        let mut series = Self::default();
        for entry in &periods {
            series.labels.push(period_label(period, entry.period_start));
            series.cost.push(entry.cost);
            series.tokens.push(entry.tokens / 1000.0);
            series.lines.push(entry.lines);
            series.lines_added.push(entry.lines_added);
            series.lines_removed.push(entry.lines_removed);
        }
        series
    }
}

fn period_label(period: Period, start: NaiveDate) -> String {
    match period {
        Period::Monthly => start.format("%b %Y").to_string(),
        Period::Daily | Period::Weekly => start.format("%b %-d").to_string(),
    }
}

/// Token totals from `GroupBy::TokenType` rows; untyped rows are skipped.
pub fn token_types_from(rows: &[AggregateRow]) -> TokenTypeTotals {
    let mut totals = TokenTypeTotals::default();
    for row in rows {
        if let Some(token_type) = row.key.as_deref() {
            totals.add(token_type, row.total);
        }
    }
    totals
}

/// Model breakdown from `GroupBy::Model` rows; rows without a model are skipped.
pub fn model_breakdown_from(rows: &[AggregateRow]) -> ModelTokenBreakdown {
    let mut tally: BTreeMap<String, f64> = BTreeMap::new();
    for row in rows {
        if let Some(model) = row.key.as_deref() {
            *tally.entry(model.to_string()).or_insert(0.0) += row.total;
        }
    }
    ModelTokenBreakdown::from_tally(&tally)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ChartPoint {
    fn from_point(point: &MetricPoint) -> Self {
        Self {
            timestamp: point.time,
            value: point.value,
            kind: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecentChartData {
    pub cost: Vec<ChartPoint>,
    pub token: Vec<ChartPoint>,
    pub lines: Vec<ChartPoint>,
}

impl RecentChartData {
    pub fn from_points(points: &[MetricPoint]) -> Self {
        let mut data = Self::default();
        for point in points {
            let target = match MetricKind::from_name(&point.metric_name) {
                Some(MetricKind::CostUsage) => &mut data.cost,
                Some(MetricKind::TokenUsage) => &mut data.token,
                Some(MetricKind::LinesOfCode) => &mut data.lines,
                _ => continue,
            };
            target.push(ChartPoint::from_point(point));
        }
        data
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinesByType {
    pub added: f64,
    pub removed: f64,
}

/// Per-session series and breakdowns built from the session's stored rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub cost: Vec<ChartPoint>,
    pub tokens: Vec<ChartPoint>,
    pub lines: Vec<ChartPoint>,
    pub tokens_by_type: TokenTypeTotals,
    pub lines_by_type: LinesByType,
    pub tokens_by_model: BTreeMap<String, f64>,
}

/// Totals for one session across all of its stored rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTotals {
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub total_cost: f64,
    pub total_tokens: f64,
    pub total_lines: f64,
    pub models_used: Vec<String>,
}

impl SessionMetrics {
    pub fn from_points(points: &[MetricPoint]) -> Self {
        let mut metrics = Self::default();

        for point in points {
            match MetricKind::from_name(&point.metric_name) {
                Some(MetricKind::CostUsage) => metrics.cost.push(ChartPoint::from_point(point)),
                Some(MetricKind::TokenUsage) => {
                    metrics.tokens.push(ChartPoint::from_point(point));
                    if let Some(token_type) = point.token_type.as_deref() {
                        metrics.tokens_by_type.add(token_type, point.value);
                    }
                    if let Some(model) = point.model.as_deref() {
                        *metrics
                            .tokens_by_model
                            .entry(model.to_string())
                            .or_insert(0.0) += point.value;
                    }
                }
                Some(MetricKind::LinesOfCode) => {
                    metrics.lines.push(ChartPoint {
                        kind: point.lines_type.clone(),
                        ..ChartPoint::from_point(point)
                    });
                    match point.lines_type.as_deref() {
                        Some("added") => metrics.lines_by_type.added += point.value,
                        Some("removed") => metrics.lines_by_type.removed += point.value,
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        metrics
    }
}

impl SessionTotals {
    pub fn from_points(points: &[MetricPoint]) -> Self {
        let mut totals = Self {
            first_seen: points.iter().map(|point| point.time).min(),
            last_seen: points.iter().map(|point| point.time).max(),
            ..Self::default()
        };

        for point in points {
            match MetricKind::from_name(&point.metric_name) {
                Some(MetricKind::CostUsage) => totals.total_cost += point.value,
                Some(MetricKind::TokenUsage) => totals.total_tokens += point.value,
                Some(MetricKind::LinesOfCode) => totals.total_lines += point.value,
                _ => {}
            }
            if let Some(model) = point.model.as_ref() {
                if !totals.models_used.contains(model) {
                    totals.models_used.push(model.clone());
                }
            }
        }
        totals.models_used.sort();
        totals
    }
}
