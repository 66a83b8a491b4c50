use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SERIES_CAPACITY: usize = 1000;
pub const ACTIVITY_CAPACITY: usize = 100;
pub const LOG_CAPACITY: usize = 1000;

/// Bucket used in the model tally when a token data point carries no model.
pub const UNKNOWN_MODEL: &str = "Unknown";

/// Metric names the live store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricKind {
    CostUsage,
    TokenUsage,
    LinesOfCode,
    SessionCount,
    CodeEditDecision,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::CostUsage,
        MetricKind::TokenUsage,
        MetricKind::LinesOfCode,
        MetricKind::SessionCount,
        MetricKind::CodeEditDecision,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CostUsage => "claude_code.cost.usage",
            Self::TokenUsage => "claude_code.token.usage",
            Self::LinesOfCode => "claude_code.lines_of_code.count",
            Self::SessionCount => "claude_code.session.count",
            Self::CodeEditDecision => "claude_code.code_edit_tool.decision",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Whether a running total/count/average is kept for this metric.
    pub fn has_cumulative(self) -> bool {
        matches!(self, Self::CostUsage | Self::TokenUsage | Self::LinesOfCode)
    }
}

/// Log event names the journals accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogEventKind {
    UserPrompt,
    ToolResult,
    ApiRequest,
    ApiError,
    ToolDecision,
}

impl LogEventKind {
    pub const ALL: [LogEventKind; 5] = [
        LogEventKind::UserPrompt,
        LogEventKind::ToolResult,
        LogEventKind::ApiRequest,
        LogEventKind::ApiError,
        LogEventKind::ToolDecision,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserPrompt => "claude_code.user_prompt",
            Self::ToolResult => "claude_code.tool_result",
            Self::ApiRequest => "claude_code.api_request",
            Self::ApiError => "claude_code.api_error",
            Self::ToolDecision => "claude_code.tool_decision",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

/// A flattened attribute scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Render any scalar as text, for columns that store attributes as strings.
    pub fn to_text(&self) -> String {
        match self {
            Self::Bool(value) => value.to_string(),
            Self::Int(value) => value.to_string(),
            Self::Double(value) => value.to_string(),
            Self::String(value) => value.clone(),
        }
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Running total for a metric since process start (or since seeding).
///
/// Fields are only mutated through [`CumulativeAggregate::record`] and
/// [`CumulativeAggregate::absorb`], which keep `average == total / count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CumulativeAggregate {
    total: f64,
    count: u64,
    average: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    added: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    removed: Option<f64>,
}

impl CumulativeAggregate {
    pub fn for_metric(kind: MetricKind) -> Self {
        let tracks_lines = kind == MetricKind::LinesOfCode;
        Self {
            total: 0.0,
            count: 0,
            average: 0.0,
            added: tracks_lines.then_some(0.0),
            removed: tracks_lines.then_some(0.0),
        }
    }

    pub fn record(&mut self, value: f64, sub_type: Option<&str>) {
        self.absorb(value, 1, sub_type);
    }

    /// Fold a pre-aggregated `(total, count)` pair in, as produced by the
    /// durable backend when seeding at startup.
    pub fn absorb(&mut self, total: f64, count: u64, sub_type: Option<&str>) {
        if count == 0 {
            return;
        }
        self.total += total;
        self.count += count;
        self.average = self.total / self.count as f64;

        match sub_type {
            Some("added") => {
                if let Some(added) = self.added.as_mut() {
                    *added += total;
                }
            }
            Some("removed") => {
                if let Some(removed) = self.removed.as_mut() {
                    *removed += total;
                }
            }
            _ => {}
        }
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn average(&self) -> f64 {
        self.average
    }

    pub fn added(&self) -> Option<f64> {
        self.added
    }

    pub fn removed(&self) -> Option<f64> {
        self.removed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub last_seen_at: DateTime<Utc>,
}

/// The raw producer request behind an activity entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActivityRequest {
    pub body: serde_json::Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub timestamp: DateTime<Utc>,
    pub request: ActivityRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub attributes: Attributes,
    pub body: String,
}

/// Live series query: optional metric name and inclusive time bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesFilter {
    pub metric: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl SeriesFilter {
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| timestamp >= from)
            && self.to.map_or(true, |to| timestamp <= to)
    }
}

/// Log journal query; `limit` keeps the most recent entries per event name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    pub event: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub latest: Option<f64>,
    /// Window average rendered with two decimals.
    pub average: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative: Option<CumulativeAggregate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSummary {
    pub count: usize,
    pub latest: Option<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelShare {
    pub model: String,
    pub tokens: f64,
    /// Share of all tokens, one decimal.
    pub percentage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTokenBreakdown {
    pub models: Vec<ModelShare>,
    pub total: f64,
}

impl ModelTokenBreakdown {
    pub fn from_tally<'a>(tally: impl IntoIterator<Item = (&'a String, &'a f64)>) -> Self {
        let mut models: Vec<(String, f64)> = tally
            .into_iter()
            .map(|(model, tokens)| (model.clone(), *tokens))
            .collect();
        let total: f64 = models.iter().map(|(_, tokens)| tokens).sum();
        models.sort_by(|a, b| b.1.total_cmp(&a.1));

        Self {
            models: models
                .into_iter()
                .map(|(model, tokens)| ModelShare {
                    model,
                    tokens,
                    percentage: if total > 0.0 {
                        format!("{:.1}", tokens / total * 100.0)
                    } else {
                        "0".to_string()
                    },
                })
                .collect(),
            total,
        }
    }
}

/// Token totals by token type (`input`, `output`, `cacheRead`, `cacheCreation`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTypeTotals {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_creation: f64,
    #[serde(flatten)]
    pub other: BTreeMap<String, f64>,
}

impl Default for TokenTypeTotals {
    fn default() -> Self {
        Self {
            input: 0.0,
            output: 0.0,
            cache_read: 0.0,
            cache_creation: 0.0,
            other: BTreeMap::new(),
        }
    }
}

impl TokenTypeTotals {
    pub fn add(&mut self, token_type: &str, value: f64) {
        match token_type {
            "input" => self.input += value,
            "output" => self.output += value,
            "cacheRead" => self.cache_read += value,
            "cacheCreation" => self.cache_creation += value,
            other => *self.other.entry(other.to_string()).or_insert(0.0) += value,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input <= 0.0
            && self.output <= 0.0
            && self.cache_read <= 0.0
            && self.cache_creation <= 0.0
            && self.other.values().all(|value| *value <= 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_kind_round_trips_through_names() {
        for kind in MetricKind::ALL {
            assert_eq!(MetricKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(MetricKind::from_name("claude_code.unknown"), None);
    }

    #[test]
    fn cumulative_average_tracks_total_and_count() {
        let mut aggregate = CumulativeAggregate::for_metric(MetricKind::CostUsage);
        for value in [1.0, 2.5, 0.5] {
            aggregate.record(value, None);
            assert!((aggregate.average() - aggregate.total() / aggregate.count() as f64).abs() < 1e-9);
        }
        assert!((aggregate.total() - 4.0).abs() < 1e-9);
        assert_eq!(aggregate.count(), 3);
        assert_eq!(format!("{:.2}", aggregate.average()), "1.33");
        assert_eq!(aggregate.added(), None);
    }

    #[test]
    fn lines_aggregate_splits_added_and_removed() {
        let mut aggregate = CumulativeAggregate::for_metric(MetricKind::LinesOfCode);
        aggregate.record(10.0, Some("added"));
        aggregate.record(4.0, Some("removed"));
        aggregate.record(1.0, Some("renamed"));

        assert_eq!(aggregate.added(), Some(10.0));
        assert_eq!(aggregate.removed(), Some(4.0));
        assert_eq!(aggregate.total(), 15.0);
    }

    #[test]
    fn absorb_ignores_empty_groups() {
        let mut aggregate = CumulativeAggregate::for_metric(MetricKind::TokenUsage);
        aggregate.absorb(0.0, 0, None);
        assert_eq!(aggregate.count(), 0);
        assert_eq!(aggregate.average(), 0.0);
    }

    #[test]
    fn model_breakdown_sorts_and_computes_percentages() {
        let mut tally = BTreeMap::new();
        tally.insert("small".to_string(), 25.0);
        tally.insert("large".to_string(), 75.0);

        let breakdown = ModelTokenBreakdown::from_tally(&tally);
        assert_eq!(breakdown.total, 100.0);
        assert_eq!(breakdown.models[0].model, "large");
        assert_eq!(breakdown.models[0].percentage, "75.0");
        assert_eq!(breakdown.models[1].percentage, "25.0");
    }

    #[test]
    fn token_type_totals_serialize_with_camel_case_keys() {
        let mut totals = TokenTypeTotals::default();
        totals.add("cacheRead", 3.0);
        totals.add("input", 2.0);

        let json = serde_json::to_value(&totals).expect("serialize");
        assert_eq!(json["cacheRead"], 3.0);
        assert_eq!(json["input"], 2.0);
        assert!(!totals.is_empty());
    }
}
