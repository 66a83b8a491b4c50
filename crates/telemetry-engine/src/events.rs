use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ActivityRecord, CumulativeAggregate, DataPoint, LogEntry, ACTIVITY_CAPACITY, LOG_CAPACITY,
    SERIES_CAPACITY,
};

/// New running total for one model after a token data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTokenUpdate {
    pub model: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricUpdate {
    pub name: String,
    pub data_point: DataPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative: Option<CumulativeAggregate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tokens: Option<ModelTokenUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionCountUpdate {
    pub timestamp: DateTime<Utc>,
    pub value: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogUpdate {
    pub event_name: String,
    pub log_entry: LogEntry,
}

/// Everything a subscriber receives, in the order the engine produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum EngineEvent {
    #[serde(rename = "metrics-init")]
    Init(Box<EngineSnapshot>),
    #[serde(rename = "metric-update")]
    MetricUpdate(MetricUpdate),
    #[serde(rename = "session-count-update")]
    SessionCountUpdate(SessionCountUpdate),
    #[serde(rename = "activity-update")]
    ActivityUpdate(ActivityRecord),
    #[serde(rename = "log-update")]
    LogUpdate(LogUpdate),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "metrics-init",
            Self::MetricUpdate(_) => "metric-update",
            Self::SessionCountUpdate(_) => "session-count-update",
            Self::ActivityUpdate(_) => "activity-update",
            Self::LogUpdate(_) => "log-update",
        }
    }
}

/// Capacities a snapshot was taken under, so replay evicts the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalLimits {
    pub series: usize,
    pub activities: usize,
    pub logs: usize,
}

impl Default for JournalLimits {
    fn default() -> Self {
        Self {
            series: SERIES_CAPACITY,
            activities: ACTIVITY_CAPACITY,
            logs: LOG_CAPACITY,
        }
    }
}

/// Point-in-time copy of all live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    /// Series per metric name, oldest first.
    pub metrics: BTreeMap<String, Vec<DataPoint>>,
    pub cumulative: BTreeMap<String, CumulativeAggregate>,
    pub tokens_by_model: BTreeMap<String, f64>,
    /// Log history per event name, oldest first.
    pub logs: BTreeMap<String, Vec<LogEntry>>,
    /// Activity journal, newest first.
    pub activities: Vec<ActivityRecord>,
    pub active_session_count: usize,
    #[serde(default)]
    pub limits: JournalLimits,
}

impl EngineSnapshot {
    /// Fold one incremental event into this snapshot.
    ///
    /// A subscriber that starts from the `metrics-init` snapshot and applies
    /// every later event in order ends up equal to a fresh snapshot.
    pub fn apply(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Init(snapshot) => *self = snapshot.as_ref().clone(),
            EngineEvent::MetricUpdate(update) => {
                let series = self.metrics.entry(update.name.clone()).or_default();
                series.push(update.data_point.clone());
                if series.len() > self.limits.series {
                    let excess = series.len() - self.limits.series;
                    series.drain(..excess);
                }
                if let Some(cumulative) = &update.cumulative {
                    self.cumulative
                        .insert(update.name.clone(), cumulative.clone());
                }
                if let Some(tokens) = &update.model_tokens {
                    self.tokens_by_model
                        .insert(tokens.model.clone(), tokens.total);
                }
            }
            EngineEvent::SessionCountUpdate(update) => {
                self.active_session_count = update.value;
            }
            EngineEvent::ActivityUpdate(activity) => {
                let mut activities: VecDeque<ActivityRecord> =
                    std::mem::take(&mut self.activities).into();
                activities.push_front(activity.clone());
                activities.truncate(self.limits.activities);
                self.activities = activities.into();
            }
            EngineEvent::LogUpdate(update) => {
                let entries = self.logs.entry(update.event_name.clone()).or_default();
                entries.push(update.log_entry.clone());
                if entries.len() > self.limits.logs {
                    let excess = entries.len() - self.limits.logs;
                    entries.drain(..excess);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn events_serialize_with_dashboard_names() {
        let event = EngineEvent::SessionCountUpdate(SessionCountUpdate {
            timestamp: Utc::now(),
            value: 3,
        });

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "session-count-update");
        assert_eq!(json["data"]["value"], 3);
        assert_eq!(event.name(), "session-count-update");
    }

    #[test]
    fn metric_update_round_trips() {
        let event = EngineEvent::MetricUpdate(MetricUpdate {
            name: "claude_code.cost.usage".to_string(),
            data_point: DataPoint {
                timestamp: Utc::now(),
                value: 0.5,
                kind: None,
                model: Some("sonnet".to_string()),
            },
            cumulative: None,
            model_tokens: None,
        });

        let json = serde_json::to_string(&event).expect("serialize");
        let back: EngineEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
        assert!(json.contains("\"dataPoint\""));
    }

    #[test]
    fn apply_trims_series_to_the_snapshot_limit() {
        let mut snapshot = EngineSnapshot {
            metrics: BTreeMap::new(),
            cumulative: BTreeMap::new(),
            tokens_by_model: BTreeMap::new(),
            logs: BTreeMap::new(),
            activities: Vec::new(),
            active_session_count: 0,
            limits: JournalLimits {
                series: 2,
                activities: 1,
                logs: 1,
            },
        };

        for value in [1.0, 2.0, 3.0] {
            snapshot.apply(&EngineEvent::MetricUpdate(MetricUpdate {
                name: "m".to_string(),
                data_point: DataPoint {
                    timestamp: Utc::now(),
                    value,
                    kind: None,
                    model: None,
                },
                cumulative: None,
                model_tokens: None,
            }));
        }

        let values: Vec<f64> = snapshot.metrics["m"].iter().map(|p| p.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);
    }
}
