//! Decoding of OTLP/JSON metric and log envelopes into flat records.
//!
//! Both entry points are pure: they never touch engine state. A shape error
//! anywhere in the envelope fails the whole envelope, while log records with a
//! missing or unrecognized `event.name` are dropped one by one.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{AttributeValue, Attributes, DataPoint, LogEntry, LogEventKind};

const DEFAULT_SERVICE_NAME: &str = "claude-code";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Invalid metric data: {0}")]
    InvalidMetrics(String),

    #[error("Invalid log data: {0}")]
    InvalidLogs(String),
}

/// Where a data point came from, carried through to the durable row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordContext {
    pub unit: Option<String>,
    pub description: Option<String>,
    pub service_name: String,
    pub service_version: Option<String>,
    pub scope_name: Option<String>,
    pub scope_version: Option<String>,
    pub start_time_unix_nano: String,
    pub time_unix_nano: String,
}

/// One numeric observation extracted from a metrics envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub name: String,
    pub data_point: DataPoint,
    pub attributes: Attributes,
    pub context: RecordContext,
    pub raw: Value,
}

impl MetricRecord {
    pub fn session_id(&self) -> Option<&str> {
        self.attribute_str("session.id")
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttributeValue::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub event: LogEventKind,
    pub entry: LogEntry,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogBatch {
    pub records: Vec<LogRecord>,
    /// Records skipped for a missing or unknown `event.name`.
    pub dropped: usize,
}

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricsEnvelope {
    resource_metrics: Vec<ResourceMetrics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceMetrics {
    #[serde(default)]
    resource: Option<Resource>,
    #[serde(default)]
    scope_metrics: Vec<ScopeMetrics>,
}

#[derive(Debug, Default, Deserialize)]
struct Resource {
    #[serde(default)]
    attributes: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeMetrics {
    #[serde(default)]
    scope: Option<Scope>,
    #[serde(default)]
    metrics: Vec<Metric>,
}

#[derive(Debug, Default, Deserialize)]
struct Scope {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Metric {
    name: String,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    sum: Option<PointList>,
    #[serde(default)]
    gauge: Option<PointList>,
    #[serde(default)]
    histogram: Option<PointList>,
}

/// Data points are kept as raw JSON so the durable row can store them verbatim.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointList {
    #[serde(default)]
    data_points: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NumberDataPoint {
    #[serde(default)]
    attributes: Vec<KeyValue>,
    #[serde(default)]
    start_time_unix_nano: Option<Int64>,
    #[serde(default)]
    time_unix_nano: Option<Int64>,
    #[serde(default)]
    as_int: Option<Int64>,
    #[serde(default)]
    as_double: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistogramDataPoint {
    #[serde(default)]
    attributes: Vec<KeyValue>,
    #[serde(default)]
    start_time_unix_nano: Option<Int64>,
    #[serde(default)]
    time_unix_nano: Option<Int64>,
    #[serde(default)]
    sum: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsEnvelope {
    resource_logs: Vec<ResourceLogs>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceLogs {
    #[serde(default)]
    scope_logs: Vec<ScopeLogs>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeLogs {
    #[serde(default)]
    log_records: Vec<WireLogRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLogRecord {
    #[serde(default)]
    time_unix_nano: Option<Int64>,
    #[serde(default)]
    observed_time_unix_nano: Option<Int64>,
    #[serde(default)]
    attributes: Vec<KeyValue>,
    #[serde(default)]
    body: Option<AnyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: Option<AnyValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnyValue {
    #[serde(default)]
    string_value: Option<String>,
    #[serde(default)]
    int_value: Option<Int64>,
    #[serde(default)]
    double_value: Option<f64>,
    #[serde(default)]
    bool_value: Option<bool>,
}

/// OTLP/JSON encodes 64-bit integers as decimal strings; some exporters send numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Int64 {
    Number(i64),
    Text(String),
}

impl Int64 {
    fn parse(&self) -> Option<i64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(raw) => raw.trim().parse().ok(),
        }
    }

    fn raw(&self) -> String {
        match self {
            Self::Number(value) => value.to_string(),
            Self::Text(raw) => raw.clone(),
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Flatten a metrics envelope into one record per data point.
pub fn normalize_metrics(
    envelope: &Value,
    received_at: DateTime<Utc>,
) -> Result<Vec<MetricRecord>, NormalizeError> {
    let invalid = |reason: String| NormalizeError::InvalidMetrics(reason);
    let envelope = MetricsEnvelope::deserialize(envelope).map_err(|e| invalid(e.to_string()))?;

    let mut records = Vec::new();
    for resource_metrics in envelope.resource_metrics {
        let resource_attrs =
            flatten_attributes(&resource_metrics.resource.unwrap_or_default().attributes)
                .map_err(invalid)?;
        let service_name = resource_attrs
            .get("service.name")
            .map(AttributeValue::to_text)
            .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
        let service_version = resource_attrs
            .get("service.version")
            .map(AttributeValue::to_text);

        for scope_metrics in resource_metrics.scope_metrics {
            let scope = scope_metrics.scope.unwrap_or_default();

            for metric in scope_metrics.metrics {
                let context = RecordContext {
                    unit: metric.unit.clone(),
                    description: metric.description.clone(),
                    service_name: service_name.clone(),
                    service_version: service_version.clone(),
                    scope_name: scope.name.clone(),
                    scope_version: scope.version.clone(),
                    ..RecordContext::default()
                };
                normalize_metric(&metric, &context, received_at, &mut records)?;
            }
        }
    }

    Ok(records)
}

fn normalize_metric(
    metric: &Metric,
    context: &RecordContext,
    received_at: DateTime<Utc>,
    records: &mut Vec<MetricRecord>,
) -> Result<(), NormalizeError> {
    let invalid = |reason: String| {
        NormalizeError::InvalidMetrics(format!("metric '{}': {}", metric.name, reason))
    };

    // Counter and gauge shapes win over a histogram sum.
    if let Some(points) = metric.sum.as_ref().or(metric.gauge.as_ref()) {
        for raw in &points.data_points {
            let point = NumberDataPoint::deserialize(raw).map_err(|e| invalid(e.to_string()))?;
            let value = match (&point.as_int, point.as_double) {
                (Some(int), _) => int
                    .parse()
                    .map(|v| v as f64)
                    .ok_or_else(|| invalid(format!("asInt '{}' is not an integer", int.raw())))?,
                (None, Some(double)) => double,
                (None, None) => {
                    debug!("Skipping data point without a value for {}", metric.name);
                    continue;
                }
            };
            let attributes = flatten_attributes(&point.attributes).map_err(invalid)?;
            records.push(build_record(
                metric,
                context,
                value,
                attributes,
                point.start_time_unix_nano.as_ref(),
                point.time_unix_nano.as_ref(),
                received_at,
                raw,
            ));
        }
    } else if let Some(points) = metric.histogram.as_ref() {
        for raw in &points.data_points {
            let point =
                HistogramDataPoint::deserialize(raw).map_err(|e| invalid(e.to_string()))?;
            let Some(value) = point.sum else {
                debug!("Skipping histogram point without a sum for {}", metric.name);
                continue;
            };
            let attributes = flatten_attributes(&point.attributes).map_err(invalid)?;
            records.push(build_record(
                metric,
                context,
                value,
                attributes,
                point.start_time_unix_nano.as_ref(),
                point.time_unix_nano.as_ref(),
                received_at,
                raw,
            ));
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    metric: &Metric,
    context: &RecordContext,
    value: f64,
    attributes: Attributes,
    start_time: Option<&Int64>,
    time: Option<&Int64>,
    received_at: DateTime<Utc>,
    raw: &Value,
) -> MetricRecord {
    let timestamp = time
        .and_then(Int64::parse)
        .and_then(timestamp_from_nanos)
        .unwrap_or(received_at);
    let received_nanos = received_at
        .timestamp_nanos_opt()
        .map(|nanos| nanos.to_string())
        .unwrap_or_default();
    let time_unix_nano = time.map(Int64::raw).unwrap_or_else(|| received_nanos.clone());
    let start_time_unix_nano = start_time
        .map(Int64::raw)
        .unwrap_or_else(|| time_unix_nano.clone());

    let data_point = DataPoint {
        timestamp,
        value,
        kind: attribute_string(&attributes, "type"),
        model: attribute_string(&attributes, "model"),
    };

    MetricRecord {
        name: metric.name.clone(),
        data_point,
        attributes,
        context: RecordContext {
            start_time_unix_nano,
            time_unix_nano,
            ..context.clone()
        },
        raw: raw.clone(),
    }
}

// ============================================================================
// Logs
// ============================================================================

/// Flatten a logs envelope, keeping only records with a known `event.name`.
pub fn normalize_logs(
    envelope: &Value,
    received_at: DateTime<Utc>,
) -> Result<LogBatch, NormalizeError> {
    let envelope = LogsEnvelope::deserialize(envelope)
        .map_err(|e| NormalizeError::InvalidLogs(e.to_string()))?;

    let mut batch = LogBatch::default();
    for resource_logs in envelope.resource_logs {
        for scope_logs in resource_logs.scope_logs {
            for record in scope_logs.log_records {
                let attributes =
                    flatten_attributes(&record.attributes).map_err(NormalizeError::InvalidLogs)?;
                let event_name = attribute_string(&attributes, "event.name");

                let Some(event) = event_name.as_deref().and_then(LogEventKind::from_name) else {
                    warn!("Unknown event: {}", event_name.as_deref().unwrap_or("<missing>"));
                    batch.dropped += 1;
                    continue;
                };

                let timestamp = record
                    .time_unix_nano
                    .as_ref()
                    .or(record.observed_time_unix_nano.as_ref())
                    .and_then(Int64::parse)
                    .and_then(timestamp_from_nanos)
                    .unwrap_or(received_at);
                let body = record
                    .body
                    .as_ref()
                    .and_then(|body| body.string_value.clone())
                    .unwrap_or_default();

                batch.records.push(LogRecord {
                    event,
                    entry: LogEntry {
                        timestamp,
                        attributes,
                        body,
                    },
                });
            }
        }
    }

    Ok(batch)
}

// ============================================================================
// Helpers
// ============================================================================

fn flatten_attributes(attributes: &[KeyValue]) -> Result<Attributes, String> {
    let mut flattened = Attributes::new();
    for attribute in attributes {
        let Some(value) = attribute.value.as_ref() else {
            continue;
        };
        let scalar = if let Some(text) = &value.string_value {
            AttributeValue::String(text.clone())
        } else if let Some(int) = &value.int_value {
            let parsed = int.parse().ok_or_else(|| {
                format!("attribute '{}' has a non-integer intValue", attribute.key)
            })?;
            AttributeValue::Int(parsed)
        } else if let Some(double) = value.double_value {
            AttributeValue::Double(double)
        } else if let Some(flag) = value.bool_value {
            AttributeValue::Bool(flag)
        } else {
            continue;
        };
        flattened.insert(attribute.key.clone(), scalar);
    }
    Ok(flattened)
}

fn attribute_string(attributes: &Attributes, key: &str) -> Option<String> {
    attributes
        .get(key)
        .and_then(AttributeValue::as_str)
        .map(str::to_string)
}

/// OTLP uses 0 for "unset".
fn timestamp_from_nanos(nanos: i64) -> Option<DateTime<Utc>> {
    if nanos <= 0 {
        return None;
    }
    let secs = nanos.div_euclid(1_000_000_000);
    let subsec = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, subsec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0)
            .single()
            .expect("valid datetime")
    }

    #[test]
    fn sum_points_become_records_with_flat_attributes() {
        let envelope = json!({
            "resourceMetrics": [{
                "resource": {
                    "attributes": [
                        {"key": "service.name", "value": {"stringValue": "claude-code"}},
                        {"key": "service.version", "value": {"stringValue": "1.0.0"}}
                    ]
                },
                "scopeMetrics": [{
                    "scope": {"name": "com.anthropic.claude_code", "version": "1.0.0"},
                    "metrics": [{
                        "name": "claude_code.token.usage",
                        "unit": "tokens",
                        "sum": {
                            "dataPoints": [{
                                "attributes": [
                                    {"key": "session.id", "value": {"stringValue": "abc"}},
                                    {"key": "type", "value": {"stringValue": "input"}},
                                    {"key": "model", "value": {"stringValue": "sonnet"}},
                                    {"key": "attempt", "value": {"intValue": "2"}},
                                    {"key": "cached", "value": {"boolValue": true}}
                                ],
                                "timeUnixNano": "1760875200000000000",
                                "asInt": "150"
                            }]
                        }
                    }]
                }]
            }]
        });

        let records = normalize_metrics(&envelope, received_at()).expect("valid envelope");
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.name, "claude_code.token.usage");
        assert_eq!(record.data_point.value, 150.0);
        assert_eq!(record.data_point.kind.as_deref(), Some("input"));
        assert_eq!(record.data_point.model.as_deref(), Some("sonnet"));
        assert_eq!(record.session_id(), Some("abc"));
        assert_eq!(record.attributes.get("attempt"), Some(&AttributeValue::Int(2)));
        assert_eq!(record.attributes.get("cached"), Some(&AttributeValue::Bool(true)));
        assert_eq!(record.context.service_version.as_deref(), Some("1.0.0"));
        assert_eq!(record.context.scope_name.as_deref(), Some("com.anthropic.claude_code"));
        assert_eq!(record.context.time_unix_nano, "1760875200000000000");
        assert_eq!(record.context.start_time_unix_nano, "1760875200000000000");
        assert_eq!(record.data_point.timestamp.timestamp(), 1_760_875_200);
    }

    #[test]
    fn gauge_doubles_and_histogram_sums_are_extracted() {
        let envelope = json!({
            "resourceMetrics": [{
                "scopeMetrics": [{
                    "metrics": [
                        {"name": "claude_code.cost.usage", "gauge": {"dataPoints": [{"asDouble": 0.25}]}},
                        {"name": "claude_code.cost.usage", "histogram": {"dataPoints": [{"sum": 1.5, "count": "3"}]}}
                    ]
                }]
            }]
        });

        let records = normalize_metrics(&envelope, received_at()).expect("valid envelope");
        let values: Vec<f64> = records.iter().map(|r| r.data_point.value).collect();
        assert_eq!(values, vec![0.25, 1.5]);
        assert_eq!(records[0].context.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(records[0].data_point.timestamp, received_at());
    }

    #[test]
    fn counter_shape_wins_over_histogram_sum() {
        let envelope = json!({
            "resourceMetrics": [{
                "scopeMetrics": [{
                    "metrics": [{
                        "name": "claude_code.cost.usage",
                        "sum": {"dataPoints": [{"asDouble": 2.0}]},
                        "histogram": {"dataPoints": [{"sum": 9.0}]}
                    }]
                }]
            }]
        });

        let records = normalize_metrics(&envelope, received_at()).expect("valid envelope");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data_point.value, 2.0);
    }

    #[test]
    fn missing_resource_metrics_is_malformed() {
        let error = normalize_metrics(&json!({"foo": []}), received_at()).unwrap_err();
        assert!(matches!(error, NormalizeError::InvalidMetrics(_)));

        let error = normalize_metrics(&json!({"resourceMetrics": {}}), received_at()).unwrap_err();
        assert!(matches!(error, NormalizeError::InvalidMetrics(_)));
    }

    #[test]
    fn malformed_point_fails_the_whole_envelope() {
        let envelope = json!({
            "resourceMetrics": [{
                "scopeMetrics": [{
                    "metrics": [
                        {"name": "claude_code.cost.usage", "sum": {"dataPoints": [{"asDouble": 1.0}]}},
                        {"name": "claude_code.cost.usage", "sum": {"dataPoints": [{"asDouble": "lots"}]}}
                    ]
                }]
            }]
        });

        assert!(normalize_metrics(&envelope, received_at()).is_err());
    }

    #[test]
    fn unknown_metric_names_still_normalize() {
        let envelope = json!({
            "resourceMetrics": [{
                "scopeMetrics": [{
                    "metrics": [{"name": "custom.metric", "sum": {"dataPoints": [{"asInt": 3}]}}]
                }]
            }]
        });

        let records = normalize_metrics(&envelope, received_at()).expect("valid envelope");
        assert_eq!(records[0].name, "custom.metric");
        assert_eq!(records[0].data_point.value, 3.0);
    }

    #[test]
    fn logs_without_known_event_name_are_dropped() {
        let envelope = json!({
            "resourceLogs": [{
                "scopeLogs": [{
                    "logRecords": [
                        {
                            "timeUnixNano": "1760875200000000000",
                            "attributes": [
                                {"key": "event.name", "value": {"stringValue": "claude_code.user_prompt"}},
                                {"key": "prompt_length", "value": {"intValue": "42"}}
                            ],
                            "body": {"stringValue": "claude_code.user_prompt"}
                        },
                        {
                            "attributes": [{"key": "event.name", "value": {"stringValue": "claude_code.mystery"}}]
                        },
                        {"attributes": []}
                    ]
                }]
            }]
        });

        let batch = normalize_logs(&envelope, received_at()).expect("valid envelope");
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.dropped, 2);

        let record = &batch.records[0];
        assert_eq!(record.event, LogEventKind::UserPrompt);
        assert_eq!(record.entry.body, "claude_code.user_prompt");
        assert_eq!(
            record.entry.attributes.get("prompt_length"),
            Some(&AttributeValue::Int(42))
        );
    }

    #[test]
    fn logs_envelope_requires_resource_logs_array() {
        let error = normalize_logs(&json!({"resourceLogs": "nope"}), received_at()).unwrap_err();
        assert!(matches!(error, NormalizeError::InvalidLogs(_)));
    }
}
