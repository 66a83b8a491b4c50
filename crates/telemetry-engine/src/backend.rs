use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalizer::MetricRecord;
use crate::types::MetricKind;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("time parse error: {0}")]
    Chrono(#[from] chrono::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task join error: {0}")]
    Task(String),

    #[error("invalid telemetry data: {0}")]
    InvalidData(String),
}

/// One persisted data point with the resource and scope it arrived under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub metric_name: String,
    pub metric_value: f64,
    pub metric_unit: Option<String>,
    pub metric_description: Option<String>,
    pub start_time_unix_nano: String,
    pub time_unix_nano: String,
    pub time: DateTime<Utc>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub organization_id: Option<String>,
    pub user_email: Option<String>,
    pub model: Option<String>,
    pub token_type: Option<String>,
    pub lines_type: Option<String>,
    pub decision_type: Option<String>,
    pub service_name: String,
    pub service_version: Option<String>,
    pub scope_name: Option<String>,
    pub scope_version: Option<String>,
    pub raw_data_point: serde_json::Value,
}

impl MetricRow {
    pub fn from_record(record: &MetricRecord) -> Self {
        let text = |key: &str| record.attributes.get(key).map(|value| value.to_text());
        let typed_for = |kind: MetricKind| {
            if record.name == kind.as_str() {
                text("type")
            } else {
                None
            }
        };

        Self {
            metric_name: record.name.clone(),
            metric_value: record.data_point.value,
            metric_unit: record.context.unit.clone(),
            metric_description: record.context.description.clone(),
            start_time_unix_nano: record.context.start_time_unix_nano.clone(),
            time_unix_nano: record.context.time_unix_nano.clone(),
            time: record.data_point.timestamp,
            user_id: text("user.id"),
            session_id: text("session.id"),
            organization_id: text("organization.id"),
            user_email: text("user.email"),
            model: text("model"),
            token_type: typed_for(MetricKind::TokenUsage),
            lines_type: typed_for(MetricKind::LinesOfCode),
            decision_type: text("decision"),
            service_name: record.context.service_name.clone(),
            service_version: record.context.service_version.clone(),
            scope_name: record.context.scope_name.clone(),
            scope_version: record.context.scope_version.clone(),
            raw_data_point: record.raw.clone(),
        }
    }
}

/// Half-open `[start, end)` window over row time. Missing bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    /// One row per metric name.
    Metric,
    /// Per metric, local calendar day and lines type.
    Day,
    /// Per metric and model.
    Model,
    /// Per metric and token type.
    TokenType,
    /// Per metric and lines type.
    LinesType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateQuery {
    pub metric_names: Vec<String>,
    pub range: TimeRange,
    pub group_by: GroupBy,
    /// Minutes to add to UTC to get the caller's local time; only used by `GroupBy::Day`.
    pub utc_offset_minutes: i32,
}

impl AggregateQuery {
    pub fn new(metric_names: &[MetricKind], range: TimeRange, group_by: GroupBy) -> Self {
        Self {
            metric_names: metric_names
                .iter()
                .map(|kind| kind.as_str().to_string())
                .collect(),
            range,
            group_by,
            utc_offset_minutes: 0,
        }
    }

    pub fn with_utc_offset(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }
}

/// `key` is the day (`YYYY-MM-DD`), model or token type depending on the
/// grouping; `sub_type` is the lines type for `Day` and `LinesType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub metric_name: String,
    pub key: Option<String>,
    pub sub_type: Option<String>,
    pub total: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub metric_name: String,
    pub value: f64,
    pub time: DateTime<Utc>,
    pub token_type: Option<String>,
    pub lines_type: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHistory {
    pub session_id: String,
    pub user_email: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub models_used: Vec<String>,
}

#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    /// Create the schema if missing. Safe to call on every start.
    async fn init(&self) -> BackendResult<()>;

    /// Store one data point. Called only by the persistence worker.
    async fn insert_metric_row(&self, row: &MetricRow) -> BackendResult<()>;

    /// Sum and count per metric over `query.range`, split by `query.group_by`.
    async fn query_aggregate(&self, query: &AggregateQuery) -> BackendResult<Vec<AggregateRow>>;

    /// Raw points for the named metrics, oldest first.
    async fn query_points(
        &self,
        metric_names: &[String],
        range: TimeRange,
    ) -> BackendResult<Vec<MetricPoint>>;

    /// Sessions seen in stored rows, most recently updated first.
    async fn recent_sessions(&self, limit: usize) -> BackendResult<Vec<SessionHistory>>;

    /// Every stored point of one session, oldest first.
    async fn session_points(&self, session_id: &str) -> BackendResult<Vec<MetricPoint>>;

    async fn row_count(&self) -> BackendResult<u64>;
}

#[derive(Debug, Clone)]
pub struct SqliteBackend {
    db_path: PathBuf,
}

impl SqliteBackend {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    async fn with_connection<T, F>(&self, func: F) -> BackendResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> BackendResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let connection = open_connection(&db_path)?;
            func(&connection)
        })
        .await
        .map_err(|error| BackendError::Task(error.to_string()))?
    }
}

#[async_trait]
impl TelemetryBackend for SqliteBackend {
    async fn init(&self) -> BackendResult<()> {
        self.with_connection(|connection| {
            connection.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS metrics (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    metric_name TEXT NOT NULL,
                    metric_value REAL NOT NULL,
                    metric_unit TEXT,
                    metric_description TEXT,
                    start_time_unix_nano TEXT NOT NULL,
                    time_unix_nano TEXT NOT NULL,
                    time TEXT NOT NULL,
                    user_id TEXT,
                    session_id TEXT,
                    organization_id TEXT,
                    user_email TEXT,
                    model TEXT,
                    token_type TEXT,
                    lines_type TEXT,
                    decision_type TEXT,
                    service_name TEXT NOT NULL,
                    service_version TEXT,
                    scope_name TEXT,
                    scope_version TEXT,
                    raw_data_point TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_metrics_name_time ON metrics(metric_name, time);
                CREATE INDEX IF NOT EXISTS idx_metrics_session ON metrics(session_id, time);
                CREATE INDEX IF NOT EXISTS idx_metrics_time ON metrics(time);
                "#,
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_metric_row(&self, row: &MetricRow) -> BackendResult<()> {
        let row = row.clone();
        let raw = serde_json::to_string(&row.raw_data_point)
            .map_err(|error| BackendError::InvalidData(error.to_string()))?;

        self.with_connection(move |connection| {
            connection.execute(
                r#"
                INSERT INTO metrics (
                    metric_name, metric_value, metric_unit, metric_description,
                    start_time_unix_nano, time_unix_nano, time,
                    user_id, session_id, organization_id, user_email,
                    model, token_type, lines_type, decision_type,
                    service_name, service_version, scope_name, scope_version,
                    raw_data_point, created_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                    ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21
                )
                "#,
                params![
                    row.metric_name,
                    row.metric_value,
                    row.metric_unit,
                    row.metric_description,
                    row.start_time_unix_nano,
                    row.time_unix_nano,
                    format_timestamp(row.time),
                    row.user_id,
                    row.session_id,
                    row.organization_id,
                    row.user_email,
                    row.model,
                    row.token_type,
                    row.lines_type,
                    row.decision_type,
                    row.service_name,
                    row.service_version,
                    row.scope_name,
                    row.scope_version,
                    raw,
                    format_timestamp(Utc::now()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn query_aggregate(&self, query: &AggregateQuery) -> BackendResult<Vec<AggregateRow>> {
        let query = query.clone();

        self.with_connection(move |connection| {
            let mut values: Vec<SqlValue> = Vec::new();

            let (key_expr, sub_expr) = match query.group_by {
                GroupBy::Metric => ("NULL".to_string(), "NULL"),
                GroupBy::Day => {
                    values.push(SqlValue::Text(format!(
                        "{:+} minutes",
                        query.utc_offset_minutes
                    )));
                    (format!("date(time, ?{})", values.len()), "lines_type")
                }
                GroupBy::Model => ("model".to_string(), "NULL"),
                GroupBy::TokenType => ("token_type".to_string(), "NULL"),
                GroupBy::LinesType => ("NULL".to_string(), "lines_type"),
            };

            let where_clause = build_where_clause(&query.metric_names, query.range, &mut values);
            let sql = format!(
                r#"
                SELECT metric_name, {key_expr} AS group_key, {sub_expr} AS sub_type,
                       COALESCE(SUM(metric_value), 0), COUNT(*)
                FROM metrics
                {where_clause}
                GROUP BY metric_name, group_key, sub_type
                ORDER BY metric_name ASC, group_key ASC, sub_type ASC
                "#
            );

            let mut stmt = connection.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                Ok(AggregateRow {
                    metric_name: row.get(0)?,
                    key: row.get(1)?,
                    sub_type: row.get(2)?,
                    total: row.get(3)?,
                    count: row.get::<_, i64>(4)? as u64,
                })
            })?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
        .await
    }

    async fn query_points(
        &self,
        metric_names: &[String],
        range: TimeRange,
    ) -> BackendResult<Vec<MetricPoint>> {
        let metric_names = metric_names.to_vec();

        self.with_connection(move |connection| {
            let mut values = Vec::new();
            let where_clause = build_where_clause(&metric_names, range, &mut values);
            let sql = format!(
                r#"
                SELECT metric_name, metric_value, time, token_type, lines_type, model
                FROM metrics
                {where_clause}
                ORDER BY time ASC, id ASC
                "#
            );

            let mut stmt = connection.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values.iter()))?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                result.push(read_point(row)?);
            }
            Ok(result)
        })
        .await
    }

    async fn recent_sessions(&self, limit: usize) -> BackendResult<Vec<SessionHistory>> {
        self.with_connection(move |connection| {
            let mut stmt = connection.prepare(
                r#"
                SELECT
                    session_id,
                    MAX(user_email),
                    MAX(time) AS last_updated,
                    GROUP_CONCAT(DISTINCT model)
                FROM metrics
                WHERE session_id IS NOT NULL
                GROUP BY session_id
                ORDER BY last_updated DESC
                LIMIT ?1
                "#,
            )?;

            let mut rows = stmt.query(params![limit as i64])?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                let mut models_used: Vec<String> = row
                    .get::<_, Option<String>>(3)?
                    .map(|joined| joined.split(',').map(str::to_string).collect())
                    .unwrap_or_default();
                models_used.sort();

                result.push(SessionHistory {
                    session_id: row.get(0)?,
                    user_email: row.get(1)?,
                    last_updated: parse_timestamp(row.get::<_, String>(2)?)?,
                    models_used,
                });
            }
            Ok(result)
        })
        .await
    }

    async fn session_points(&self, session_id: &str) -> BackendResult<Vec<MetricPoint>> {
        let session_id = session_id.to_string();

        self.with_connection(move |connection| {
            let mut stmt = connection.prepare(
                r#"
                SELECT metric_name, metric_value, time, token_type, lines_type, model
                FROM metrics
                WHERE session_id = ?1
                ORDER BY time ASC, id ASC
                "#,
            )?;

            let mut rows = stmt.query(params![session_id])?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                result.push(read_point(row)?);
            }
            Ok(result)
        })
        .await
    }

    async fn row_count(&self) -> BackendResult<u64> {
        self.with_connection(|connection| {
            let count: i64 =
                connection.query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }
}

fn open_connection(path: &Path) -> BackendResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let connection = Connection::open(path)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(connection)
}

/// Fixed-width UTC text so lexicographic order matches time order.
fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: String) -> BackendResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc))
}

fn build_where_clause(
    metric_names: &[String],
    range: TimeRange,
    values: &mut Vec<SqlValue>,
) -> String {
    let mut clauses = Vec::new();

    if !metric_names.is_empty() {
        let placeholders: Vec<String> = metric_names
            .iter()
            .map(|name| {
                values.push(SqlValue::Text(name.clone()));
                format!("?{}", values.len())
            })
            .collect();
        clauses.push(format!("metric_name IN ({})", placeholders.join(", ")));
    }

    if let Some(start) = range.start {
        values.push(SqlValue::Text(format_timestamp(start)));
        clauses.push(format!("time >= ?{}", values.len()));
    }

    if let Some(end) = range.end {
        values.push(SqlValue::Text(format_timestamp(end)));
        clauses.push(format!("time < ?{}", values.len()));
    }

    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

fn read_point(row: &Row<'_>) -> BackendResult<MetricPoint> {
    Ok(MetricPoint {
        metric_name: row.get(0)?,
        value: row.get(1)?,
        time: parse_timestamp(row.get::<_, String>(2)?)?,
        token_type: row.get(3)?,
        lines_type: row.get(4)?,
        model: row.get(5)?,
    })
}
