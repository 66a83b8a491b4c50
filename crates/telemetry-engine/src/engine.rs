use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::backend::{AggregateRow, MetricRow};
use crate::events::{EngineEvent, EngineSnapshot, JournalLimits, LogUpdate, SessionCountUpdate};
use crate::hub::{BroadcastHub, Subscription};
use crate::journal::{ActivityJournal, LogJournal};
use crate::normalizer::{normalize_logs, normalize_metrics, LogBatch, MetricRecord, NormalizeError};
use crate::persistence::{PersistenceBus, DEFAULT_PERSISTENCE_CAPACITY};
use crate::sessions::{SessionTracker, SweepOutcome, DEFAULT_SESSION_TIMEOUT_SECS};
use crate::store::AggregationStore;
use crate::types::{
    ActivityRecord, ActivityRequest, DataPoint, LogEntry, LogFilter, LogSummary, MetricSummary,
    ModelTokenBreakdown, SeriesFilter, SessionRecord, TokenTypeTotals, ACTIVITY_CAPACITY,
    LOG_CAPACITY, SERIES_CAPACITY,
};

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("telemetry engine is not running")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub series_capacity: usize,
    pub activity_capacity: usize,
    pub log_capacity: usize,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub persistence_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            series_capacity: SERIES_CAPACITY,
            activity_capacity: ACTIVITY_CAPACITY,
            log_capacity: LOG_CAPACITY,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS as u64),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            persistence_capacity: DEFAULT_PERSISTENCE_CAPACITY,
        }
    }
}

/// Outcome of one ingestion call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub dropped: usize,
}

/// All live state. Only the engine task holds it once spawned.
pub struct EngineState {
    store: AggregationStore,
    sessions: SessionTracker,
    activities: ActivityJournal,
    logs: LogJournal,
    hub: BroadcastHub,
    persistence: Option<PersistenceBus>,
    limits: JournalLimits,
}

impl EngineState {
    pub fn new(config: &EngineConfig) -> Self {
        let timeout = chrono::Duration::from_std(config.session_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_SESSION_TIMEOUT_SECS));

        Self {
            store: AggregationStore::new(config.series_capacity),
            sessions: SessionTracker::new(timeout),
            activities: ActivityJournal::new(config.activity_capacity),
            logs: LogJournal::new(config.log_capacity),
            hub: BroadcastHub::new(),
            persistence: None,
            limits: JournalLimits {
                series: config.series_capacity.max(1),
                activities: config.activity_capacity.max(1),
                logs: config.log_capacity.max(1),
            },
        }
    }

    /// Route a durable row for every accepted data point through `bus`.
    pub fn set_persistence(&mut self, bus: PersistenceBus) {
        self.persistence = Some(bus);
    }

    /// Apply a normalized metrics envelope.
    ///
    /// The activity (if any) is journaled first, then each record in envelope
    /// order: store update, session observation, durable row.
    pub fn apply_metrics(
        &mut self,
        records: Vec<MetricRecord>,
        activity: Option<ActivityRequest>,
        received_at: DateTime<Utc>,
    ) -> IngestReport {
        if let Some(request) = activity {
            let record = ActivityRecord {
                timestamp: received_at,
                request,
            };
            self.activities.record(record.clone());
            self.hub.publish(&EngineEvent::ActivityUpdate(record));
        }

        let mut report = IngestReport::default();
        for record in records {
            let Some(update) = self
                .store
                .record_metric(&record.name, record.data_point.clone())
            else {
                report.dropped += 1;
                continue;
            };
            self.hub.publish(&EngineEvent::MetricUpdate(update));

            if let Some(session_id) = record.session_id() {
                let observation = self.sessions.observe(session_id, received_at);
                self.hub
                    .publish(&EngineEvent::SessionCountUpdate(SessionCountUpdate {
                        timestamp: received_at,
                        value: observation.active_count,
                    }));
            }

            if let Some(bus) = &self.persistence {
                bus.emit(MetricRow::from_record(&record));
            }
            report.accepted += 1;
        }

        report
    }

    /// Journal each record and publish a `log-update` per entry.
    pub fn apply_logs(&mut self, batch: LogBatch) -> IngestReport {
        let mut report = IngestReport {
            accepted: 0,
            dropped: batch.dropped,
        };

        for record in batch.records {
            self.logs.append(record.event, record.entry.clone());
            self.hub.publish(&EngineEvent::LogUpdate(LogUpdate {
                event_name: record.event.as_str().to_string(),
                log_entry: record.entry,
            }));
            report.accepted += 1;
        }

        report
    }

    /// Evict stale sessions and publish the resulting count, changed or not.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepOutcome {
        let outcome = self.sessions.sweep(now);
        self.hub
            .publish(&EngineEvent::SessionCountUpdate(SessionCountUpdate {
                timestamp: now,
                value: outcome.active_count,
            }));
        outcome
    }

    /// Fold backend aggregates into the cumulative totals. Returns rows used.
    pub fn seed_cumulative(&mut self, rows: &[AggregateRow]) -> usize {
        let mut used = 0;
        for row in rows {
            if self.store.seed_cumulative(
                &row.metric_name,
                row.total,
                row.count,
                row.sub_type.as_deref(),
            ) {
                used += 1;
            }
        }
        used
    }

    /// Everything a new subscriber needs before its first incremental event.
    pub fn snapshot(&self) -> EngineSnapshot {
        let store = self.store.snapshot();
        EngineSnapshot {
            metrics: store.metrics,
            cumulative: store.cumulative,
            tokens_by_model: store.tokens_by_model,
            logs: self.logs.snapshot(),
            activities: self.activities.recent(self.activities.capacity()),
            active_session_count: self.sessions.active_count(),
            limits: self.limits,
        }
    }

    /// Attach a subscriber; its first message is the current snapshot.
    pub fn subscribe(&mut self) -> Subscription {
        let snapshot = self.snapshot();
        self.hub.attach(snapshot)
    }

    pub fn unsubscribe(&mut self, id: Uuid) -> bool {
        self.hub.detach(id)
    }

    pub fn store(&self) -> &AggregationStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    pub fn activities(&self) -> &ActivityJournal {
        &self.activities
    }

    pub fn logs(&self) -> &LogJournal {
        &self.logs
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }
}

type ReadFn = Box<dyn FnOnce(&EngineState) + Send>;

enum EngineCommand {
    IngestMetrics {
        records: Vec<MetricRecord>,
        activity: Option<ActivityRequest>,
        received_at: DateTime<Utc>,
        reply: oneshot::Sender<IngestReport>,
    },
    IngestLogs {
        batch: LogBatch,
        reply: oneshot::Sender<IngestReport>,
    },
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Sweep {
        reply: oneshot::Sender<SweepOutcome>,
    },
    Read(ReadFn),
}

/// Builder for the engine task.
pub struct Engine {
    state: EngineState,
    sweep_interval: Duration,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            state: EngineState::new(&config),
            sweep_interval: config.sweep_interval,
        }
    }

    pub fn with_persistence(mut self, bus: PersistenceBus) -> Self {
        self.state.set_persistence(bus);
        self
    }

    /// Seed running totals before the task starts. Returns rows used.
    pub fn seed_cumulative(&mut self, rows: &[AggregateRow]) -> usize {
        self.state.seed_cumulative(rows)
    }

    /// Move the state into its own task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> EngineHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(self.state, rx, self.sweep_interval));
        EngineHandle { tx }
    }
}

async fn run(
    mut state: EngineState,
    mut rx: mpsc::UnboundedReceiver<EngineCommand>,
    sweep_interval: Duration,
) {
    let period = sweep_interval.max(Duration::from_millis(1));
    let mut sweeper = interval_at(Instant::now() + period, period);
    sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Telemetry engine started");

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => handle_command(&mut state, command),
                None => break,
            },
            _ = sweeper.tick() => {
                let outcome = state.sweep(Utc::now());
                debug!(
                    "Session sweep evicted {}, {} active",
                    outcome.evicted.len(),
                    outcome.active_count
                );
            }
        }
    }

    info!("Telemetry engine stopped");
}

fn handle_command(state: &mut EngineState, command: EngineCommand) {
    // A dropped reply receiver means the caller went away; nothing to do.
    match command {
        EngineCommand::IngestMetrics {
            records,
            activity,
            received_at,
            reply,
        } => {
            let _ = reply.send(state.apply_metrics(records, activity, received_at));
        }
        EngineCommand::IngestLogs { batch, reply } => {
            let _ = reply.send(state.apply_logs(batch));
        }
        EngineCommand::Subscribe { reply } => {
            let subscription = state.subscribe();
            if let Err(subscription) = reply.send(subscription) {
                state.unsubscribe(subscription.id);
            }
        }
        EngineCommand::Unsubscribe { id, reply } => {
            let _ = reply.send(state.unsubscribe(id));
        }
        EngineCommand::Sweep { reply } => {
            let _ = reply.send(state.sweep(Utc::now()));
        }
        EngineCommand::Read(read) => read(state),
    }
}

/// Cloneable front door to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| EngineError::Closed)?;
        response.await.map_err(|_| EngineError::Closed)
    }

    /// Run `read` against the live state inside the engine task.
    pub async fn read<T, F>(&self, read: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&EngineState) -> T + Send + 'static,
    {
        self.request(|reply| {
            EngineCommand::Read(Box::new(move |state: &EngineState| {
                let _ = reply.send(read(state));
            }))
        })
        .await
    }

    /// Normalize and apply a metrics envelope. A malformed envelope changes nothing.
    pub async fn ingest_metrics(
        &self,
        envelope: &Value,
        activity: Option<ActivityRequest>,
    ) -> Result<IngestReport, EngineError> {
        let received_at = Utc::now();
        let records = normalize_metrics(envelope, received_at)?;
        self.request(|reply| EngineCommand::IngestMetrics {
            records,
            activity,
            received_at,
            reply,
        })
        .await
    }

    /// Normalize and apply a logs envelope. Unknown events count as dropped.
    pub async fn ingest_logs(&self, envelope: &Value) -> Result<IngestReport, EngineError> {
        let batch = normalize_logs(envelope, Utc::now())?;
        self.request(|reply| EngineCommand::IngestLogs { batch, reply })
            .await
    }

    /// See [`EngineState::subscribe`].
    pub async fn subscribe(&self) -> Result<Subscription, EngineError> {
        self.request(|reply| EngineCommand::Subscribe { reply }).await
    }

    pub async fn unsubscribe(&self, id: Uuid) -> Result<bool, EngineError> {
        self.request(|reply| EngineCommand::Unsubscribe { id, reply })
            .await
    }

    /// Run a sweep now, in addition to the periodic one.
    pub async fn sweep(&self) -> Result<SweepOutcome, EngineError> {
        self.request(|reply| EngineCommand::Sweep { reply }).await
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        self.read(EngineState::snapshot).await
    }

    /// Live series per metric name, filtered by name and time.
    pub async fn series(
        &self,
        filter: SeriesFilter,
    ) -> Result<BTreeMap<String, Vec<DataPoint>>, EngineError> {
        self.read(move |state| state.store().series(&filter)).await
    }

    pub async fn summary(&self) -> Result<BTreeMap<String, MetricSummary>, EngineError> {
        self.read(|state| state.store().summary()).await
    }

    /// Up to `limit` ingestion requests, newest first.
    pub async fn activities(&self, limit: usize) -> Result<Vec<ActivityRecord>, EngineError> {
        self.read(move |state| state.activities().recent(limit))
            .await
    }

    pub async fn logs(
        &self,
        filter: LogFilter,
    ) -> Result<BTreeMap<String, Vec<LogEntry>>, EngineError> {
        self.read(move |state| state.logs().entries(&filter)).await
    }

    pub async fn log_summary(&self) -> Result<BTreeMap<String, LogSummary>, EngineError> {
        self.read(|state| state.logs().summary()).await
    }

    /// Active sessions, most recently seen first.
    pub async fn sessions(&self) -> Result<Vec<SessionRecord>, EngineError> {
        self.read(|state| state.sessions().registry()).await
    }

    pub async fn is_session_active(&self, session_id: &str) -> Result<bool, EngineError> {
        let session_id = session_id.to_string();
        self.read(move |state| state.sessions().is_active(&session_id))
            .await
    }

    pub async fn model_tokens(&self) -> Result<ModelTokenBreakdown, EngineError> {
        self.read(|state| state.store().model_tokens()).await
    }

    pub async fn token_types(&self) -> Result<TokenTypeTotals, EngineError> {
        self.read(|state| state.store().token_types()).await
    }

    pub async fn subscriber_count(&self) -> Result<usize, EngineError> {
        self.read(EngineState::subscriber_count).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::types::MetricKind;

    fn metrics_envelope(metrics: Value) -> Value {
        json!({
            "resourceMetrics": [{
                "resource": {
                    "attributes": [
                        {"key": "service.name", "value": {"stringValue": "claude-code"}}
                    ]
                },
                "scopeMetrics": [{
                    "scope": {"name": "com.anthropic.claude_code", "version": "1.0.0"},
                    "metrics": metrics
                }]
            }]
        })
    }

    fn sum_metric(name: &str, value: f64, session: &str, extra: Value) -> Value {
        let mut attributes = vec![json!({"key": "session.id", "value": {"stringValue": session}})];
        if let Value::Object(map) = extra {
            for (key, value) in map {
                attributes.push(json!({"key": key, "value": {"stringValue": value}}));
            }
        }
        json!({
            "name": name,
            "sum": {"dataPoints": [{"asDouble": value, "attributes": attributes}]}
        })
    }

    fn log_envelope(event: &str, body: &str) -> Value {
        json!({
            "resourceLogs": [{
                "scopeLogs": [{
                    "logRecords": [{
                        "timeUnixNano": "1760000000000000000",
                        "attributes": [
                            {"key": "event.name", "value": {"stringValue": event}}
                        ],
                        "body": {"stringValue": body}
                    }]
                }]
            }]
        })
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0)
            .single()
            .expect("valid datetime")
            + ChronoDuration::seconds(seconds)
    }

    #[tokio::test]
    async fn cost_envelope_updates_cumulative() {
        let handle = Engine::new(EngineConfig::default()).spawn();
        let envelope = metrics_envelope(json!([
            sum_metric("claude_code.cost.usage", 1.00, "abc", json!({})),
            sum_metric("claude_code.cost.usage", 2.50, "abc", json!({})),
            sum_metric("claude_code.cost.usage", 0.50, "abc", json!({})),
        ]));

        let report = handle
            .ingest_metrics(&envelope, Some(ActivityRequest::default()))
            .await
            .expect("ingest");
        assert_eq!(report, IngestReport { accepted: 3, dropped: 0 });

        let summary = handle.summary().await.expect("summary");
        let cumulative = summary["claude_code.cost.usage"]
            .cumulative
            .clone()
            .expect("cumulative");
        assert!((cumulative.total() - 4.0).abs() < 1e-9);
        assert_eq!(cumulative.count(), 3);
        assert_eq!(format!("{:.2}", cumulative.average()), "1.33");

        assert_eq!(handle.activities(50).await.expect("activities").len(), 1);
        assert!(handle.is_session_active("abc").await.expect("active"));
    }

    #[tokio::test]
    async fn unknown_metric_is_skipped_alongside_known_one() {
        let handle = Engine::new(EngineConfig::default()).spawn();
        let envelope = metrics_envelope(json!([
            sum_metric("claude_code.mystery", 9.0, "ghost", json!({})),
            sum_metric("claude_code.cost.usage", 1.0, "abc", json!({})),
        ]));

        let report = handle.ingest_metrics(&envelope, None).await.expect("ingest");
        assert_eq!(report, IngestReport { accepted: 1, dropped: 1 });

        let snapshot = handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.metrics["claude_code.cost.usage"].len(), 1);
        assert!(!snapshot.metrics.contains_key("claude_code.mystery"));
        assert!(!handle.is_session_active("ghost").await.expect("active"));
    }

    #[tokio::test]
    async fn malformed_envelope_changes_nothing() {
        let handle = Engine::new(EngineConfig::default()).spawn();

        let result = handle
            .ingest_metrics(&json!({"resourceMetrics": "nope"}), Some(ActivityRequest::default()))
            .await;
        assert!(matches!(result, Err(EngineError::Normalize(_))));

        let result = handle.ingest_logs(&json!({})).await;
        assert!(matches!(result, Err(EngineError::Normalize(_))));

        assert!(handle.activities(50).await.expect("activities").is_empty());
    }

    #[tokio::test]
    async fn replaying_events_over_the_init_snapshot_matches_a_fresh_snapshot() {
        let config = EngineConfig {
            series_capacity: 3,
            activity_capacity: 2,
            log_capacity: 2,
            ..EngineConfig::default()
        };
        let handle = Engine::new(config).spawn();

        handle
            .ingest_metrics(
                &metrics_envelope(json!([sum_metric(
                    "claude_code.token.usage",
                    10.0,
                    "early",
                    json!({"type": "input", "model": "opus"})
                )])),
                Some(ActivityRequest::default()),
            )
            .await
            .expect("ingest");

        let mut subscription = handle.subscribe().await.expect("subscribe");

        for i in 0..5i32 {
            let (model, lines_type) = if i % 2 == 0 {
                ("opus", "added")
            } else {
                ("haiku", "removed")
            };
            let envelope = metrics_envelope(json!([
                sum_metric(
                    "claude_code.token.usage",
                    100.0 + f64::from(i),
                    "abc",
                    json!({"type": "output", "model": model})
                ),
                sum_metric(
                    "claude_code.lines_of_code.count",
                    f64::from(i),
                    "def",
                    json!({"type": lines_type})
                ),
            ]));
            handle
                .ingest_metrics(&envelope, Some(ActivityRequest::default()))
                .await
                .expect("ingest");
            handle
                .ingest_logs(&log_envelope("claude_code.user_prompt", &i.to_string()))
                .await
                .expect("ingest logs");
        }
        handle.sweep().await.expect("sweep");

        let fresh = handle.snapshot().await.expect("snapshot");

        let mut replayed = match timeout(Duration::from_secs(1), subscription.receiver.recv())
            .await
            .expect("init in time")
            .expect("init")
        {
            EngineEvent::Init(snapshot) => *snapshot,
            other => panic!("expected metrics-init, got {}", other.name()),
        };
        while let Ok(event) = subscription.receiver.try_recv() {
            replayed.apply(&event);
        }

        assert_eq!(replayed, fresh);
        assert_eq!(fresh.metrics["claude_code.token.usage"].len(), 3);
        assert_eq!(fresh.activities.len(), 2);
        assert_eq!(fresh.logs["claude_code.user_prompt"].len(), 2);
        assert_eq!(fresh.active_session_count, 3);
    }

    #[tokio::test]
    async fn timed_out_session_publishes_count_update() {
        let mut state = EngineState::new(&EngineConfig::default());
        let envelope = metrics_envelope(json!([sum_metric(
            "claude_code.cost.usage",
            0.1,
            "abc",
            json!({})
        )]));
        let records = normalize_metrics(&envelope, at(0)).expect("normalize");
        state.apply_metrics(records, None, at(0));
        assert_eq!(state.sessions().active_count(), 1);

        let mut subscription = state.subscribe();
        let outcome = state.sweep(at(700));
        assert_eq!(outcome.evicted, vec!["abc".to_string()]);

        let init = subscription.receiver.try_recv().expect("init");
        assert_eq!(init.name(), "metrics-init");
        match subscription.receiver.try_recv().expect("count update") {
            EngineEvent::SessionCountUpdate(update) => {
                assert_eq!(update.value, 0);
                assert_eq!(update.timestamp, at(700));
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[tokio::test]
    async fn each_observation_publishes_a_session_count() {
        let mut state = EngineState::new(&EngineConfig::default());
        let mut subscription = state.subscribe();
        let _ = subscription.receiver.try_recv();

        let envelope = metrics_envelope(json!([
            sum_metric("claude_code.cost.usage", 0.1, "abc", json!({})),
            sum_metric("claude_code.cost.usage", 0.2, "abc", json!({})),
        ]));
        let records = normalize_metrics(&envelope, at(0)).expect("normalize");
        state.apply_metrics(records, None, at(0));

        let mut names = Vec::new();
        while let Ok(event) = subscription.receiver.try_recv() {
            names.push(event.name());
        }
        assert_eq!(
            names,
            vec![
                "metric-update",
                "session-count-update",
                "metric-update",
                "session-count-update"
            ]
        );
    }

    #[tokio::test]
    async fn seeding_feeds_cumulative_totals() {
        let mut engine = Engine::new(EngineConfig::default());
        let rows = vec![
            AggregateRow {
                metric_name: MetricKind::CostUsage.as_str().to_string(),
                key: None,
                sub_type: None,
                total: 12.5,
                count: 5,
            },
            AggregateRow {
                metric_name: MetricKind::SessionCount.as_str().to_string(),
                key: None,
                sub_type: None,
                total: 3.0,
                count: 3,
            },
        ];
        assert_eq!(engine.seed_cumulative(&rows), 1);

        let handle = engine.spawn();
        let summary = handle.summary().await.expect("summary");
        let cost = summary["claude_code.cost.usage"]
            .cumulative
            .clone()
            .expect("cumulative");
        assert_eq!(cost.total(), 12.5);
        assert_eq!(cost.count(), 5);
        assert_eq!(summary["claude_code.cost.usage"].count, 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_through_the_handle() {
        let handle = Engine::new(EngineConfig::default()).spawn();
        let subscription = handle.subscribe().await.expect("subscribe");
        assert_eq!(handle.subscriber_count().await.expect("count"), 1);

        assert!(handle.unsubscribe(subscription.id).await.expect("detach"));
        assert!(!handle.unsubscribe(subscription.id).await.expect("detach"));
        assert_eq!(handle.subscriber_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn large_envelope_reaches_an_undrained_subscriber_in_full() {
        let mut state = EngineState::new(&EngineConfig::default());
        let mut subscription = state.subscribe();

        let sessions = ["abc", "def", "ghi"];
        let data_points: Vec<Value> = (0..200)
            .map(|i| {
                json!({
                    "asDouble": 0.01,
                    "attributes": [
                        {"key": "session.id", "value": {"stringValue": sessions[i % 3]}}
                    ]
                })
            })
            .collect();
        let envelope = metrics_envelope(json!([{
            "name": "claude_code.cost.usage",
            "sum": {"dataPoints": data_points}
        }]));
        let records = normalize_metrics(&envelope, at(0)).expect("normalize");
        let report = state.apply_metrics(records, Some(ActivityRequest::default()), at(0));
        assert_eq!(report, IngestReport { accepted: 200, dropped: 0 });
        assert_eq!(state.subscriber_count(), 1);

        let init = subscription.receiver.try_recv().expect("init");
        assert_eq!(init.name(), "metrics-init");
        let mut delivered = 0;
        let mut last_count = None;
        while let Ok(event) = subscription.receiver.try_recv() {
            if let EngineEvent::SessionCountUpdate(update) = &event {
                last_count = Some(update.value);
            }
            delivered += 1;
        }
        assert_eq!(delivered, 401);
        assert_eq!(last_count, Some(3));
    }

    #[tokio::test]
    async fn sweep_timer_evicts_idle_sessions_unprompted() {
        let config = EngineConfig {
            session_timeout: Duration::ZERO,
            sweep_interval: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let handle = Engine::new(config).spawn();
        let mut subscription = handle.subscribe().await.expect("subscribe");

        let envelope = metrics_envelope(json!([sum_metric(
            "claude_code.cost.usage",
            0.3,
            "abc",
            json!({})
        )]));
        handle.ingest_metrics(&envelope, None).await.expect("ingest");

        let evicted = timeout(Duration::from_secs(2), async {
            let mut seen_active = false;
            while let Some(event) = subscription.receiver.recv().await {
                if let EngineEvent::SessionCountUpdate(update) = event {
                    if update.value > 0 {
                        seen_active = true;
                    } else if seen_active {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .expect("sweep tick within two seconds");

        assert!(evicted);
        assert!(!handle.is_session_active("abc").await.expect("active"));
    }
}
