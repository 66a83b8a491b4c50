pub mod backend;
pub mod engine;
pub mod events;
pub mod hub;
pub mod journal;
pub mod normalizer;
pub mod persistence;
pub mod ring;
pub mod rollup;
pub mod sessions;
pub mod store;
pub mod types;

pub use backend::{
    AggregateQuery, AggregateRow, BackendError, BackendResult, GroupBy, MetricPoint, MetricRow,
    SessionHistory, SqliteBackend, TelemetryBackend, TimeRange,
};
pub use engine::{Engine, EngineConfig, EngineError, EngineHandle, EngineState, IngestReport};
pub use events::{
    EngineEvent, EngineSnapshot, JournalLimits, LogUpdate, MetricUpdate, ModelTokenUpdate,
    SessionCountUpdate,
};
pub use hub::{BroadcastHub, Subscription};
pub use normalizer::{normalize_logs, normalize_metrics, LogBatch, MetricRecord, NormalizeError};
pub use persistence::{PersistenceBus, PersistenceWorker};
pub use rollup::{HistoricalSeries, LocalClock, Period, RecentChartData, SessionMetrics, SessionTotals};
pub use sessions::{SessionTracker, SweepOutcome};
pub use store::AggregationStore;
pub use types::{
    ActivityRecord, ActivityRequest, AttributeValue, Attributes, CumulativeAggregate, DataPoint,
    LogEntry, LogEventKind, LogFilter, LogSummary, MetricKind, MetricSummary, ModelShare,
    ModelTokenBreakdown, SeriesFilter, SessionRecord, TokenTypeTotals,
};
