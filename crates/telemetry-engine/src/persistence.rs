use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{MetricRow, TelemetryBackend};

pub const DEFAULT_PERSISTENCE_CAPACITY: usize = 4096;

/// Bounded hand-off of durable rows from the engine to the persistence worker.
///
/// `emit` never blocks: when the queue is full the row is dropped and counted.
pub struct PersistenceBus {
    tx: mpsc::Sender<MetricRow>,
    dropped: Arc<AtomicU64>,
}

impl PersistenceBus {
    /// Create the bus and the receiver to hand to [`PersistenceWorker::spawn`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MetricRow>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue a row for the worker, or drop it with a warning.
    pub fn emit(&self, row: MetricRow) {
        if let Err(error) = self.tx.try_send(row) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            match error {
                mpsc::error::TrySendError::Full(row) => warn!(
                    "Persistence queue full, dropped {} row ({} total)",
                    row.metric_name, dropped
                ),
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("Persistence worker gone, dropped row ({} total)", dropped)
                }
            }
        }
    }

    /// Rows dropped since startup, shared across clones.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Clone for PersistenceBus {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

/// Drains the bus into a backend. Insert failures are logged and skipped.
pub struct PersistenceWorker {
    backend: Arc<dyn TelemetryBackend>,
}

impl PersistenceWorker {
    pub fn new(backend: Arc<dyn TelemetryBackend>) -> Self {
        Self { backend }
    }

    /// Runs until every bus clone has been dropped.
    pub fn spawn(self, mut receiver: mpsc::Receiver<MetricRow>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("PersistenceWorker started");
            let mut written: u64 = 0;

            while let Some(row) = receiver.recv().await {
                match self.backend.insert_metric_row(&row).await {
                    Ok(()) => written += 1,
                    Err(error) => {
                        warn!("Failed to persist {} row: {}", row.metric_name, error);
                    }
                }
            }

            info!("PersistenceWorker stopped after {} rows", written);
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::tempdir;
    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::backend::SqliteBackend;

    fn row(value: f64) -> MetricRow {
        MetricRow {
            metric_name: "claude_code.cost.usage".to_string(),
            metric_value: value,
            metric_unit: Some("USD".to_string()),
            metric_description: None,
            start_time_unix_nano: "1".to_string(),
            time_unix_nano: "1".to_string(),
            time: Utc::now(),
            user_id: None,
            session_id: Some("abc".to_string()),
            organization_id: None,
            user_email: None,
            model: None,
            token_type: None,
            lines_type: None,
            decision_type: None,
            service_name: "claude-code".to_string(),
            service_version: None,
            scope_name: None,
            scope_version: None,
            raw_data_point: serde_json::json!({"asDouble": value}),
        }
    }

    #[tokio::test]
    async fn bus_delivers_rows() {
        let (bus, mut rx) = PersistenceBus::new(10);
        bus.emit(row(1.0));

        let received = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("should receive row")
            .expect("row should exist");
        assert_eq!(received.metric_value, 1.0);
        assert_eq!(bus.dropped_count(), 0);
    }

    #[tokio::test]
    async fn bus_drops_when_full() {
        let (bus, _rx) = PersistenceBus::new(1);
        bus.emit(row(1.0));
        bus.emit(row(2.0));

        assert_eq!(bus.dropped_count(), 1);
        assert_eq!(bus.clone().dropped_count(), 1);
    }

    #[tokio::test]
    async fn worker_writes_rows_until_bus_closes() {
        let dir = tempdir().expect("temp dir");
        let backend = Arc::new(SqliteBackend::new(dir.path().join("telemetry.db")));
        backend.init().await.expect("init backend");

        let (bus, rx) = PersistenceBus::new(10);
        let handle = PersistenceWorker::new(backend.clone()).spawn(rx);

        bus.emit(row(1.0));
        bus.emit(row(2.0));
        drop(bus);

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop")
            .expect("worker task");
        assert_eq!(backend.row_count().await.expect("count"), 2);
    }
}
