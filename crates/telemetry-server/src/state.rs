use std::sync::Arc;

use telemetry_engine::{EngineHandle, PersistenceBus, TelemetryBackend};

/// Shared across actix workers through `web::Data`.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub backend: Arc<dyn TelemetryBackend>,
    /// Read-only here; used for the dropped-row counter.
    pub persistence: PersistenceBus,
}

impl AppState {
    pub fn new(
        engine: EngineHandle,
        backend: Arc<dyn TelemetryBackend>,
        persistence: PersistenceBus,
    ) -> Self {
        Self {
            engine,
            backend,
            persistence,
        }
    }
}
