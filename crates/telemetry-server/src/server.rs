use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use telemetry_engine::{
    AggregateQuery, Engine, GroupBy, MetricKind, PersistenceBus, PersistenceWorker,
    SqliteBackend, TelemetryBackend,
};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::handlers::{
    activities, health, history, ingest, logs, metrics, server_clock, sessions, stream,
};
use crate::middleware::TracingMiddleware;
use crate::state::AppState;

/// OTLP exporters batch aggressively; the actix default of 256 KiB is too small.
const MAX_ENVELOPE_BYTES: usize = 10 * 1024 * 1024;

pub fn app_config(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_ENVELOPE_BYTES))
        .app_data(
            web::QueryConfig::default()
                .error_handler(|err, _req| AppError::BadRequest(err.to_string()).into()),
        )
        .route("/health", web::get().to(health::health_check))
        .service(
            web::scope("/v1")
                .route("/metrics", web::post().to(ingest::ingest_metrics))
                .route("/logs", web::post().to(ingest::ingest_logs)),
        )
        .service(
            web::scope("/api")
                .route("/stream", web::get().to(stream::stream_events))
                .route("/metrics", web::get().to(metrics::get_series))
                .route("/metrics/summary", web::get().to(metrics::get_summary))
                .route("/metrics/model-tokens", web::get().to(metrics::get_model_tokens))
                .route("/metrics/token-details", web::get().to(metrics::get_token_details))
                .route(
                    "/metrics/recent-chart-data",
                    web::get().to(history::get_recent_chart_data),
                )
                .route("/metrics/historical", web::get().to(history::get_historical))
                .route(
                    "/metrics/historical-token-details",
                    web::get().to(history::get_historical_token_details),
                )
                .route(
                    "/metrics/historical-model-tokens",
                    web::get().to(history::get_historical_model_tokens),
                )
                .route(
                    "/metrics/session/{session_id}",
                    web::get().to(history::get_session_detail),
                )
                .route("/activities", web::get().to(activities::get_activities))
                .route("/logs", web::get().to(logs::get_logs))
                .route("/logs/summary", web::get().to(logs::get_log_summary))
                .route("/sessions", web::get().to(sessions::get_sessions)),
        );
}

/// Open the database, start the persistence worker and the engine task.
pub async fn build_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let backend: Arc<dyn TelemetryBackend> = Arc::new(SqliteBackend::new(&config.database_path));
    backend
        .init()
        .await
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;

    let (bus, receiver) = PersistenceBus::new(config.engine.persistence_capacity);
    PersistenceWorker::new(Arc::clone(&backend)).spawn(receiver);

    let mut engine = Engine::new(config.engine.clone()).with_persistence(bus.clone());
    seed_todays_totals(&mut engine, backend.as_ref()).await;

    Ok(AppState::new(engine.spawn(), backend, bus))
}

async fn seed_todays_totals(engine: &mut Engine, backend: &dyn TelemetryBackend) {
    let query = AggregateQuery::new(
        &MetricKind::ALL,
        server_clock().today_range(),
        GroupBy::LinesType,
    );

    match backend.query_aggregate(&query).await {
        Ok(rows) => {
            let seeded = engine.seed_cumulative(&rows);
            tracing::info!("Seeded cumulative totals from {} stored aggregates", seeded);
        }
        Err(error) => {
            tracing::warn!("Starting with empty totals, could not read today's rows: {}", error);
        }
    }
}

pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let state = web::Data::new(build_state(&config).await?);

    tracing::info!("OTLP endpoints: POST /v1/metrics, POST /v1/logs");
    tracing::info!("Live stream: GET /api/stream");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(TracingMiddleware)
            .wrap(Cors::permissive())
            .configure(app_config)
    })
    .bind((config.host.as_str(), config.port))
    .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?
    .run()
    .await?;

    tracing::info!("Telemetry server stopped");
    Ok(())
}
