use std::collections::BTreeMap;

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::{json, Value};
use telemetry_engine::{ActivityRequest, IngestReport};

use crate::error::{AppError, Result};
use crate::middleware::extract_trace_id;
use crate::state::AppState;

/// `POST /v1/metrics`
pub async fn ingest_metrics(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let envelope = parse_envelope(&body, "Invalid metric data")?;
    let activity = ActivityRequest {
        body: envelope.clone(),
        headers: header_map(&req),
        method: req.method().to_string(),
        url: req.uri().to_string(),
    };

    let report = state.engine.ingest_metrics(&envelope, Some(activity)).await?;
    log_report(&req, "metrics", report);
    Ok(success())
}

/// `POST /v1/logs`
pub async fn ingest_logs(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let envelope = parse_envelope(&body, "Invalid log data")?;
    let report = state.engine.ingest_logs(&envelope).await?;
    log_report(&req, "logs", report);
    Ok(success())
}

fn parse_envelope(body: &[u8], context: &str) -> Result<Value> {
    serde_json::from_slice(body).map_err(|error| AppError::BadRequest(format!("{context}: {error}")))
}

fn header_map(req: &HttpRequest) -> BTreeMap<String, String> {
    req.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn log_report(req: &HttpRequest, signal: &str, report: IngestReport) {
    tracing::debug!(
        trace_id = %extract_trace_id(req).unwrap_or_default(),
        "Ingested {}: {} accepted, {} dropped",
        signal,
        report.accepted,
        report.dropped
    );
}

fn success() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "success" }))
}
