use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde_json::json;

use crate::state::AppState;

/// `GET /health`: always 200; backend trouble shows up in the body.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let subscribers = state.engine.subscriber_count().await.ok();

    let backend = match state.backend.row_count().await {
        Ok(count) => json!({ "status": "connected", "metricsCount": count }),
        Err(error) => {
            tracing::warn!("Health check could not reach the database: {}", error);
            json!({ "status": "error", "error": error.to_string() })
        }
    };
    let status = if subscribers.is_some() && backend["status"] == "connected" {
        "healthy"
    } else {
        "degraded"
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": Utc::now(),
        "backend": backend,
        "subscribers": subscribers,
        "droppedRows": state.persistence.dropped_count(),
    }))
}
