use actix_web::{web, HttpResponse};
use telemetry_engine::LogFilter;

use crate::error::Result;
use crate::state::AppState;

const DEFAULT_LOG_LIMIT: usize = 100;

/// `GET /api/logs?event=&from=&to=&limit=`
pub async fn get_logs(
    query: web::Query<LogFilter>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let mut filter = query.into_inner();
    filter.limit.get_or_insert(DEFAULT_LOG_LIMIT);

    let logs = state.engine.logs(filter).await?;
    Ok(HttpResponse::Ok().json(logs))
}

pub async fn get_log_summary(state: web::Data<AppState>) -> Result<HttpResponse> {
    let summary = state.engine.log_summary().await?;
    Ok(HttpResponse::Ok().json(summary))
}
