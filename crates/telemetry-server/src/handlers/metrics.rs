use actix_web::{web, HttpResponse};
use serde_json::json;
use telemetry_engine::rollup::token_types_from;
use telemetry_engine::{AggregateQuery, GroupBy, MetricKind, SeriesFilter};

use super::server_clock;
use crate::error::{AppError, Result};
use crate::state::AppState;

/// `GET /api/metrics?metric=&from=&to=`
pub async fn get_series(
    query: web::Query<SeriesFilter>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let series = state.engine.series(query.into_inner()).await?;
    Ok(HttpResponse::Ok().json(series))
}

pub async fn get_summary(state: web::Data<AppState>) -> Result<HttpResponse> {
    let summary = state.engine.summary().await?;
    Ok(HttpResponse::Ok().json(summary))
}

pub async fn get_model_tokens(state: web::Data<AppState>) -> Result<HttpResponse> {
    let breakdown = state.engine.model_tokens().await?;
    Ok(HttpResponse::Ok().json(breakdown))
}

/// Live token-type totals. Falls back to today's stored rows when the live
/// series carries no typed tokens, e.g. right after a restart.
pub async fn get_token_details(state: web::Data<AppState>) -> Result<HttpResponse> {
    let live = state.engine.token_types().await?;
    let token_types = if live.is_empty() {
        let query = AggregateQuery::new(
            &[MetricKind::TokenUsage],
            server_clock().today_range(),
            GroupBy::TokenType,
        );
        let rows = state
            .backend
            .query_aggregate(&query)
            .await
            .map_err(AppError::backend("Failed to fetch token details"))?;
        token_types_from(&rows)
    } else {
        live
    };

    Ok(HttpResponse::Ok().json(json!({ "tokenTypes": token_types })))
}
