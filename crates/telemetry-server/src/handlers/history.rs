use actix_web::{web, HttpResponse};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use telemetry_engine::rollup::{model_breakdown_from, token_types_from};
use telemetry_engine::{
    AggregateQuery, GroupBy, HistoricalSeries, LocalClock, MetricKind, ModelTokenBreakdown,
    Period, RecentChartData, SessionMetrics, SessionTotals, TimeRange,
};

use super::server_clock;
use crate::error::{AppError, Result};
use crate::state::AppState;

const RECENT_WINDOW_MINUTES: i64 = 10;

const HISTORY_METRICS: [MetricKind; 3] = [
    MetricKind::CostUsage,
    MetricKind::TokenUsage,
    MetricKind::LinesOfCode,
];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub period: Option<String>,
    /// Browser `Date#getTimezoneOffset()`: minutes to add to local time to reach UTC.
    pub timezone_offset: Option<i32>,
}

impl HistoryQuery {
    fn period(&self) -> Result<Period> {
        match self.period.as_deref() {
            None | Some("") => Ok(Period::default()),
            Some(value) => value.parse().map_err(AppError::BadRequest),
        }
    }

    fn clock(&self) -> LocalClock {
        match self.timezone_offset {
            Some(offset) => LocalClock::from_browser_offset(Utc::now(), offset),
            None => server_clock(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PeriodModelTokens {
    #[serde(flatten)]
    breakdown: ModelTokenBreakdown,
    period: Period,
}

/// `GET /api/metrics/recent-chart-data`: stored cost, token and lines rows
/// from the last ten minutes.
pub async fn get_recent_chart_data(state: web::Data<AppState>) -> Result<HttpResponse> {
    let names: Vec<String> = HISTORY_METRICS
        .iter()
        .map(|kind| kind.as_str().to_string())
        .collect();
    let since = Utc::now() - Duration::minutes(RECENT_WINDOW_MINUTES);

    let points = state
        .backend
        .query_points(&names, TimeRange::since(since))
        .await
        .map_err(AppError::backend("Failed to fetch recent chart data"))?;

    Ok(HttpResponse::Ok().json(RecentChartData::from_points(&points)))
}

/// `GET /api/metrics/historical?period=&timezoneOffset=`
pub async fn get_historical(
    query: web::Query<HistoryQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let period = query.period()?;
    let clock = query.clock();

    let aggregate = AggregateQuery::new(&HISTORY_METRICS, clock.history_range(period), GroupBy::Day)
        .with_utc_offset(clock.utc_offset_minutes);
    let rows = state
        .backend
        .query_aggregate(&aggregate)
        .await
        .map_err(AppError::backend("Failed to fetch historical data"))?;

    Ok(HttpResponse::Ok().json(HistoricalSeries::build(period, &rows)))
}

/// Token-type totals for the current day, week or month.
pub async fn get_historical_token_details(
    query: web::Query<HistoryQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let period = query.period()?;
    let clock = query.clock();

    let aggregate = AggregateQuery::new(
        &[MetricKind::TokenUsage],
        clock.current_period_range(period),
        GroupBy::TokenType,
    );
    let rows = state
        .backend
        .query_aggregate(&aggregate)
        .await
        .map_err(AppError::backend("Failed to fetch historical token details"))?;

    Ok(HttpResponse::Ok().json(json!({
        "tokenTypes": token_types_from(&rows),
        "period": period,
    })))
}

/// Per-model token shares over today, the trailing week or the current month.
pub async fn get_historical_model_tokens(
    query: web::Query<HistoryQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let period = query.period()?;
    let clock = query.clock();

    let aggregate = AggregateQuery::new(
        &[MetricKind::TokenUsage],
        clock.trailing_range(period),
        GroupBy::Model,
    );
    let rows = state
        .backend
        .query_aggregate(&aggregate)
        .await
        .map_err(AppError::backend("Failed to fetch historical model tokens"))?;

    Ok(HttpResponse::Ok().json(PeriodModelTokens {
        breakdown: model_breakdown_from(&rows),
        period,
    }))
}

/// `GET /api/metrics/session/{session_id}`
pub async fn get_session_detail(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let session_id = path.into_inner();

    let points = state
        .backend
        .session_points(&session_id)
        .await
        .map_err(AppError::backend("Failed to fetch session details"))?;
    let is_active = state.engine.is_session_active(&session_id).await?;

    if points.is_empty() && !is_active {
        return Err(AppError::NotFound(format!("Session '{session_id}' not found")));
    }

    Ok(HttpResponse::Ok().json(json!({
        "sessionId": session_id,
        "sessionMetrics": SessionTotals::from_points(&points),
        "metrics": SessionMetrics::from_points(&points),
        "isActive": is_active,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_period_defaults_to_daily() {
        let query = HistoryQuery::default();
        assert_eq!(query.period().unwrap(), Period::Daily);
    }

    #[test]
    fn unknown_period_is_rejected() {
        let query = HistoryQuery {
            period: Some("hourly".to_string()),
            timezone_offset: None,
        };
        assert!(matches!(query.period(), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn browser_offset_is_inverted() {
        let query = HistoryQuery {
            period: None,
            timezone_offset: Some(300),
        };
        assert_eq!(query.clock().utc_offset_minutes, -300);
    }
}
