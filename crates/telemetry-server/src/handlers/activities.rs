use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::error::Result;
use crate::state::AppState;

const DEFAULT_ACTIVITY_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct ActivitiesQuery {
    pub limit: Option<usize>,
}

/// `GET /api/activities?limit=50`, newest first.
pub async fn get_activities(
    query: web::Query<ActivitiesQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    let activities = state.engine.activities(limit).await?;
    Ok(HttpResponse::Ok().json(activities))
}
