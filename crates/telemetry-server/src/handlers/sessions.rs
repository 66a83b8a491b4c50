use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use telemetry_engine::{SessionHistory, SessionRecord};

use crate::error::{AppError, Result};
use crate::state::AppState;

const SESSION_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub user_email: Option<String>,
    pub models_used: Vec<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// `GET /api/sessions`: live sessions first, enriched and extended with the
/// most recently stored ones.
pub async fn get_sessions(state: web::Data<AppState>) -> Result<HttpResponse> {
    let active = state.engine.sessions().await?;
    let history = state
        .backend
        .recent_sessions(SESSION_HISTORY_LIMIT)
        .await
        .map_err(AppError::backend("Failed to fetch sessions"))?;

    Ok(HttpResponse::Ok().json(json!({ "sessions": merge_sessions(active, history) })))
}

pub fn merge_sessions(active: Vec<SessionRecord>, history: Vec<SessionHistory>) -> Vec<SessionView> {
    let mut sessions: Vec<SessionView> = active
        .into_iter()
        .map(|record| SessionView {
            session_id: record.session_id,
            last_seen: record.last_seen_at,
            is_active: true,
            user_email: None,
            models_used: Vec::new(),
            last_updated: None,
        })
        .collect();

    for stored in history {
        match sessions
            .iter_mut()
            .find(|view| view.session_id == stored.session_id)
        {
            Some(view) => {
                view.user_email = stored.user_email;
                view.models_used = stored.models_used;
                view.last_updated = Some(stored.last_updated);
            }
            None => sessions.push(SessionView {
                session_id: stored.session_id,
                last_seen: stored.last_updated,
                is_active: false,
                user_email: stored.user_email,
                models_used: stored.models_used,
                last_updated: Some(stored.last_updated),
            }),
        }
    }

    sessions.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
    sessions
}
