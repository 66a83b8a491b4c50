use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use telemetry_engine::{BackendError, EngineError};
use thiserror::Error;

pub type Result<T, E = AppError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: BackendError,
    },
}

impl AppError {
    /// Wrap a backend failure with the operation that triggered it.
    pub fn backend(context: &'static str) -> impl FnOnce(BackendError) -> Self {
        move |source| AppError::Backend { context, source }
    }
}

#[derive(Serialize)]
struct JsonError {
    error: String,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Engine(EngineError::Normalize(_)) => StatusCode::BAD_REQUEST,
            AppError::Engine(EngineError::Closed) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        if status_code.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        HttpResponse::build(status_code).json(JsonError {
            error: self.to_string(),
        })
    }
}
