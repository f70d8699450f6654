use axum::{http::StatusCode, Json};
use foadmin_scheduler::SchedulerError;
use serde::Serialize;
use tracing::error;

pub mod health;
pub mod jobs;

/// Error body shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: &'static str,
}

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

/// `{"message": ...}` body for action endpoints.
#[derive(Debug, Serialize)]
pub struct Message {
    pub message: String,
}

impl Message {
    pub fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

/// Map a scheduler error onto its HTTP status and JSON body.
pub fn api_error(e: SchedulerError) -> (StatusCode, Json<ApiError>) {
    let status = match &e {
        SchedulerError::Configuration(_)
        | SchedulerError::Resolution { .. }
        | SchedulerError::InvalidArguments(_)
        | SchedulerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SchedulerError::NotFound { .. } => StatusCode::NOT_FOUND,
        SchedulerError::Conflict { .. } => StatusCode::CONFLICT,
        SchedulerError::Persistence(_) => {
            error!(error = %e, "job store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ApiError {
            error: e.to_string(),
            code: e.code(),
        }),
    )
}
