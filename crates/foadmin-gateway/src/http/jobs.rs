//! Job administration endpoints under `/api/admin/system/job`.
//!
//! Ids in paths are the numeric primary key. List endpoints return
//! `{"items", "total", "page", "size"}`; actions return `{"message"}`.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use foadmin_scheduler::{
    service::{DEFAULT_CLEAR_DAYS, DEFAULT_JOB_PAGE_SIZE, DEFAULT_LOG_PAGE_SIZE},
    Job, JobFilter, JobLog, JobPatch, JobStatus, JobType, LogFilter, LogStatus, NewJob, Page,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::{api_error, ApiResult, Message};
use crate::app::AppState;

fn default_page() -> u32 {
    1
}
fn default_job_size() -> u32 {
    DEFAULT_JOB_PAGE_SIZE
}
fn default_log_size() -> u32 {
    DEFAULT_LOG_PAGE_SIZE
}
fn default_days() -> i64 {
    DEFAULT_CLEAR_DAYS
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_job_size")]
    pub size: u32,
    pub name: Option<String>,
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
}

#[derive(Debug, Deserialize)]
pub struct LogListQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_log_size")]
    pub size: u32,
    pub job_id: Option<String>,
    pub status: Option<LogStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    #[serde(default = "default_days")]
    pub days: i64,
}

#[derive(Debug, Serialize)]
pub struct Cleared {
    pub message: String,
    pub deleted: usize,
}

/// GET /list
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JobListQuery>,
) -> ApiResult<Page<Job>> {
    let filter = JobFilter {
        name: q.name,
        job_type: q.job_type,
        status: q.status,
    };
    state
        .jobs
        .list_jobs(&filter, q.page, q.size)
        .map(Json)
        .map_err(api_error)
}

/// GET /{id}
pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<Job> {
    state.jobs.get_job(id).map(Json).map_err(api_error)
}

/// POST /create
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewJob>,
) -> ApiResult<Job> {
    state.jobs.create_job(body).map(Json).map_err(api_error)
}

/// PUT /update/{id}
pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(patch): Json<JobPatch>,
) -> ApiResult<Job> {
    state.jobs.update_job(id, patch).map(Json).map_err(api_error)
}

/// DELETE /delete/{id}
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Message> {
    state.jobs.delete_job(id).map_err(api_error)?;
    Ok(Message::new("Job deleted"))
}

/// POST /pause/{id}
pub async fn pause_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Message> {
    state.jobs.pause_job(id).map_err(api_error)?;
    Ok(Message::new("Job paused"))
}

/// POST /resume/{id}
pub async fn resume_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Message> {
    state.jobs.resume_job(id).map_err(api_error)?;
    Ok(Message::new("Job resumed"))
}

/// POST /run/{id}. Submits one execution and returns without waiting.
pub async fn run_job(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<Message> {
    let handle = state.jobs.run_job_now(id).map_err(api_error)?;
    // The outcome is in the job log; only a failed log write needs reporting.
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(job = id, error = %e, "manual run could not be recorded"),
            Err(e) => warn!(job = id, error = %e, "manual run task aborted"),
        }
    });
    Ok(Message::new("Job submitted for execution"))
}

/// GET /logs
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LogListQuery>,
) -> ApiResult<Page<JobLog>> {
    let filter = LogFilter {
        job_id: q.job_id,
        status: q.status,
    };
    state
        .jobs
        .list_logs(&filter, q.page, q.size)
        .map(Json)
        .map_err(api_error)
}

/// DELETE /logs/clear?days=N
pub async fn clear_logs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ClearQuery>,
) -> ApiResult<Cleared> {
    let deleted = state.jobs.clear_logs(q.days).map_err(api_error)?;
    Ok(Json(Cleared {
        message: format!("Cleared {deleted} job logs"),
        deleted,
    }))
}
