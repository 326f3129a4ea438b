//! Test case generation, review and job handlers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use uuid::Uuid;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::handlers::github::resolve_repo;
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{GenerateRequest, JobListResponse, JobResponse, SaveRequest, SaveResponse};

/// Unknown or malformed job ids are reported the same way.
fn path_job_id(id: &str) -> AppResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| AppError::NotFound(format!("job {id}")))
}

/// `POST /testcases/generate`: fetch the files and generate tests for them.
///
/// Runs fetch and generation before responding. If either fails, the job is
/// kept in `failed` (see `GET /testcases/jobs`) and the error is returned.
pub async fn generate_handler(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> AppResult<Json<JobResponse>> {
    let Json(body) = body?;
    let repo = resolve_repo(&state, &user.subject_id, body.repo.as_deref()).await?;
    let files = body.files.unwrap_or_default();
    if files.is_empty() {
        return Err(AppError::Validation("at least one file is required".into()));
    }

    let cred = state.auth.provider_credential(&user.subject_id).await?;
    let job = state
        .workflow
        .submit(&user.subject_id, &repo.full_name(), files, &cred)
        .await?;
    Ok(Json(job.into()))
}

/// `POST /testcases/save`: store edited test cases for review.
///
/// A body naming no job and carrying no edits has nothing to save and is
/// acknowledged as is.
pub async fn save_handler(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    body: Result<Json<SaveRequest>, JsonRejection>,
) -> AppResult<Json<SaveResponse>> {
    let Json(body) = body?;
    let edits = body.edits.unwrap_or_default();
    let job_id = body.job_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
    let Some(job_id) = job_id else {
        if edits.is_empty() {
            return Ok(Json(SaveResponse::Empty { saved: 0 }));
        }
        return Err(AppError::Validation("jobId is required when saving edits".into()));
    };
    let job_id = Uuid::parse_str(job_id)
        .map_err(|_| AppError::Validation(format!("invalid jobId '{job_id}'")))?;

    let job = state
        .workflow
        .save_edits(job_id, &user.subject_id, edits)
        .await?;
    Ok(Json(SaveResponse::Job(Box::new(job.into()))))
}

/// `GET /testcases/jobs`: the caller's jobs, newest first.
pub async fn list_jobs_handler(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> AppResult<Json<JobListResponse>> {
    let jobs = state.workflow.list_jobs(&user.subject_id).await?;
    Ok(Json(JobListResponse {
        jobs: jobs.into_iter().map(Into::into).collect(),
    }))
}

/// `GET /testcases/jobs/{id}`
pub async fn get_job_handler(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> AppResult<Json<JobResponse>> {
    let job = state
        .workflow
        .get_job(path_job_id(&id)?, &user.subject_id)
        .await?;
    Ok(Json(job.into()))
}

/// `POST /testcases/jobs/{id}/retry`: re-run the step a failed job stopped at.
pub async fn retry_job_handler(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> AppResult<Json<JobResponse>> {
    let job_id = path_job_id(&id)?;
    // Ownership is checked before the provider token is decrypted.
    state.workflow.get_job(job_id, &user.subject_id).await?;
    let cred = state.auth.provider_credential(&user.subject_id).await?;
    let job = state
        .workflow
        .retry_job(job_id, &user.subject_id, &cred)
        .await?;
    Ok(Json(job.into()))
}
