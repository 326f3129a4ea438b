//! GitHub browsing and pull request handlers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use testforge_core::models::provider::{CommitFile, RepoId};
use testforge_core::provider::with_deadline;
use testforge_core::workflow::PublishParams;
use tracing::debug;
use uuid::Uuid;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{
    CreatePrRequest, CreatePrResponse, FileEntryResponse, FilesQuery, RepoResponse,
};

/// `owner/name`, or a bare `name` completed with `owner` when one is given.
fn parse_repo(repo: Option<&str>, owner: Option<&str>) -> AppResult<RepoId> {
    let repo = repo
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| AppError::Validation("repo is required".into()))?;
    let full = match owner {
        Some(owner) if !repo.contains('/') => format!("{owner}/{repo}"),
        _ => repo.to_string(),
    };
    full.parse()
        .map_err(|_| AppError::Validation(format!("invalid repository '{repo}'")))
}

/// Bare repository names refer to the signed-in user's own repositories.
pub(crate) async fn resolve_repo(
    state: &AppState,
    subject_id: &str,
    repo: Option<&str>,
) -> AppResult<RepoId> {
    match repo.map(str::trim) {
        Some(name) if !name.is_empty() && !name.contains('/') => {
            let account = state.auth.current_account(subject_id).await?;
            parse_repo(Some(name), Some(&account.username))
        }
        _ => parse_repo(repo, None),
    }
}

fn check_relative_path(path: &str) -> AppResult<()> {
    if path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return Err(AppError::Validation(format!(
            "path '{path}' must be relative and must not contain '..'"
        )));
    }
    Ok(())
}

/// `GET /github/repos`: repositories visible to the signed-in user.
pub async fn list_repos_handler(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> AppResult<Json<Vec<RepoResponse>>> {
    let cred = state.auth.provider_credential(&user.subject_id).await?;
    let repos =
        with_deadline(state.config.provider_timeout, state.provider.list_repos(&cred)).await?;
    Ok(Json(repos.into_iter().map(Into::into).collect()))
}

/// `GET /github/files?repo=owner/name&path=dir`: one directory level.
pub async fn list_files_handler(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Query(query): Query<FilesQuery>,
) -> AppResult<Json<Vec<FileEntryResponse>>> {
    let repo = resolve_repo(&state, &user.subject_id, query.repo.as_deref()).await?;
    let path = query.path.as_deref().unwrap_or("").trim_matches('/');
    check_relative_path(path)?;

    let cred = state.auth.provider_credential(&user.subject_id).await?;
    let entries = with_deadline(
        state.config.provider_timeout,
        state.provider.list_files(&cred, &repo, path),
    )
    .await?;
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

/// `POST /github/create-pr`: publish a job, or a set of files directly.
pub async fn create_pr_handler(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    body: Result<Json<CreatePrRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<CreatePrResponse>)> {
    let Json(body) = body?;
    let repo = resolve_repo(&state, &user.subject_id, body.repo.as_deref()).await?;

    let job_id = body.job_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
    let pr = match job_id {
        Some(job_id) => {
            let job_id = Uuid::parse_str(job_id)
                .map_err(|_| AppError::Validation(format!("invalid jobId '{job_id}'")))?;
            let job = state.workflow.get_job(job_id, &user.subject_id).await?;
            if job.repo != repo {
                return Err(AppError::Validation(format!(
                    "job {job_id} belongs to {}, not {repo}",
                    job.repo
                )));
            }
            let cred = state.auth.provider_credential(&user.subject_id).await?;
            let params = PublishParams {
                branch: body.branch,
                title: body.title,
                description: body.description,
            };
            let job = state
                .workflow
                .publish(job_id, &user.subject_id, &cred, params)
                .await?;
            job.pull_request.ok_or_else(|| {
                AppError::Internal(format!("job {job_id} published without a pull request"))
            })?
        }
        None => {
            let files = body.files.unwrap_or_default();
            if files.is_empty() {
                return Err(AppError::Validation(
                    "files are required when no jobId is given".into(),
                ));
            }
            let branch = body
                .branch
                .filter(|b| !b.trim().is_empty())
                .ok_or_else(|| {
                    AppError::Validation("branch is required when no jobId is given".into())
                })?;
            let mut commit_files = Vec::with_capacity(files.len());
            for f in files {
                if f.path.trim().is_empty() {
                    return Err(AppError::Validation("file path must not be blank".into()));
                }
                check_relative_path(&f.path)?;
                commit_files.push(CommitFile {
                    path: f.path,
                    content: f.content,
                });
            }
            debug!(repo = %repo, branch = %branch, files = commit_files.len(), "direct publish");

            let cred = state.auth.provider_credential(&user.subject_id).await?;
            state
                .workflow
                .publisher()
                .publish(
                    &cred,
                    &repo,
                    &branch,
                    &commit_files,
                    body.title.as_deref().unwrap_or(""),
                    body.description.as_deref().unwrap_or(""),
                )
                .await?
        }
    };

    Ok((StatusCode::CREATED, Json(pr.into())))
}
