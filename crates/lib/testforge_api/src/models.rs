//! Request and response bodies of the HTTP surface.
//!
//! All fields are camelCase on the wire. Core domain types are converted here
//! so handlers never serialize them directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use testforge_core::generation::layout::test_path_for;
use testforge_core::models::auth::{Account, TokenPair};
use testforge_core::models::job::{GenerationJob, JobFailure, PublishRequest, PullRequestRef};
use testforge_core::models::provider::{FileEntry, Repository};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    /// Relative frontend path to return to after login.
    pub redirect: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by the provider when the user denies access.
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    /// Falls back to the refresh cookie when absent.
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
}

impl From<&TokenPair> for TokenResponse {
    fn from(pair: &TokenPair) -> Self {
        Self {
            access_token: pair.access_token.clone(),
            refresh_token: pair.refresh_token.clone(),
            expires_in: pair.expires_in(),
            token_type: "Bearer".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

impl From<Account> for UserResponse {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            username: account.username,
            email: account.email,
            name: account.display_name,
            avatar_url: account.avatar_url,
        }
    }
}

// ---------------------------------------------------------------------------
// GitHub browsing & pull requests
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoResponse {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    pub private: bool,
    pub default_branch: String,
    pub owner: String,
}

impl From<Repository> for RepoResponse {
    fn from(r: Repository) -> Self {
        Self {
            id: r.id,
            name: r.name,
            full_name: r.full_name,
            private: r.private,
            default_branch: r.default_branch,
            owner: r.owner,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    pub repo: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileEntryResponse {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
    pub size: u64,
}

impl From<FileEntry> for FileEntryResponse {
    fn from(e: FileEntry) -> Self {
        Self {
            name: e.name,
            path: e.path,
            kind: e.kind.as_str().to_string(),
            sha: e.sha,
            size: e.size,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PrFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePrRequest {
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Publish this job; otherwise `files` are published directly.
    pub job_id: Option<String>,
    pub files: Option<Vec<PrFile>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatePrResponse {
    /// Pull request number.
    pub id: u64,
    pub url: String,
    pub branch: String,
}

impl From<PullRequestRef> for CreatePrResponse {
    fn from(pr: PullRequestRef) -> Self {
        Self {
            id: pr.number,
            url: pr.url,
            branch: pr.branch,
        }
    }
}

// ---------------------------------------------------------------------------
// Test cases & jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub repo: Option<String>,
    pub files: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub job_id: Option<String>,
    /// Source path → edited test content.
    pub edits: Option<BTreeMap<String, String>>,
}

/// Reply to a save: the updated job, or an acknowledgement when the request
/// named no job.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SaveResponse {
    Job(Box<JobResponse>),
    Empty { saved: usize },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: String,
    pub repo: String,
    pub state: String,
    pub selected_files: Vec<String>,
    /// Source path → test file path the tests are published at.
    pub test_paths: BTreeMap<String, String>,
    pub generated_test_cases: BTreeMap<String, String>,
    pub edited_test_cases: BTreeMap<String, String>,
    pub publish_request: Option<PublishRequest>,
    pub pull_request: Option<PullRequestRef>,
    pub failure: Option<JobFailureResponse>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobFailureResponse {
    pub step: String,
    pub kind: String,
    pub message: String,
}

impl From<JobFailure> for JobFailureResponse {
    fn from(f: JobFailure) -> Self {
        Self {
            step: f.step.as_str().to_string(),
            kind: f.kind.as_str().to_string(),
            message: f.message,
        }
    }
}

impl From<GenerationJob> for JobResponse {
    fn from(job: GenerationJob) -> Self {
        Self {
            id: job.id.to_string(),
            repo: job.repo.full_name(),
            state: job.state.as_str().to_string(),
            test_paths: job
                .selected_files
                .iter()
                .map(|p| (p.clone(), test_path_for(p)))
                .collect(),
            selected_files: job.selected_files,
            generated_test_cases: job.generated_test_cases,
            edited_test_cases: job.edited_test_cases,
            publish_request: job.publish_request,
            pull_request: job.pull_request,
            failure: job.failure.map(Into::into),
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store: String,
    pub engine: String,
}
