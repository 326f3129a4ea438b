//! Source-control provider seam.
//!
//! [`ProviderOAuthClient`] covers both the OAuth handshake and the repository
//! calls made on a user's behalf. [`github::GithubClient`] is the production
//! implementation.

pub mod github;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::provider::{
    BranchRef, CommitFile, FileEntry, ProviderIdentity, PullRequest, RepoId, Repository,
};

/// Provider errors.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Provider is not configured: {0}")]
    NotConfigured(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether a retry of the same call may succeed.
    ///
    /// Timeouts are excluded: the call may have completed on the provider side.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited(_) | ProviderError::Transport(_) => true,
            ProviderError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// A decrypted provider access token.
#[derive(Clone)]
pub struct ProviderCredential {
    pub access_token: String,
}

impl ProviderCredential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }
}

impl std::fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredential")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Result of a successful code exchange.
#[derive(Debug, Clone)]
pub struct ProviderGrant {
    pub credential: ProviderCredential,
    pub identity: ProviderIdentity,
}

#[async_trait]
pub trait ProviderOAuthClient: Send + Sync {
    /// Authorization URL carrying `state`.
    fn authorize_url(&self, state: &str) -> Result<String, ProviderError>;

    /// Exchange an authorization code for a credential and fetch the identity.
    async fn exchange_code(&self, code: &str) -> Result<ProviderGrant, ProviderError>;

    async fn list_repos(&self, cred: &ProviderCredential) -> Result<Vec<Repository>, ProviderError>;

    /// Directory listing; `path` is empty for the repository root.
    async fn list_files(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        path: &str,
    ) -> Result<Vec<FileEntry>, ProviderError>;

    /// Decoded contents of one file on the default branch.
    async fn get_file(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        path: &str,
    ) -> Result<String, ProviderError>;

    async fn get_repository(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
    ) -> Result<Repository, ProviderError>;

    /// `None` when the branch does not exist.
    async fn get_branch(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        branch: &str,
    ) -> Result<Option<BranchRef>, ProviderError>;

    async fn create_branch(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        branch: &str,
        from_sha: &str,
    ) -> Result<BranchRef, ProviderError>;

    /// Write `files` as one commit on top of `base_sha` and force-move
    /// `branch` to it. Returns the new commit SHA.
    async fn commit_files(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        branch: &str,
        base_sha: &str,
        files: &[CommitFile],
        message: &str,
    ) -> Result<String, ProviderError>;

    async fn find_open_pull_request(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        head: &str,
    ) -> Result<Option<PullRequest>, ProviderError>;

    /// A closed or merged pull request from `head` with exactly `title`.
    async fn find_closed_pull_request(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        head: &str,
        title: &str,
    ) -> Result<Option<PullRequest>, ProviderError>;

    async fn open_pull_request(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, ProviderError>;
}

/// Bound a provider call by `deadline`.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(deadline)),
    }
}
