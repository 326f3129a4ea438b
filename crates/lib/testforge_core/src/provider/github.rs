//! GitHub implementation of [`ProviderOAuthClient`].
//!
//! OAuth app web flow for login, REST v3 for everything else. Branch and
//! commit writes go through the git data API so that every publish lands as
//! exactly one commit regardless of how many files it carries.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::{ProviderCredential, ProviderError, ProviderGrant, ProviderOAuthClient};
use crate::models::provider::{
    BranchRef, CommitFile, FileEntry, FileKind, ProviderIdentity, PullRequest, PullRequestState,
    RepoId, Repository,
};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_OAUTH_URL: &str = "https://github.com";
/// OAuth scope: read/write access to the user's repositories.
pub const DEFAULT_SCOPE: &str = "repo";

const USER_AGENT: &str = concat!("testforge/", env!("CARGO_PKG_VERSION"));

/// GitHub OAuth app and API endpoints.
#[derive(Debug, Clone)]
pub struct GithubConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub api_url: String,
    pub oauth_url: String,
    pub scope: String,
}

impl GithubConfig {
    pub fn new(redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: redirect_uri.into(),
            api_url: DEFAULT_API_URL.to_string(),
            oauth_url: DEFAULT_OAUTH_URL.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
        }
    }

    fn credentials(&self) -> Result<(&str, &str), ProviderError> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Ok((id, secret)),
            _ => Err(ProviderError::NotConfigured(
                "GITHUB_CLIENT_ID and GITHUB_CLIENT_SECRET are required".to_string(),
            )),
        }
    }
}

pub struct GithubClient {
    config: GithubConfig,
    http: Client,
}

impl GithubClient {
    pub fn new(config: GithubConfig) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    /// Whether OAuth client credentials are present.
    pub fn is_configured(&self) -> bool {
        self.config.credentials().is_ok()
    }

    /// API URL built from path segments; each segment is percent-encoded.
    fn api_url<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.config.api_url)
            .map_err(|e| ProviderError::NotConfigured(format!("GITHUB_API_URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::NotConfigured("GITHUB_API_URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn repo_url<'a>(
        &self,
        repo: &'a RepoId,
        rest: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url, ProviderError> {
        let head = ["repos", repo.owner.as_str(), repo.name.as_str()];
        self.api_url(head.into_iter().chain(rest))
    }

    fn authed(&self, req: RequestBuilder, cred: &ProviderCredential) -> RequestBuilder {
        req.bearer_auth(&cred.access_token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, ProviderError> {
        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("GitHub request failed: {e}")))?;
        check_status(resp).await
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ProviderError> {
        self.send(req)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("GitHub response parse error: {e}")))
    }

    async fn list_pull_requests(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        head: &str,
        state: &str,
    ) -> Result<Vec<GhPull>, ProviderError> {
        let url = self.repo_url(repo, ["pulls"])?;
        let head_filter = format!("{}:{}", repo.owner, head);
        let req = self.authed(self.http.get(url), cred).query(&[
            ("state", state),
            ("head", head_filter.as_str()),
            ("per_page", "100"),
        ]);
        self.send_json(req).await
    }
}

/// Map a non-success response onto [`ProviderError`].
async fn check_status(resp: Response) -> Result<Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let rate_exhausted = resp
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "0");
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<no body>".to_string());
    Err(classify_status(status, rate_exhausted, body))
}

fn classify_status(status: StatusCode, rate_exhausted: bool, body: String) -> ProviderError {
    let message = error_message(&body);
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(message),
        StatusCode::UNAUTHORIZED => ProviderError::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(message),
        StatusCode::FORBIDDEN
            if rate_exhausted || message.to_ascii_lowercase().contains("rate limit") =>
        {
            ProviderError::RateLimited(message)
        }
        StatusCode::FORBIDDEN => ProviderError::Forbidden(message),
        other => ProviderError::Upstream {
            status: other.as_u16(),
            message,
        },
    }
}

/// GitHub error bodies are `{"message": "..."}`; fall back to the raw body.
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct GhErrorBody {
        message: String,
    }
    serde_json::from_str::<GhErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.to_string())
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Deserialize)]
struct GhTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct GhUser {
    id: u64,
    login: String,
    name: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Deserialize)]
struct GhOwner {
    login: String,
}

#[derive(Deserialize)]
struct GhRepo {
    id: u64,
    name: String,
    full_name: String,
    private: bool,
    default_branch: Option<String>,
    owner: GhOwner,
}

impl From<GhRepo> for Repository {
    fn from(r: GhRepo) -> Self {
        Repository {
            id: r.id,
            name: r.name,
            full_name: r.full_name,
            private: r.private,
            default_branch: r.default_branch.unwrap_or_else(|| "main".to_string()),
            owner: r.owner.login,
        }
    }
}

#[derive(Deserialize)]
struct GhContent {
    name: String,
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    size: u64,
    content: Option<String>,
    encoding: Option<String>,
}

impl From<GhContent> for FileEntry {
    fn from(c: GhContent) -> Self {
        FileEntry {
            kind: FileKind::parse(&c.kind).unwrap_or(FileKind::File),
            name: c.name,
            path: c.path,
            sha: c.sha,
            size: c.size,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GhContents {
    Listing(Vec<GhContent>),
    Single(GhContent),
}

#[derive(Deserialize)]
struct GhObject {
    sha: String,
}

#[derive(Deserialize)]
struct GhRef {
    object: GhObject,
}

#[derive(Deserialize)]
struct GhCommit {
    sha: String,
    tree: GhObject,
}

#[derive(Serialize)]
struct GhTreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct GhBranchName {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Deserialize)]
struct GhPull {
    number: u64,
    html_url: String,
    title: String,
    state: String,
    merged_at: Option<String>,
    head: GhBranchName,
    base: GhBranchName,
}

impl From<GhPull> for PullRequest {
    fn from(p: GhPull) -> Self {
        let state = if p.merged_at.is_some() {
            PullRequestState::Merged
        } else if p.state == "open" {
            PullRequestState::Open
        } else {
            PullRequestState::Closed
        };
        PullRequest {
            number: p.number,
            url: p.html_url,
            title: p.title,
            head_branch: p.head.name,
            base_branch: p.base.name,
            state,
        }
    }
}

fn decode_content(content: &str) -> Result<String, ProviderError> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| ProviderError::InvalidResponse(format!("file content is not base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| ProviderError::InvalidResponse("file content is not UTF-8".to_string()))
}

// =============================================================================
// Trait impl
// =============================================================================

#[async_trait]
impl ProviderOAuthClient for GithubClient {
    fn authorize_url(&self, state: &str) -> Result<String, ProviderError> {
        let (client_id, _) = self.config.credentials()?;
        let mut url = Url::parse(&self.config.oauth_url)
            .map_err(|e| ProviderError::NotConfigured(format!("GitHub OAuth URL: {e}")))?;
        url.set_path("/login/oauth/authorize");
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scope)
            .append_pair("state", state);
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderGrant, ProviderError> {
        let (client_id, client_secret) = self.config.credentials()?;
        let mut token_url = Url::parse(&self.config.oauth_url)
            .map_err(|e| ProviderError::NotConfigured(format!("GitHub OAuth URL: {e}")))?;
        token_url.set_path("/login/oauth/access_token");

        let params = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];
        let req = self
            .http
            .post(token_url)
            .header("Accept", "application/json")
            .form(&params);
        let token: GhTokenResponse = self.send_json(req).await?;

        // GitHub reports a bad code with 200 and an `error` field.
        let access_token = match (token.access_token, token.error) {
            (Some(t), None) if !t.is_empty() => t,
            (_, error) => {
                let reason = token
                    .error_description
                    .or(error)
                    .unwrap_or_else(|| "no access token in response".to_string());
                warn!(reason = %reason, "GitHub code exchange rejected");
                return Err(ProviderError::Unauthorized(reason));
            }
        };
        let credential = ProviderCredential::new(access_token);

        let user: GhUser = self
            .send_json(self.authed(self.http.get(self.api_url(["user"])?), &credential))
            .await?;
        debug!(login = %user.login, "GitHub identity resolved");

        Ok(ProviderGrant {
            credential,
            identity: ProviderIdentity {
                id: user.id.to_string(),
                login: user.login,
                name: user.name,
                email: user.email,
                avatar_url: user.avatar_url,
            },
        })
    }

    async fn list_repos(&self, cred: &ProviderCredential) -> Result<Vec<Repository>, ProviderError> {
        let req = self
            .authed(self.http.get(self.api_url(["user", "repos"])?), cred)
            .query(&[("per_page", "100"), ("sort", "updated")]);
        let repos: Vec<GhRepo> = self.send_json(req).await?;
        Ok(repos.into_iter().map(Repository::from).collect())
    }

    async fn list_files(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        path: &str,
    ) -> Result<Vec<FileEntry>, ProviderError> {
        let url = self.repo_url(repo, std::iter::once("contents").chain(split_path(path)))?;
        let contents: GhContents = self.send_json(self.authed(self.http.get(url), cred)).await?;
        Ok(match contents {
            GhContents::Listing(items) => items.into_iter().map(FileEntry::from).collect(),
            GhContents::Single(item) => vec![FileEntry::from(item)],
        })
    }

    async fn get_file(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        path: &str,
    ) -> Result<String, ProviderError> {
        let url = self.repo_url(repo, std::iter::once("contents").chain(split_path(path)))?;
        let contents: GhContents = self.send_json(self.authed(self.http.get(url), cred)).await?;
        let GhContents::Single(item) = contents else {
            return Err(ProviderError::NotFound(format!("{path} is a directory")));
        };
        match (item.content.as_deref(), item.encoding.as_deref()) {
            (Some(content), Some("base64")) => decode_content(content),
            (Some(content), None) => Ok(content.to_string()),
            _ => Err(ProviderError::InvalidResponse(format!(
                "no inline content for {path}"
            ))),
        }
    }

    async fn get_repository(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
    ) -> Result<Repository, ProviderError> {
        let url = self.repo_url(repo, std::iter::empty())?;
        let gh: GhRepo = self.send_json(self.authed(self.http.get(url), cred)).await?;
        Ok(gh.into())
    }

    async fn get_branch(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        branch: &str,
    ) -> Result<Option<BranchRef>, ProviderError> {
        let url = self.repo_url(repo, ["git", "ref", "heads"].into_iter().chain(split_path(branch)))?;
        match self
            .send_json::<GhRef>(self.authed(self.http.get(url), cred))
            .await
        {
            Ok(r) => Ok(Some(BranchRef {
                name: branch.to_string(),
                sha: r.object.sha,
            })),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_branch(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        branch: &str,
        from_sha: &str,
    ) -> Result<BranchRef, ProviderError> {
        let url = self.repo_url(repo, ["git", "refs"])?;
        let body = serde_json::json!({
            "ref": format!("refs/heads/{branch}"),
            "sha": from_sha,
        });
        let created: GhRef = self
            .send_json(self.authed(self.http.post(url), cred).json(&body))
            .await?;
        Ok(BranchRef {
            name: branch.to_string(),
            sha: created.object.sha,
        })
    }

    async fn commit_files(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        branch: &str,
        base_sha: &str,
        files: &[CommitFile],
        message: &str,
    ) -> Result<String, ProviderError> {
        let base: GhCommit = self
            .send_json(self.authed(
                self.http.get(self.repo_url(repo, ["git", "commits", base_sha])?),
                cred,
            ))
            .await?;

        let entries: Vec<GhTreeEntry<'_>> = files
            .iter()
            .map(|f| GhTreeEntry {
                path: &f.path,
                mode: "100644",
                kind: "blob",
                content: &f.content,
            })
            .collect();
        let tree: GhObject = self
            .send_json(
                self.authed(self.http.post(self.repo_url(repo, ["git", "trees"])?), cred)
                    .json(&serde_json::json!({ "base_tree": base.tree.sha, "tree": entries })),
            )
            .await?;

        let commit: GhCommit = self
            .send_json(
                self.authed(self.http.post(self.repo_url(repo, ["git", "commits"])?), cred)
                    .json(&serde_json::json!({
                        "message": message,
                        "tree": tree.sha,
                        "parents": [base.sha],
                    })),
            )
            .await?;

        let ref_url = self.repo_url(repo, ["git", "refs", "heads"].into_iter().chain(split_path(branch)))?;
        self.send(
            self.authed(self.http.patch(ref_url), cred)
                .json(&serde_json::json!({ "sha": commit.sha, "force": true })),
        )
        .await?;

        debug!(repo = %repo, branch, sha = %commit.sha, files = files.len(), "committed files");
        Ok(commit.sha)
    }

    async fn find_open_pull_request(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        head: &str,
    ) -> Result<Option<PullRequest>, ProviderError> {
        let pulls = self.list_pull_requests(cred, repo, head, "open").await?;
        Ok(pulls.into_iter().next().map(PullRequest::from))
    }

    async fn find_closed_pull_request(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        head: &str,
        title: &str,
    ) -> Result<Option<PullRequest>, ProviderError> {
        let pulls = self.list_pull_requests(cred, repo, head, "closed").await?;
        Ok(pulls
            .into_iter()
            .find(|p| p.title == title)
            .map(PullRequest::from))
    }

    async fn open_pull_request(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, ProviderError> {
        let url = self.repo_url(repo, ["pulls"])?;
        let payload = serde_json::json!({
            "title": title,
            "head": head,
            "base": base,
            "body": body,
        });
        match self
            .send_json::<GhPull>(self.authed(self.http.post(url), cred).json(&payload))
            .await
        {
            Ok(pr) => Ok(pr.into()),
            // 422 when a pull request for `head` already exists.
            Err(ProviderError::Upstream { status: 422, message }) => {
                match self.find_open_pull_request(cred, repo, head).await? {
                    Some(existing) => Ok(existing),
                    None => Err(ProviderError::Upstream {
                        status: 422,
                        message,
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> GithubClient {
        let mut config = GithubConfig::new("http://localhost:5000/api/v1/auth/github/callback");
        config.client_id = Some("client-id".into());
        config.client_secret = Some("client-secret".into());
        GithubClient::new(config).unwrap()
    }

    #[test]
    fn authorize_url_carries_state_and_scope() {
        let url = configured().authorize_url("abc123").unwrap();
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.host_str(), Some("github.com"));
        assert_eq!(parsed.path(), "/login/oauth/authorize");
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("state".into(), "abc123".into())));
        assert!(pairs.contains(&("scope".into(), "repo".into())));
        assert!(pairs.contains(&("client_id".into(), "client-id".into())));
    }

    #[test]
    fn missing_credentials_is_a_configuration_error() {
        let client = GithubClient::new(GithubConfig::new("http://cb")).unwrap();
        assert!(!client.is_configured());
        assert!(matches!(
            client.authorize_url("s"),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn api_urls_encode_path_segments() {
        let client = configured();
        let repo = RepoId::new("octo", "hello");
        let url = client
            .repo_url(&repo, std::iter::once("contents").chain(split_path("src/my file.py")))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/octo/hello/contents/src/my%20file.py"
        );
        let branch_url = client
            .repo_url(&repo, ["git", "ref", "heads"].into_iter().chain(split_path("testforge/tests-1")))
            .unwrap();
        assert!(branch_url.as_str().ends_with("/git/ref/heads/testforge/tests-1"));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, false, r#"{"message":"Not Found"}"#.into()),
            ProviderError::NotFound(m) if m == "Not Found"
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, true, String::new()),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(
                StatusCode::FORBIDDEN,
                false,
                r#"{"message":"API rate limit exceeded"}"#.into()
            ),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, false, "nope".into()),
            ProviderError::Forbidden(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, false, "bad".into()),
            ProviderError::Upstream { status: 502, .. }
        ));
    }

    #[test]
    fn decodes_wrapped_base64_content() {
        // GitHub wraps base64 content at 60 columns.
        let decoded = decode_content("ZGVmIGFkZChhLCBiKToK\nICAgIHJldHVybiBhICsgYgo=\n").unwrap();
        assert_eq!(decoded, "def add(a, b):\n    return a + b\n");
    }

    #[test]
    fn merged_pull_requests_are_reported_as_merged() {
        let pull = GhPull {
            number: 7,
            html_url: "https://github.com/o/r/pull/7".into(),
            title: "t".into(),
            state: "closed".into(),
            merged_at: Some("2024-01-01T00:00:00Z".into()),
            head: GhBranchName { name: "h".into() },
            base: GhBranchName { name: "main".into() },
        };
        assert_eq!(PullRequest::from(pull).state, PullRequestState::Merged);
    }
}
